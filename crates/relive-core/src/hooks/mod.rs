//! Lifecycle hooks around a generation's launch and teardown.
//!
//! Startup hooks decide when a freshly launched generation is ready to take
//! over. Shutdown hooks take a replaced generation down and make sure the
//! resources it held are free again. Hooks are referenced by identifier in
//! the configuration and resolved once, against a [`HookRegistry`], before
//! any generation starts.

mod builtin;
mod pipeline;
mod registry;

use std::fmt;

use futures::future::BoxFuture;

use crate::config::DevSettings;
use crate::error::Result;
use crate::execute::ExecutionContext;
use crate::logger::BuildLogger;

pub use builtin::{
    Delay, ForceStop, HealthCheck, HealthCheckNegative, Interrupt, PortFree, TcpPort,
};
pub use pipeline::HookPipeline;
pub use registry::{HookFactory, HookInfo, HookRegistry, ResolvedHook};

/// When a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Startup,
    Shutdown,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::Startup => f.pad("startup"),
            HookKind::Shutdown => f.pad("shutdown"),
        }
    }
}

/// A configured hook after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookDescriptor {
    pub id: String,
    pub kind: HookKind,
    /// Position in the configured list.
    pub order: usize,
}

/// What a hook gets to see while it runs.
#[derive(Clone, Copy)]
pub struct HookContext<'a> {
    pub execution: &'a ExecutionContext,
    pub settings: &'a DevSettings,
    pub logger: &'a dyn BuildLogger,
}

/// A startup or shutdown action.
///
/// Startup hooks return once the generation is ready, or an error if it
/// never will be; the pipeline bounds them with the startup timeout.
/// Shutdown hooks are bounded individually.
pub trait Hook: Send + Sync {
    fn run<'a>(&'a self, cx: HookContext<'a>) -> BoxFuture<'a, Result<()>>;
}
