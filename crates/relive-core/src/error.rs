//! Error types for relive-core.

use std::time::Duration;

use thiserror::Error;

use crate::generation::GenerationId;
use crate::hooks::HookKind;

/// Result type for relive-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in relive-core.
///
/// Everything that goes wrong during a swap is converted into one of these
/// variants at the orchestrator boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// The build pipeline reported a compile error.
    #[error("compilation failed: {0}")]
    CompileFailure(String),

    /// Startup hooks did not confirm readiness in time.
    #[error("generation {generation} did not become ready within {}ms", waited.as_millis())]
    StartupTimeout {
        generation: GenerationId,
        waited: Duration,
    },

    /// The generation died, failed to launch, or a hook rejected it before it became ready.
    #[error("generation {generation} failed to start: {reason}")]
    StartupFailed {
        generation: GenerationId,
        reason: String,
    },

    /// A configured hook identifier is not registered for that kind.
    #[error("unknown {kind} hook: {id}")]
    HookResolution { id: String, kind: HookKind },

    /// A shutdown hook overran its budget.
    #[error("shutdown hook {hook} did not finish in time for generation {generation}")]
    TerminationTimeout {
        generation: GenerationId,
        hook: String,
    },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// A launcher could not start the execution unit.
    #[error("launch error: {0}")]
    Launch(String),

    /// `start` was called on a deployment that already started.
    #[error("deployment already started")]
    AlreadyStarted,

    /// `reload` was called before `start`.
    #[error("deployment not started")]
    NotStarted,

    /// The deployment was stopped.
    #[error("deployment stopped")]
    Stopped,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error should halt the driving process.
    ///
    /// Build and startup failures only halt the first boot; later they leave
    /// the previous generation serving. Configuration problems always halt.
    pub fn is_fatal(&self, first_boot: bool) -> bool {
        match self {
            Error::HookResolution { .. } | Error::Config(_) => true,
            Error::CompileFailure(_)
            | Error::StartupTimeout { .. }
            | Error::StartupFailed { .. }
            | Error::Launch(_)
            | Error::Io(_) => first_boot,
            Error::TerminationTimeout { .. }
            | Error::AlreadyStarted
            | Error::NotStarted
            | Error::Stopped => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_errors_fatal_only_on_first_boot() {
        let err = Error::StartupTimeout {
            generation: GenerationId::new(0),
            waited: Duration::from_secs(30),
        };
        assert!(err.is_fatal(true));
        assert!(!err.is_fatal(false));

        let err = Error::CompileFailure("syntax error".to_string());
        assert!(err.is_fatal(true));
        assert!(!err.is_fatal(false));
    }

    #[test]
    fn test_hook_resolution_always_fatal() {
        let err = Error::HookResolution {
            id: "nope".to_string(),
            kind: HookKind::Startup,
        };
        assert!(err.is_fatal(false));
        assert_eq!(err.to_string(), "unknown startup hook: nope");
    }

    #[test]
    fn test_termination_timeout_never_fatal() {
        let err = Error::TerminationTimeout {
            generation: GenerationId::new(3),
            hook: "interrupt".to_string(),
        };
        assert!(!err.is_fatal(true));
        assert!(err.to_string().contains("v3"));
    }
}
