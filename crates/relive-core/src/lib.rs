//! Reload orchestration engine for relive.
//!
//! This crate provides:
//! - Generations running in isolated execution units (child process or
//!   dedicated thread with its own runtime)
//! - Startup/shutdown hook pipeline gating readiness and teardown
//! - The compile-gate protocol to an external build pipeline
//! - The orchestrator that swaps generations without dropping service

pub mod config;
pub mod error;
pub mod execute;
pub mod gate;
pub mod generation;
pub mod hooks;
pub mod logger;
pub mod orchestrator;

pub use config::{DevSettings, ReloadConfig, Settings};
pub use error::{Error, Result};
pub use execute::{
    AbortHandle, AppContext, AppError, ExecutionContext, ExecutionUnit, Launcher, ProcessLauncher,
    StagingArea, Termination, ThreadLauncher, UnitExit,
};
pub use gate::{AlwaysChanged, ChangeDetector, ChangeFlag, CompileGate, CompileResult, ModifiedSinceGate};
pub use generation::{ArtifactSet, GenerationId, GenerationRecord, GenerationState};
pub use hooks::{Hook, HookContext, HookDescriptor, HookKind, HookRegistry};
pub use logger::{BuildLogger, TracingLogger};
pub use orchestrator::{Phase, ReloadOrchestrator, ReloadOutcome, Trigger};
