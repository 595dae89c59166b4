//! Isolated execution of generations.
//!
//! # Architecture
//!
//! ```text
//! ExecutionContext (one per generation)
//!     │
//!     ├── artifact snapshot, settings, endpoint
//!     ├── AbortHandle (cooperative interrupt)
//!     ├── release handlers (LIFO)
//!     │
//!     └── Launcher::launch
//!             │
//!             ├── ProcessLauncher → child process (SIGTERM / SIGKILL)
//!             │       └── StagingArea: private copy of the executable
//!             │
//!             └── ThreadLauncher → dedicated thread + private tokio runtime
//!                     └── registered entry point
//! ```
//!
//! Either way the unit reports its completion through the context's
//! completion signal, which is what the hook pipeline and `terminate`
//! wait on.

mod context;
mod process;
mod staging;
mod thread;

pub use context::{
    AbortHandle, ExecutionContext, ExecutionUnit, ExitNotifier, Launcher, Termination, UnitExit,
};
pub use process::ProcessLauncher;
pub use staging::StagingArea;
pub use thread::{AppContext, AppError, ThreadLauncher};
