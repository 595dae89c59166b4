//! Logging sink used by the orchestrator.
//!
//! The driver owns the logging configuration; the core only calls into a
//! [`BuildLogger`]. [`TracingLogger`] forwards everything to `tracing`.

use std::error::Error as StdError;

use tracing::Level;

/// Optional cause attached to a log message.
pub type Cause<'a> = Option<&'a (dyn StdError + 'static)>;

/// Sink for user-facing orchestration messages.
pub trait BuildLogger: Send + Sync {
    /// Emit a message at the given level.
    fn log(&self, level: Level, message: &str, cause: Cause<'_>);

    fn debug(&self, message: &str) {
        self.log(Level::DEBUG, message, None);
    }

    fn info(&self, message: &str) {
        self.log(Level::INFO, message, None);
    }

    fn warn(&self, message: &str, cause: Cause<'_>) {
        self.log(Level::WARN, message, cause);
    }

    fn error(&self, message: &str, cause: Cause<'_>) {
        self.log(Level::ERROR, message, cause);
    }
}

/// Default sink: emits through the `tracing` macros under the `relive` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl BuildLogger for TracingLogger {
    fn log(&self, level: Level, message: &str, cause: Cause<'_>) {
        match (level, cause) {
            (Level::ERROR, Some(cause)) => tracing::error!(target: "relive", error = %cause, "{}", message),
            (Level::ERROR, None) => tracing::error!(target: "relive", "{}", message),
            (Level::WARN, Some(cause)) => tracing::warn!(target: "relive", error = %cause, "{}", message),
            (Level::WARN, None) => tracing::warn!(target: "relive", "{}", message),
            (Level::INFO, _) => tracing::info!(target: "relive", "{}", message),
            (Level::DEBUG, _) => tracing::debug!(target: "relive", "{}", message),
            _ => tracing::trace!(target: "relive", "{}", message),
        }
    }
}
