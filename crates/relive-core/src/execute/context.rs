//! Per-generation execution context.
//!
//! An [`ExecutionContext`] is the isolation boundary of one generation. It
//! owns the generation's artifact snapshot and settings, the execution unit
//! once launched, and every resource registered against it. Resources are
//! released exactly once, in reverse registration order, whether the unit
//! stopped on request or had to be killed.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, watch};

use crate::config::Settings;
use crate::error::Result;
use crate::generation::{ArtifactSet, GenerationId};

/// Handle for cooperative cancellation of a generation.
///
/// Any clone can trigger the abort, which is visible to all other clones.
/// Unlike a plain flag it can also be awaited.
#[derive(Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortInner>,
}

#[derive(Default)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Request abort. Wakes every task waiting in [`aborted`](Self::aborted).
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Resolve once abort has been requested.
    pub async fn aborted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// How an execution unit finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitExit {
    /// The entry point returned or the process exited. `None` for a signal exit.
    Exited(Option<i32>),
    /// The entry point returned an error or panicked.
    Failed(String),
    /// The unit was forcibly reclaimed.
    Killed,
    /// The unit never started.
    LaunchFailed(String),
}

impl UnitExit {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitExit::Exited(Some(0)) | UnitExit::Exited(None))
    }
}

impl fmt::Display for UnitExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitExit::Exited(Some(code)) => write!(f, "exited with code {}", code),
            UnitExit::Exited(None) => f.write_str("exited"),
            UnitExit::Failed(message) => write!(f, "failed: {}", message),
            UnitExit::Killed => f.write_str("killed"),
            UnitExit::LaunchFailed(message) => write!(f, "failed to launch: {}", message),
        }
    }
}

/// Write side of a unit's completion signal. The first exit reported wins.
#[derive(Clone)]
pub struct ExitNotifier {
    tx: Arc<watch::Sender<Option<UnitExit>>>,
}

impl ExitNotifier {
    /// Publish the exit. Returns `false` if one was already published.
    pub fn notify(&self, exit: UnitExit) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(exit);
            true
        })
    }
}

/// A running generation: a child process, a thread, or anything else that
/// can be asked to stop and be forced to stop.
pub trait ExecutionUnit: Send + Sync {
    /// Request cooperative shutdown.
    fn interrupt(&self);

    /// Force the unit down. Must not block.
    fn kill(&self);

    fn describe(&self) -> String;
}

/// Strategy that turns a context into a running execution unit.
///
/// `launch` must not block. The unit reports its completion through
/// [`ExecutionContext::exit_notifier`].
pub trait Launcher: Send + Sync {
    fn launch(&self, cx: &ExecutionContext) -> Result<Box<dyn ExecutionUnit>>;
}

/// Outcome of [`ExecutionContext::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Forced,
}

type ReleaseHandler = Box<dyn FnOnce() + Send>;

/// Isolation boundary of one generation.
pub struct ExecutionContext {
    generation: GenerationId,
    artifacts: ArtifactSet,
    entry_point: String,
    settings: Settings,
    endpoint: SocketAddr,
    abort: AbortHandle,
    exit_tx: ExitNotifier,
    exit_rx: watch::Receiver<Option<UnitExit>>,
    unit: Option<Box<dyn ExecutionUnit>>,
    release_handlers: Mutex<Vec<(String, ReleaseHandler)>>,
}

impl ExecutionContext {
    /// Allocate the boundary. No code runs until [`launch`](Self::launch).
    pub fn create(
        generation: GenerationId,
        artifacts: &ArtifactSet,
        entry_point: impl Into<String>,
        settings: &Settings,
        endpoint: SocketAddr,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            generation,
            artifacts: artifacts.clone(),
            entry_point: entry_point.into(),
            settings: settings.clone(),
            endpoint,
            abort: AbortHandle::new(),
            exit_tx: ExitNotifier { tx: Arc::new(tx) },
            exit_rx: rx,
            unit: None,
            release_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    pub fn artifacts(&self) -> &ArtifactSet {
        &self.artifacts
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn abort_handle(&self) -> &AbortHandle {
        &self.abort
    }

    pub fn exit_notifier(&self) -> ExitNotifier {
        self.exit_tx.clone()
    }

    /// Register a resource to release on teardown.
    ///
    /// Handlers run in reverse order of registration.
    pub fn on_release(&self, name: impl Into<String>, handler: impl FnOnce() + Send + 'static) {
        self.handlers().push((name.into(), Box::new(handler)));
    }

    /// Start the unit. Launch errors are reported on the completion signal.
    pub fn launch(&mut self, launcher: &dyn Launcher) {
        if self.unit.is_some() || self.exit_status().is_some() {
            return;
        }
        match launcher.launch(self) {
            Ok(unit) => {
                tracing::debug!(generation = %self.generation, unit = %unit.describe(), "launched");
                self.unit = Some(unit);
            }
            Err(e) => {
                self.exit_tx.notify(UnitExit::LaunchFailed(e.to_string()));
            }
        }
    }

    pub fn exit_status(&self) -> Option<UnitExit> {
        self.exit_rx.borrow().clone()
    }

    pub fn is_alive(&self) -> bool {
        self.unit.is_some() && self.exit_status().is_none()
    }

    /// Wait for the unit to finish. Pending forever if never launched.
    pub async fn exited(&self) -> UnitExit {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or(UnitExit::Killed),
            Err(_) => UnitExit::Killed,
        }
    }

    pub async fn wait_exit(&self, timeout: Duration) -> Option<UnitExit> {
        tokio::time::timeout(timeout, self.exited()).await.ok()
    }

    /// The unit, unless it has already exited.
    fn live_unit(&self) -> Option<&dyn ExecutionUnit> {
        self.unit.as_deref().filter(|_| self.exit_status().is_none())
    }

    /// Cooperative interrupt. A unit that already exited is not signalled.
    pub fn interrupt(&self) {
        self.abort.abort();
        if let Some(unit) = self.live_unit() {
            unit.interrupt();
        }
    }

    /// Forced stop. A unit that already exited is not signalled.
    pub fn kill(&self) {
        self.abort.abort();
        if let Some(unit) = self.live_unit() {
            unit.kill();
        }
    }

    /// Interrupt, kill if the unit has not exited within `timeout`, then
    /// release every registered resource.
    pub async fn terminate(&self, timeout: Duration) -> Termination {
        let termination = if !self.is_alive() {
            Termination::Graceful
        } else {
            self.interrupt();
            if self.wait_exit(timeout).await.is_some() {
                Termination::Graceful
            } else {
                tracing::warn!(generation = %self.generation, "did not stop in time, killing");
                self.kill();
                if self.wait_exit(timeout).await.is_none() {
                    tracing::error!(generation = %self.generation, "unit did not report exit after kill");
                }
                Termination::Forced
            }
        };
        self.release();
        termination
    }

    /// Run all release handlers.
    fn release(&self) {
        let handlers = std::mem::take(&mut *self.handlers());
        for (name, handler) in handlers.into_iter().rev() {
            // Catch panics to ensure all handlers run
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(handler));
            if let Err(e) = result {
                tracing::error!(
                    "Release handler {} for generation {} panicked: {:?}",
                    name,
                    self.generation,
                    e
                );
            }
        }
    }

    fn handlers(&self) -> std::sync::MutexGuard<'_, Vec<(String, ReleaseHandler)>> {
        match self.release_handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("generation", &self.generation)
            .field("entry_point", &self.entry_point)
            .field("endpoint", &self.endpoint)
            .field("exit", &self.exit_status())
            .finish_non_exhaustive()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if self.is_alive() {
            self.kill();
        }
        self.release();
    }
}
