//! The deployment handle.
//!
//! [`ReloadOrchestrator`] owns the generation state machine:
//!
//! ```text
//! Idle → Compiling → Starting → Running → (trigger) → Compiling → …
//!           │            │
//!           └─ failure ──┴──→ Idle (previous generation keeps serving)
//!
//! Running → (stop) → Draining → Stopped
//! ```
//!
//! Generation N+1 is launched on its own endpoint next to generation N and
//! only replaces it once every startup hook reports ready. Generation N's
//! shutdown hooks run after that swap.
//!
//! # Locking
//!
//! - `state` (`RwLock`): read for status queries, written only to install a
//!   new generation and to drop a drained one.
//! - `reload_lock` (`Mutex`): serializes `start`, `reload` and `stop`.
//!   tokio's mutex is fair, so concurrent reload requests queue up in
//!   arrival order. `stop` waits behind an in-flight swap. The guard is
//!   moved into a spawned task, so a caller that gives up after acquiring
//!   it cannot leave a swap half done.
//! - `registry` (`std::sync::Mutex`): never held across an `.await`.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard};

use tokio::sync::{Mutex, RwLock, watch};

use crate::config::{DevSettings, ReloadConfig};
use crate::error::{Error, Result};
use crate::execute::{ExecutionContext, Launcher};
use crate::gate::{ChangeDetector, CompileGate, CompileResult};
use crate::generation::{
    ArtifactSet, GenerationId, GenerationRecord, GenerationRegistry, GenerationState,
    allocate_endpoint,
};
use crate::hooks::{HookPipeline, HookRegistry};
use crate::logger::{BuildLogger, TracingLogger};

/// What asked for a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// The file watcher saw these paths change.
    FileChange(Vec<PathBuf>),
    /// A request reached the proxy.
    Request,
    /// The user asked explicitly.
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::FileChange(paths) => write!(f, "{} changed file(s)", paths.len()),
            Trigger::Request => f.write_str("incoming request"),
            Trigger::Manual => f.write_str("manual request"),
        }
    }
}

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Compiling,
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Successful result of [`ReloadOrchestrator::reload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The change detector reported nothing to do.
    Skipped,
    /// The compile gate reported no change.
    UpToDate,
    /// A new generation replaced the previous one.
    Reloaded {
        previous: Option<GenerationId>,
        current: GenerationId,
    },
}

/// Configuration resolved by `start`.
struct Deployment {
    config: ReloadConfig,
    settings: DevSettings,
    pipeline: HookPipeline,
}

#[derive(Default)]
struct DeploymentState {
    deployment: Option<Arc<Deployment>>,
    current: Option<ExecutionContext>,
    draining: Option<GenerationId>,
    stopped: bool,
}

/// Deployment handle driving successive generations of one application.
///
/// `start`, `reload` and `stop` do their work on a spawned task. Dropping
/// the future they return does not interrupt a compile or a swap; the
/// operation still runs to a consistent end in the background.
pub struct ReloadOrchestrator {
    engine: Engine,
    hooks: HookRegistry,
}

/// State shared by the handle and the tasks it spawns.
struct Shared {
    state: RwLock<DeploymentState>,
    reload_lock: Arc<Mutex<()>>,
    registry: std::sync::Mutex<GenerationRegistry>,
    next_id: AtomicU64,
    /// Set after a failed compile or startup; forces the next reload to compile.
    faulted: AtomicBool,
    phase: watch::Sender<Phase>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, GenerationRegistry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::debug!(?previous, ?phase, "phase changed");
        }
    }

    async fn restore_phase(&self) {
        let running = self.state.read().await.current.is_some();
        self.set_phase(if running { Phase::Running } else { Phase::Idle });
    }
}

/// Everything a lifecycle operation needs, cheap to move into a task.
#[derive(Clone)]
struct Engine {
    launcher: Arc<dyn Launcher>,
    gate: Arc<dyn CompileGate>,
    detector: Arc<dyn ChangeDetector>,
    logger: Arc<dyn BuildLogger>,
    shared: Arc<Shared>,
}

impl ReloadOrchestrator {
    pub fn new(
        launcher: impl Launcher + 'static,
        gate: impl CompileGate + 'static,
        detector: impl ChangeDetector + 'static,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        let shared = Shared {
            state: RwLock::new(DeploymentState::default()),
            reload_lock: Arc::new(Mutex::new(())),
            registry: std::sync::Mutex::new(GenerationRegistry::default()),
            next_id: AtomicU64::new(0),
            faulted: AtomicBool::new(false),
            phase,
        };
        Self {
            engine: Engine {
                launcher: Arc::new(launcher),
                gate: Arc::new(gate),
                detector: Arc::new(detector),
                logger: Arc::new(TracingLogger),
                shared: Arc::new(shared),
            },
            hooks: HookRegistry::with_builtins(),
        }
    }

    pub fn with_logger(mut self, logger: impl BuildLogger + 'static) -> Self {
        self.engine.logger = Arc::new(logger);
        self
    }

    /// Use a custom hook registry instead of the built-ins.
    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// Boot generation 0 and wait until it is running.
    ///
    /// Hook ids and settings are validated before anything is launched.
    /// Without initial artifacts in `config`, the compile gate is asked for
    /// the first build.
    pub async fn start(&self, config: ReloadConfig) -> Result<GenerationId> {
        let settings = DevSettings::from_settings(&config.settings)?;
        let pipeline = HookPipeline::resolve(&self.hooks, &config, &settings)?;
        let deployment = Arc::new(Deployment {
            config,
            settings,
            pipeline,
        });
        self.exclusive(move |engine| async move { engine.start(deployment).await })
            .await
    }

    /// Rebuild and swap in a new generation if anything changed.
    ///
    /// Requests are queued; a queued request checks the change detector
    /// again when its turn comes. On any failure the previous generation
    /// stays current.
    pub async fn reload(&self, trigger: Trigger) -> Result<ReloadOutcome> {
        self.exclusive(move |engine| async move { engine.reload(trigger).await })
            .await
    }

    /// Shut the current generation down and release everything.
    ///
    /// Waits for an in-flight swap to finish first. Calling it again is a
    /// no-op.
    pub async fn stop(&self) {
        let stopped = self
            .exclusive(|engine| async move {
                engine.stop().await;
                Ok(())
            })
            .await;
        if let Err(e) = stopped {
            tracing::warn!("stop did not complete: {}", e);
        }
    }

    /// Whether a generation is currently serving.
    pub async fn is_running(&self) -> bool {
        self.engine.shared.state.read().await.current.is_some()
    }

    /// Whether the next reload would compile.
    pub async fn is_changed(&self) -> bool {
        let shared = &self.engine.shared;
        let state = shared.state.read().await;
        !state.stopped && (shared.faulted.load(Ordering::Acquire) || self.engine.detector.has_changed())
    }

    pub fn phase(&self) -> Phase {
        *self.engine.shared.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.engine.shared.phase.subscribe()
    }

    /// Record of the generation currently serving.
    pub async fn current_generation(&self) -> Option<GenerationRecord> {
        let shared = &self.engine.shared;
        let state = shared.state.read().await;
        let id = state.current.as_ref()?.generation();
        shared.registry().get(id).cloned()
    }

    /// Where the current generation listens.
    pub async fn current_endpoint(&self) -> Option<SocketAddr> {
        let state = self.engine.shared.state.read().await;
        state.current.as_ref().map(ExecutionContext::endpoint)
    }

    /// Every generation created so far, in creation order.
    pub fn generations(&self) -> Vec<GenerationRecord> {
        self.engine.shared.registry().snapshot()
    }

    /// Queue behind other lifecycle operations, then run `op` on its own task.
    ///
    /// The queue position is taken by the caller; once the lock is held the
    /// task owns it and finishes even if the caller goes away.
    async fn exclusive<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Engine) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.engine.shared.reload_lock.clone().lock_owned().await;
        let work = op(self.engine.clone());
        let task = tokio::spawn(async move {
            let result = work.await;
            drop(guard);
            result
        });
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            // only when the runtime is shutting down
            Err(_) => Err(Error::Stopped),
        }
    }
}

impl Engine {
    async fn start(&self, deployment: Arc<Deployment>) -> Result<GenerationId> {
        let shared = &self.shared;
        {
            let state = shared.state.read().await;
            if state.stopped {
                return Err(Error::Stopped);
            }
            if state.deployment.is_some() {
                return Err(Error::AlreadyStarted);
            }
        }

        let artifacts = match deployment.config.artifacts.clone() {
            Some(artifacts) => artifacts,
            None => {
                shared.set_phase(Phase::Compiling);
                self.detector.reset();
                match self.compile().await {
                    CompileResult::Success(artifacts) => artifacts,
                    CompileResult::NoChange => ArtifactSet::default(),
                    CompileResult::Failure(cause) => {
                        let err = Error::CompileFailure(cause);
                        self.logger.error("initial build failed", Some(&err));
                        shared.set_phase(Phase::Idle);
                        return Err(err);
                    }
                }
            }
        };

        let cx = match self.launch_generation(&deployment, &artifacts).await {
            Ok(cx) => cx,
            Err(e) => {
                self.logger.error("application failed to start", Some(&e));
                shared.set_phase(Phase::Idle);
                return Err(e);
            }
        };
        let id = cx.generation();

        {
            let mut state = shared.state.write().await;
            state.deployment = Some(deployment);
            state.current = Some(cx);
            shared.registry().set_state(id, GenerationState::Running);
        }
        shared.set_phase(Phase::Running);
        self.logger.info(&format!("generation {} is running", id));
        Ok(id)
    }

    async fn reload(&self, trigger: Trigger) -> Result<ReloadOutcome> {
        let shared = &self.shared;
        let deployment = {
            let state = shared.state.read().await;
            if state.stopped {
                return Err(Error::Stopped);
            }
            state.deployment.clone().ok_or(Error::NotStarted)?
        };

        let forced = shared.faulted.load(Ordering::Acquire);
        if !forced && !self.detector.has_changed() {
            tracing::trace!(%trigger, "no changes, skipping reload");
            return Ok(ReloadOutcome::Skipped);
        }
        self.detector.reset();
        self.logger.debug(&format!(
            "reload triggered by {}{}",
            trigger,
            if forced { " (retrying after failure)" } else { "" }
        ));

        shared.set_phase(Phase::Compiling);
        let artifacts = match self.compile().await {
            CompileResult::Success(artifacts) => artifacts,
            CompileResult::NoChange => {
                shared.faulted.store(false, Ordering::Release);
                shared.restore_phase().await;
                return Ok(ReloadOutcome::UpToDate);
            }
            CompileResult::Failure(cause) => {
                shared.faulted.store(true, Ordering::Release);
                let err = Error::CompileFailure(cause);
                self.logger.error("compilation failed, keeping the running generation", Some(&err));
                shared.set_phase(Phase::Idle);
                return Err(err);
            }
        };

        let cx = match self.launch_generation(&deployment, &artifacts).await {
            Ok(cx) => cx,
            Err(e) => {
                shared.faulted.store(true, Ordering::Release);
                self.logger.error("new generation failed to start, keeping the running generation", Some(&e));
                shared.set_phase(Phase::Idle);
                return Err(e);
            }
        };
        let current = cx.generation();

        let previous = {
            let mut state = shared.state.write().await;
            let previous = state.current.replace(cx);
            let mut registry = shared.registry();
            registry.set_state(current, GenerationState::Running);
            if let Some(previous) = &previous {
                registry.set_state(previous.generation(), GenerationState::Draining);
                state.draining = Some(previous.generation());
            }
            previous
        };
        shared.faulted.store(false, Ordering::Release);
        shared.set_phase(Phase::Running);
        self.logger.info(&format!("generation {} is running", current));

        let previous_id = previous.as_ref().map(ExecutionContext::generation);
        if let Some(previous) = previous {
            self.retire(&deployment, previous).await;
        }

        Ok(ReloadOutcome::Reloaded {
            previous: previous_id,
            current,
        })
    }

    async fn stop(&self) {
        let shared = &self.shared;
        let (deployment, current) = {
            let mut state = shared.state.write().await;
            if state.stopped {
                return;
            }
            state.stopped = true;
            let current = state.current.take();
            if let Some(cx) = &current {
                shared.registry().set_state(cx.generation(), GenerationState::Draining);
                state.draining = Some(cx.generation());
            }
            (state.deployment.clone(), current)
        };

        if let (Some(deployment), Some(cx)) = (deployment, current) {
            shared.set_phase(Phase::Draining);
            self.retire(&deployment, cx).await;
        }
        shared.set_phase(Phase::Stopped);
        self.logger.info("deployment stopped");
    }

    /// Create, launch and wait for one generation to become ready.
    ///
    /// A generation that never becomes ready is marked failed and torn
    /// down without running shutdown hooks.
    async fn launch_generation(
        &self,
        deployment: &Deployment,
        artifacts: &ArtifactSet,
    ) -> Result<ExecutionContext> {
        let shared = &self.shared;
        let settings = &deployment.settings;
        let id = GenerationId::new(shared.next_id.fetch_add(1, Ordering::SeqCst));
        shared.set_phase(Phase::Starting);

        let endpoint = match allocate_endpoint(&settings.http_host, settings.http_port) {
            Ok(endpoint) => endpoint,
            Err(Error::Io(e)) => {
                return Err(Error::StartupFailed {
                    generation: id,
                    reason: format!("no endpoint available on {}: {}", settings.http_host, e),
                });
            }
            Err(e) => return Err(e),
        };

        let mut cx = ExecutionContext::create(
            id,
            artifacts,
            deployment.config.entry_point.as_str(),
            &deployment.config.settings,
            endpoint,
        );
        shared.registry().insert(GenerationRecord {
            id,
            entry_point: deployment.config.entry_point.clone(),
            artifacts: artifacts.len(),
            endpoint,
            state: GenerationState::Starting,
        });
        self.logger.info(&format!("starting generation {} on {}", id, endpoint));

        cx.launch(self.launcher.as_ref());
        match deployment.pipeline.run_startup(&cx, settings, self.logger.as_ref()).await {
            Ok(()) => Ok(cx),
            Err(e) => {
                shared.registry().set_state(id, GenerationState::Failed);
                cx.terminate(settings.shutdown_grace).await;
                Err(e)
            }
        }
    }

    /// Run shutdown hooks on a replaced generation and drop it.
    async fn retire(&self, deployment: &Deployment, cx: ExecutionContext) {
        let id = cx.generation();
        let errors = deployment
            .pipeline
            .run_shutdown(&cx, &deployment.settings, self.logger.as_ref())
            .await;
        drop(cx);

        {
            let mut state = self.shared.state.write().await;
            if state.draining == Some(id) {
                state.draining = None;
            }
            self.shared.registry().set_state(id, GenerationState::Stopped);
        }

        if errors.is_empty() {
            self.logger.debug(&format!("generation {} stopped", id));
        } else {
            self.logger.debug(&format!("generation {} stopped with {} shutdown error(s)", id, errors.len()));
        }
    }

    async fn compile(&self) -> CompileResult {
        let gate = self.gate.clone();
        match tokio::task::spawn_blocking(move || gate.request_compile()).await {
            Ok(result) => result,
            Err(e) => CompileResult::Failure(format!("compile gate panicked: {}", e)),
        }
    }
}

impl fmt::Debug for ReloadOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadOrchestrator")
            .field("phase", &self.phase())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}
