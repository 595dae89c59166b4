//! In-process launcher.
//!
//! Applications register named entry points. Each generation runs on a
//! dedicated OS thread that owns a private tokio runtime; every task the
//! application spawns lives on that runtime and is dropped together with
//! it when the generation ends. Nothing spawned by generation N is
//! reachable from generation N+1.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::generation::{ArtifactSet, GenerationId};

use super::context::{AbortHandle, ExecutionContext, ExecutionUnit, ExitNotifier, Launcher, UnitExit};

/// Error type returned by in-process entry points.
pub type AppError = Box<dyn std::error::Error + Send + Sync>;

type EntryPoint = Arc<dyn Fn(AppContext) -> BoxFuture<'static, std::result::Result<(), AppError>> + Send + Sync>;

/// How long a finished runtime may wait for blocking tasks.
const RUNTIME_SHUTDOWN: Duration = Duration::from_millis(500);

/// What an in-process entry point gets to see of its generation.
#[derive(Debug, Clone)]
pub struct AppContext {
    generation: GenerationId,
    artifacts: ArtifactSet,
    settings: Settings,
    endpoint: SocketAddr,
    abort: AbortHandle,
}

impl AppContext {
    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    pub fn artifacts(&self) -> &ArtifactSet {
        &self.artifacts
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Address this generation must listen on.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn is_interrupted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Resolves when the generation is asked to shut down.
    pub async fn interrupted(&self) {
        self.abort.aborted().await
    }
}

/// Launches registered entry points on per-generation threads.
#[derive(Clone)]
pub struct ThreadLauncher {
    entry_points: BTreeMap<String, EntryPoint>,
    worker_threads: usize,
}

impl Default for ThreadLauncher {
    fn default() -> Self {
        Self {
            entry_points: BTreeMap::new(),
            worker_threads: 2,
        }
    }
}

impl ThreadLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry point under `name`.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, entry_point: F) -> Self
    where
        F: Fn(AppContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), AppError>> + Send + 'static,
    {
        let entry_point: EntryPoint = Arc::new(move |cx| Box::pin(entry_point(cx)));
        self.entry_points.insert(name.into(), entry_point);
        self
    }

    /// Worker threads of each generation's runtime.
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads.max(1);
        self
    }

    pub fn entry_points(&self) -> impl Iterator<Item = &str> {
        self.entry_points.keys().map(String::as_str)
    }
}

impl Launcher for ThreadLauncher {
    fn launch(&self, cx: &ExecutionContext) -> Result<Box<dyn ExecutionUnit>> {
        let entry_point = self
            .entry_points
            .get(cx.entry_point())
            .cloned()
            .ok_or_else(|| Error::Launch(format!("unknown entry point: {}", cx.entry_point())))?;

        let app = AppContext {
            generation: cx.generation(),
            artifacts: cx.artifacts().clone(),
            settings: cx.settings().clone(),
            endpoint: cx.endpoint(),
            abort: cx.abort_handle().clone(),
        };
        let abort = app.abort.clone();
        let exit = cx.exit_notifier();
        let worker_threads = self.worker_threads;
        let (kill_tx, kill_rx) = oneshot::channel();
        let thread_name = format!("relive-{}", cx.generation());

        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_generation(entry_point, app, worker_threads, kill_rx, exit))?;

        Ok(Box::new(ThreadUnit {
            thread_name,
            abort,
            kill_tx: Mutex::new(Some(kill_tx)),
        }))
    }
}

fn run_generation(
    entry_point: EntryPoint,
    app: AppContext,
    worker_threads: usize,
    kill_rx: oneshot::Receiver<()>,
    exit: ExitNotifier,
) {
    let generation = app.generation;
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .thread_name(format!("relive-{}-worker", generation))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            exit.notify(UnitExit::LaunchFailed(e.to_string()));
            return;
        }
    };

    let outcome = runtime.block_on(async move {
        let app_task = tokio::spawn(async move { entry_point(app).await });
        tokio::select! {
            joined = app_task => match joined {
                Ok(Ok(())) => UnitExit::Exited(Some(0)),
                Ok(Err(e)) => UnitExit::Failed(e.to_string()),
                Err(e) if e.is_panic() => {
                    UnitExit::Failed(format!("entry point panicked: {}", panic_message(e.into_panic())))
                }
                Err(_) => UnitExit::Killed,
            },
            _ = kill_rx => UnitExit::Killed,
        }
    });

    // Drops every task the generation spawned, closing its listeners.
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);
    tracing::debug!(%generation, "thread {}", outcome);
    exit.notify(outcome);
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A generation running on its own thread.
struct ThreadUnit {
    thread_name: String,
    abort: AbortHandle,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ExecutionUnit for ThreadUnit {
    fn interrupt(&self) {
        self.abort.abort();
    }

    fn kill(&self) {
        let sender = match self.kill_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    fn describe(&self) -> String {
        format!("thread {}", self.thread_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::Termination;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn context(entry_point: &str) -> ExecutionContext {
        ExecutionContext::create(
            GenerationId::new(4),
            &ArtifactSet::default(),
            entry_point,
            &Settings::new(),
            "127.0.0.1:0".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_entry_point_exit() {
        let launcher = ThreadLauncher::new().register("ok", |cx: AppContext| async move {
            assert_eq!(cx.generation(), GenerationId::new(4));
            Ok::<(), AppError>(())
        });
        let mut cx = context("ok");
        cx.launch(&launcher);
        assert_eq!(
            cx.wait_exit(Duration::from_secs(5)).await,
            Some(UnitExit::Exited(Some(0)))
        );
    }

    #[tokio::test]
    async fn test_interrupt_is_cooperative() {
        let launcher = ThreadLauncher::new().register("server", |cx: AppContext| async move {
            cx.interrupted().await;
            Ok::<(), AppError>(())
        });
        let mut cx = context("server");
        cx.launch(&launcher);
        assert!(cx.is_alive());

        let termination = cx.terminate(Duration::from_secs(5)).await;
        assert_eq!(termination, Termination::Graceful);
        assert_eq!(cx.exit_status(), Some(UnitExit::Exited(Some(0))));
    }

    #[tokio::test]
    async fn test_kill_discards_spawned_tasks() {
        let dropped = Arc::new(AtomicBool::new(false));

        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let flag = dropped.clone();
        let launcher = ThreadLauncher::new().register("stubborn", move |_cx: AppContext| {
            let guard = SetOnDrop(flag.clone());
            async move {
                tokio::spawn(async move {
                    let _guard = guard;
                    std::future::pending::<()>().await;
                });
                std::future::pending::<()>().await;
                Ok::<(), AppError>(())
            }
        });

        let mut cx = context("stubborn");
        cx.launch(&launcher);
        let termination = cx.terminate(Duration::from_millis(100)).await;
        assert_eq!(termination, Termination::Forced);
        assert_eq!(cx.exit_status(), Some(UnitExit::Killed));
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let launcher = ThreadLauncher::new().register("boom", |cx: AppContext| async move {
            if cx.settings().is_empty() {
                panic!("bad config");
            }
            Ok::<(), AppError>(())
        });
        let mut cx = context("boom");
        cx.launch(&launcher);
        match cx.wait_exit(Duration::from_secs(5)).await {
            Some(UnitExit::Failed(message)) => assert!(message.contains("bad config")),
            other => panic!("unexpected exit: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_entry_point() {
        let mut cx = context("missing");
        cx.launch(&ThreadLauncher::new());
        assert!(matches!(cx.exited().await, UnitExit::LaunchFailed(_)));
    }
}
