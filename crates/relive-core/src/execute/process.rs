//! Child-process launcher.
//!
//! Each generation runs as its own OS process, so nothing the application
//! allocates, spawns or mutates globally can survive into the next
//! generation. Killing the process reclaims everything.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::config::env_key;
use crate::error::{Error, Result};
use crate::generation::GenerationId;

use super::context::{ExecutionContext, ExecutionUnit, ExitNotifier, Launcher, UnitExit};
use super::staging::StagingArea;

/// Launches every generation as a child process.
///
/// The entry point is resolved in this order:
/// 1. An artifact whose file name or stem matches it
/// 2. An existing path
/// 3. The system `PATH`
#[derive(Debug, Default)]
pub struct ProcessLauncher {
    args: Vec<String>,
    staging: Option<StagingArea>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run each generation from a private copy under `dir`.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging = Some(StagingArea::new(dir));
        self
    }

    /// Arguments passed to every generation.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn resolve_program(cx: &ExecutionContext) -> Result<PathBuf> {
        let entry_point = cx.entry_point();

        if let Some(path) = cx.artifacts().find(entry_point) {
            return Ok(path.to_path_buf());
        }

        let path = PathBuf::from(entry_point);
        if path.is_file() {
            return Ok(path);
        }

        which::which(entry_point).map_err(|_| {
            Error::Launch(format!(
                "entry point '{}' is not among {} artifacts and not on PATH",
                entry_point,
                cx.artifacts().len()
            ))
        })
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, cx: &ExecutionContext) -> Result<Box<dyn ExecutionUnit>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Launch("process launcher requires a tokio runtime".to_string()))?;

        let mut program = Self::resolve_program(cx)?;
        if let Some(staging) = &self.staging {
            program = staging.stage(cx, &program)?;
        }

        let endpoint = cx.endpoint();
        let mut command = Command::new(&program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in cx.settings().iter() {
            command.env(env_key(key), value);
        }
        command
            .env("RELIVE_GENERATION", cx.generation().as_u64().to_string())
            .env("RELIVE_HTTP_HOST", endpoint.ip().to_string())
            .env("RELIVE_HTTP_PORT", endpoint.port().to_string())
            .env("PORT", endpoint.port().to_string());

        let child = command.spawn().map_err(|e| {
            Error::Launch(format!(
                "Failed to spawn process '{}': {}",
                program.display(),
                e
            ))
        })?;
        let pid = child.id();
        let live_pid = Arc::new(Mutex::new(pid));

        let (kill_tx, kill_rx) = oneshot::channel();
        runtime.spawn(monitor(
            child,
            kill_rx,
            cx.exit_notifier(),
            cx.generation(),
            live_pid.clone(),
        ));

        Ok(Box::new(ProcessUnit {
            pid,
            live_pid,
            program,
            kill_tx: Mutex::new(Some(kill_tx)),
        }))
    }
}

/// Reap the child and publish its exit. Dropping the kill sender also kills it.
///
/// `live_pid` is cleared as soon as the child is reaped so the pid is never
/// signalled after the OS may have handed it to another process.
async fn monitor(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit: ExitNotifier,
    generation: GenerationId,
    live_pid: Arc<Mutex<Option<u32>>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                tracing::warn!(%generation, "failed to kill process: {}", e);
            }
            lock(&live_pid).take();
            exit.notify(UnitExit::Killed);
            return;
        }
    };
    lock(&live_pid).take();

    let unit_exit = match status {
        Ok(status) => UnitExit::Exited(status.code()),
        Err(e) => UnitExit::Failed(e.to_string()),
    };
    tracing::debug!(%generation, "process {}", unit_exit);
    exit.notify(unit_exit);
}

/// A generation running as a child process.
struct ProcessUnit {
    pid: Option<u32>,
    /// `None` once the child has been reaped.
    live_pid: Arc<Mutex<Option<u32>>>,
    program: PathBuf,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ExecutionUnit for ProcessUnit {
    fn interrupt(&self) {
        #[cfg(unix)]
        {
            let live_pid = lock(&self.live_pid);
            if let Some(pid) = *live_pid {
                // SIGTERM lets the application drain and exit on its own
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }

        #[cfg(not(unix))]
        {
            self.kill();
        }
    }

    fn kill(&self) {
        let sender = lock(&self.kill_tx).take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    fn describe(&self) -> String {
        match self.pid {
            Some(pid) => format!("{} (pid {})", self.program.display(), pid),
            None => self.program.display().to_string(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::execute::Termination;
    use crate::generation::ArtifactSet;
    use std::time::Duration;

    fn context(entry_point: &str, settings: &Settings) -> ExecutionContext {
        ExecutionContext::create(
            GenerationId::new(2),
            &ArtifactSet::default(),
            entry_point,
            settings,
            "127.0.0.1:45678".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_process_exit_is_reported() {
        let mut cx = context("sh", &Settings::new());
        let launcher = ProcessLauncher::new().with_args(["-c", "exit 3"]);
        cx.launch(&launcher);
        let exit = cx.wait_exit(Duration::from_secs(5)).await;
        assert_eq!(exit, Some(UnitExit::Exited(Some(3))));
    }

    #[tokio::test]
    async fn test_environment_is_passed() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let settings: Settings = [("app.greeting", "hi")].into_iter().collect();
        let script = format!(
            "echo \"$RELIVE_GENERATION $PORT $APP_GREETING\" > {}",
            out.display()
        );

        let mut cx = context("sh", &settings);
        cx.launch(&ProcessLauncher::new().with_args(["-c".to_string(), script]));
        assert_eq!(
            cx.wait_exit(Duration::from_secs(5)).await,
            Some(UnitExit::Exited(Some(0)))
        );
        assert_eq!(std::fs::read_to_string(out).unwrap().trim(), "2 45678 hi");
    }

    #[tokio::test]
    async fn test_interrupt_stops_process() {
        let mut cx = context("sleep", &Settings::new());
        cx.launch(&ProcessLauncher::new().with_args(["30"]));
        assert!(cx.is_alive());

        let termination = cx.terminate(Duration::from_secs(5)).await;
        assert_eq!(termination, Termination::Graceful);
        assert_eq!(cx.exit_status(), Some(UnitExit::Exited(None)));
    }

    #[tokio::test]
    async fn test_ignored_interrupt_is_killed() {
        let mut cx = context("sh", &Settings::new());
        cx.launch(&ProcessLauncher::new().with_args(["-c", "trap '' TERM; sleep 30"]));

        let termination = cx.terminate(Duration::from_millis(300)).await;
        assert_eq!(termination, Termination::Forced);
        assert_eq!(cx.exit_status(), Some(UnitExit::Killed));
    }

    #[tokio::test]
    async fn test_reaped_child_pid_is_forgotten() {
        let cx = context("sh", &Settings::new());
        let child = Command::new("sh").args(["-c", "exit 0"]).spawn().unwrap();
        let pid = child.id();
        let live_pid = Arc::new(Mutex::new(pid));
        assert!(pid.is_some());

        let (_kill_tx, kill_rx) = oneshot::channel();
        monitor(child, kill_rx, cx.exit_notifier(), cx.generation(), live_pid.clone()).await;
        assert_eq!(cx.exit_status(), Some(UnitExit::Exited(Some(0))));
        assert_eq!(*live_pid.lock().unwrap(), None);

        let unit = ProcessUnit {
            pid,
            live_pid,
            program: PathBuf::from("sh"),
            kill_tx: Mutex::new(None),
        };
        // no signal is sent once the pid is gone
        unit.interrupt();
        assert!(unit.describe().starts_with("sh (pid "));
    }

    #[tokio::test]
    async fn test_unknown_entry_point_fails_launch() {
        let mut cx = context("relive-no-such-program", &Settings::new());
        cx.launch(&ProcessLauncher::new());
        assert!(matches!(
            cx.wait_exit(Duration::from_secs(1)).await,
            Some(UnitExit::LaunchFailed(_))
        ));
    }
}
