//! Build pipeline protocol.
//!
//! The orchestrator never compiles anything. It asks a [`ChangeDetector`]
//! whether a compile is worth paying for, and a [`CompileGate`] for the
//! result of the latest build.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::generation::ArtifactSet;

/// Outcome of one compile request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileResult {
    /// The build succeeded and produced these artifacts.
    Success(ArtifactSet),
    /// The build failed; the cause is the rendered compiler output.
    Failure(String),
    /// Nothing needed rebuilding.
    NoChange,
}

/// Blocking "recompile and report" call.
///
/// May take arbitrarily long. Called from tokio's blocking pool.
pub trait CompileGate: Send + Sync {
    fn request_compile(&self) -> CompileResult;
}

impl<F> CompileGate for F
where
    F: Fn() -> CompileResult + Send + Sync,
{
    fn request_compile(&self) -> CompileResult {
        self()
    }
}

/// Cheap "has anything changed since the last check" test.
pub trait ChangeDetector: Send + Sync {
    fn has_changed(&self) -> bool;

    /// Called when the orchestrator commits to a compile.
    fn reset(&self) {}
}

impl<D: ChangeDetector + ?Sized> ChangeDetector for Arc<D> {
    fn has_changed(&self) -> bool {
        (**self).has_changed()
    }

    fn reset(&self) {
        (**self).reset()
    }
}

/// Detector that always reports a change.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysChanged;

impl ChangeDetector for AlwaysChanged {
    fn has_changed(&self) -> bool {
        true
    }
}

/// Shared flag set by a watcher and cleared when a compile starts.
#[derive(Debug, Clone, Default)]
pub struct ChangeFlag {
    changed: Arc<AtomicBool>,
}

impl ChangeFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.changed.store(true, Ordering::Release);
    }
}

impl ChangeDetector for ChangeFlag {
    fn has_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.changed.store(false, Ordering::Release);
    }
}

/// Turns a `Success` whose artifacts are no newer than the last accepted
/// build into `NoChange`.
///
/// After a `Failure` the next `Success` always passes through, since the
/// artifacts on disk may predate the broken edit.
pub struct ModifiedSinceGate<G> {
    inner: G,
    last_modified: Mutex<Option<SystemTime>>,
    failed: AtomicBool,
}

impl<G: CompileGate> ModifiedSinceGate<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            last_modified: Mutex::new(None),
            failed: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}

impl<G: CompileGate> CompileGate for ModifiedSinceGate<G> {
    fn request_compile(&self) -> CompileResult {
        let result = self.inner.request_compile();
        let artifacts = match result {
            CompileResult::Success(artifacts) => artifacts,
            CompileResult::Failure(cause) => {
                self.failed.store(true, Ordering::Release);
                return CompileResult::Failure(cause);
            }
            CompileResult::NoChange => return CompileResult::NoChange,
        };

        let modified = artifacts.latest_modified();
        let forced = self.failed.swap(false, Ordering::AcqRel);
        let mut last = match self.last_modified.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let stale = match (*last, modified) {
            (Some(previous), Some(current)) => current <= previous,
            _ => false,
        };
        if stale && !forced {
            tracing::debug!("artifacts not modified since last build");
            return CompileResult::NoChange;
        }

        if modified.is_some() {
            *last = modified;
        }
        CompileResult::Success(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_change_flag() {
        let flag = ChangeFlag::new();
        let detector = flag.clone();
        assert!(!detector.has_changed());
        flag.mark();
        assert!(detector.has_changed());
        detector.reset();
        assert!(!flag.has_changed());
    }

    #[test]
    fn test_closure_gate() {
        let calls = AtomicUsize::new(0);
        let gate = || {
            calls.fetch_add(1, Ordering::SeqCst);
            CompileResult::NoChange
        };
        assert_eq!(gate.request_compile(), CompileResult::NoChange);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_modified_since_gate() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("app");
        std::fs::write(&artifact, "v1").unwrap();

        let fail_next = Arc::new(AtomicBool::new(false));
        let path = artifact.clone();
        let flag = fail_next.clone();
        let gate = ModifiedSinceGate::new(move || {
            if flag.swap(false, Ordering::SeqCst) {
                CompileResult::Failure("syntax error".into())
            } else {
                CompileResult::Success(ArtifactSet::new(vec![PathBuf::from(&path)]))
            }
        });

        assert!(matches!(gate.request_compile(), CompileResult::Success(_)));
        assert_eq!(gate.request_compile(), CompileResult::NoChange);

        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(&artifact, "v2").unwrap();
        assert!(matches!(gate.request_compile(), CompileResult::Success(_)));

        fail_next.store(true, Ordering::SeqCst);
        assert!(matches!(gate.request_compile(), CompileResult::Failure(_)));
        // unchanged artifacts still pass once after a failure
        assert!(matches!(gate.request_compile(), CompileResult::Success(_)));
        assert_eq!(gate.request_compile(), CompileResult::NoChange);
    }
}
