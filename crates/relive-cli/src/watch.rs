//! File watcher feeding the reload loop.
//!
//! Watches the project sources recursively. Every debounced batch of changes
//! marks the shared [`ChangeFlag`] and is handed to the run loop, which turns
//! it into a reload trigger.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer, notify::RecursiveMode};
use relive_core::ChangeFlag;
use tokio::sync::mpsc;

/// Directories whose contents never trigger a reload.
const IGNORED_DIRS: &[&str] = &["target", ".git", ".relive"];

/// How long to wait for a burst of writes to settle.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// File watcher handle.
pub struct FileWatcher {
    /// Debouncer handle (kept alive to maintain watcher).
    _debouncer: Debouncer<notify::RecommendedWatcher>,
    /// Receiver for batches of changed paths.
    rx: mpsc::UnboundedReceiver<Vec<PathBuf>>,
}

impl FileWatcher {
    /// Watch `paths` (files or directories) and mark `flag` on every change.
    pub fn new(paths: &[PathBuf], flag: ChangeFlag) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(DEBOUNCE, move |result: DebounceEventResult| {
            let events = match result {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!("file watch error: {}", e);
                    return;
                }
            };

            let changed: Vec<PathBuf> = events
                .into_iter()
                .map(|event| event.path)
                .filter(|path| !is_ignored(path))
                .collect();
            if changed.is_empty() {
                return;
            }

            flag.mark();
            let _ = tx.send(changed);
        })
        .context("failed to create file watcher")?;

        for path in paths {
            let mode = if path.is_dir() {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            debouncer
                .watcher()
                .watch(path, mode)
                .with_context(|| format!("failed to watch {}", path.display()))?;
            tracing::debug!("watching {}", path.display());
        }

        Ok(Self {
            _debouncer: debouncer,
            rx,
        })
    }

    /// Receive the next batch of changed paths.
    pub async fn recv(&mut self) -> Option<Vec<PathBuf>> {
        self.rx.recv().await
    }
}

fn is_ignored(path: &Path) -> bool {
    path.components().any(|component| match component {
        Component::Normal(name) => name.to_str().is_some_and(|n| IGNORED_DIRS.contains(&n)),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relive_core::ChangeDetector;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_ignored_paths() {
        assert!(is_ignored(Path::new("/work/app/target/debug/app")));
        assert!(is_ignored(Path::new("/work/app/.relive/staging/v1/app")));
        assert!(!is_ignored(Path::new("/work/app/src/main.rs")));
        assert!(!is_ignored(Path::new("/work/targets/src/main.rs")));
    }

    #[tokio::test]
    async fn test_change_marks_flag() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir(&src).unwrap();

        let flag = ChangeFlag::new();
        let mut watcher = FileWatcher::new(&[src.clone()], flag.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        fs::write(src.join("main.rs"), "fn main() {}").unwrap();
        let changed = tokio::time::timeout(Duration::from_secs(5), watcher.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(changed.iter().any(|p| p.ends_with("main.rs")));
        assert!(flag.has_changed());
    }
}
