//! Private executable copies per generation.
//!
//! The build tool overwrites its output in place. A running generation keeps
//! executing from its own copy, so the next build never has to touch a file
//! that is in use (on Windows it could not). Each generation gets its own
//! directory:
//!
//! ```text
//! <root>/
//!   v3/server
//!   v4/server
//! ```
//!
//! The directory is removed when the generation's context is released.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::context::ExecutionContext;

/// Root directory holding per-generation executable copies.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    /// Create a staging area, clearing copies left behind by an earlier run.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let area = Self { root: root.into() };
        match area.sweep() {
            Ok(0) => {}
            Ok(cleaned) => tracing::info!("Cleaned up {} stale staging directories", cleaned),
            Err(e) => tracing::warn!("Failed to clean staging directory {}: {}", area.root.display(), e),
        }
        area
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy `executable` into the generation's directory and register its
    /// removal with the context.
    pub fn stage(&self, cx: &ExecutionContext, executable: &Path) -> io::Result<PathBuf> {
        let dir = self.root.join(cx.generation().to_string());
        fs::create_dir_all(&dir)?;

        let file_name = executable.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a file: {}", executable.display()),
            )
        })?;
        let staged = dir.join(file_name);
        fs::copy(executable, &staged)?;

        tracing::debug!(
            "Staged executable: {} -> {}",
            executable.display(),
            staged.display()
        );

        cx.on_release("staging", move || {
            if let Err(e) = fs::remove_dir_all(&dir) {
                tracing::warn!("Failed to remove staging directory {}: {}", dir.display(), e);
            }
        });

        Ok(staged)
    }

    /// Remove every generation directory under the root.
    ///
    /// Returns the number of directories removed.
    pub fn sweep(&self) -> io::Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }

        let mut cleaned = 0;
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_generation = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix('v'))
                .is_some_and(|n| n.parse::<u64>().is_ok());

            if is_generation && path.is_dir() && fs::remove_dir_all(&path).is_ok() {
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::generation::{ArtifactSet, GenerationId};

    fn context(id: u64) -> ExecutionContext {
        ExecutionContext::create(
            GenerationId::new(id),
            &ArtifactSet::default(),
            "server",
            &Settings::new(),
            "127.0.0.1:0".parse().unwrap(),
        )
    }

    #[test]
    fn test_stage_and_release() {
        let build = tempfile::tempdir().unwrap();
        let exe = build.path().join("server");
        fs::write(&exe, "binary").unwrap();

        let staging = tempfile::tempdir().unwrap();
        let area = StagingArea::new(staging.path());

        let cx = context(7);
        let staged = area.stage(&cx, &exe).unwrap();
        assert_eq!(staged, staging.path().join("v7").join("server"));
        assert_eq!(fs::read_to_string(&staged).unwrap(), "binary");

        // the original can be replaced while the copy is in use
        fs::write(&exe, "rebuilt").unwrap();
        assert_eq!(fs::read_to_string(&staged).unwrap(), "binary");

        drop(cx);
        assert!(!staging.path().join("v7").exists());
    }

    #[test]
    fn test_sweep_only_removes_generation_dirs() {
        let staging = tempfile::tempdir().unwrap();
        fs::create_dir(staging.path().join("v1")).unwrap();
        fs::create_dir(staging.path().join("v12")).unwrap();
        fs::create_dir(staging.path().join("keep")).unwrap();

        let area = StagingArea::new(staging.path());
        assert_eq!(area.sweep().unwrap(), 0);
        assert!(!staging.path().join("v1").exists());
        assert!(!staging.path().join("v12").exists());
        assert!(staging.path().join("keep").exists());
    }
}
