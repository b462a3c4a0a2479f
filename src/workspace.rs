use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Owns every temp artifact of one assembly run.
///
/// Artifacts live in a private directory that is removed when the workspace is
/// dropped, so success, failure and cancellation all release the same set.
pub struct Workspace {
    dir: Option<TempDir>,
    files: Vec<PathBuf>,
    keep: bool,
}

impl Workspace {
    pub fn create(parent: Option<&Path>, keep: bool) -> Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("comicvideo_");
            b
        };
        let dir = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        info!("Created workspace '{}'", dir.path().display());
        Ok(Self {
            dir: Some(dir),
            files: Vec::new(),
            keep,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir
            .as_ref()
            .map(TempDir::path)
            .unwrap_or_else(|| Path::new("."))
    }

    /// Reserves a unique artifact path; the file itself is created by the caller.
    pub fn artifact(&mut self, name: &str) -> PathBuf {
        let path = self.path().join(name);
        debug!("Reserved artifact {}", path.display());
        self.files.push(path.clone());
        path
    }

    pub fn artifact_count(&self) -> usize {
        self.files.len()
    }

    /// Removes every artifact. Errors are logged, never returned.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        if self.keep {
            let kept = dir.into_path();
            info!("Keeping workspace '{}' ({} artifacts)", kept.display(), self.files.len());
            return;
        }
        let shown = dir.path().display().to_string();
        match dir.close() {
            Ok(()) => info!("Removed workspace '{}'", shown),
            Err(e) => warn!("Failed to remove workspace '{}': {}", shown, e),
        }
        self.files.clear();
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_removes_all_artifacts() {
        let parent = tempfile::tempdir().unwrap();
        let mut ws = Workspace::create(Some(parent.path()), false).unwrap();
        let a = ws.artifact("a.wav");
        std::fs::write(&a, b"data").unwrap();
        let root = ws.path().to_path_buf();
        assert_eq!(ws.artifact_count(), 1);
        ws.close();
        assert!(!a.exists());
        assert!(!root.exists());
    }

    #[test]
    fn drop_releases_on_early_exit() {
        let parent = tempfile::tempdir().unwrap();
        let root = {
            let mut ws = Workspace::create(Some(parent.path()), false).unwrap();
            std::fs::write(ws.artifact("clip.mp4"), b"x").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn keep_leaves_artifacts_in_place() {
        let parent = tempfile::tempdir().unwrap();
        let mut ws = Workspace::create(Some(parent.path()), true).unwrap();
        let a = ws.artifact("subs.srt");
        std::fs::write(&a, b"1").unwrap();
        ws.close();
        assert!(a.exists());
    }
}
