//! Tracking and removal of the local files one pipeline run creates.

use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::{debug, warn};

/// Local artifacts owned by a single pipeline run.
///
/// Paths are registered before they are written, so a half-finished
/// download or a partial tool output is still removed.
#[derive(Debug, Default)]
pub struct Scratch {
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_file(&mut self, path: impl Into<PathBuf>) {
        self.files.push(path.into());
    }

    /// Register a directory; it is removed recursively.
    pub fn track_dir(&mut self, path: impl Into<PathBuf>) {
        self.dirs.push(path.into());
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }

    /// Best-effort removal of everything tracked.
    ///
    /// Paths that no longer exist are fine. Other failures are logged and
    /// counted but never returned.
    pub async fn cleanup(self) -> usize {
        let mut failures = 0;

        for file in &self.files {
            match tokio::fs::remove_file(file).await {
                Ok(()) => debug!(path = %file.display(), "Removed staged file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    failures += 1;
                    warn!(path = %file.display(), error = %e, "Failed to remove staged file");
                }
            }
        }

        for dir in &self.dirs {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => debug!(path = %dir.display(), "Removed staging directory"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    failures += 1;
                    warn!(path = %dir.display(), error = %e, "Failed to remove staging directory");
                }
            }
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cleanup_removes_files_and_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.xml");
        let dir = tmp.path().join("extract");
        std::fs::write(&file, b"<score/>").unwrap();
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("nested/b.xml"), b"<score/>").unwrap();

        let mut scratch = Scratch::new();
        scratch.track_file(&file);
        scratch.track_dir(&dir);

        assert_eq!(scratch.cleanup().await, 0);
        assert!(!file.exists());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_cleanup_ignores_missing_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let mut scratch = Scratch::new();
        scratch.track_file(tmp.path().join("never-written.mei"));
        scratch.track_dir(tmp.path().join("never-created"));

        assert_eq!(scratch.cleanup().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_leaves_untracked_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mine = tmp.path().join("1-score.xml");
        let theirs = tmp.path().join("2-score.xml");
        std::fs::write(&mine, b"a").unwrap();
        std::fs::write(&theirs, b"b").unwrap();

        let mut scratch = Scratch::new();
        scratch.track_file(&mine);
        scratch.cleanup().await;

        assert!(!mine.exists());
        assert!(theirs.exists());
    }
}
