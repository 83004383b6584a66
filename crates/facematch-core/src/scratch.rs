//! Scratch artifacts: uniquely named files that are deleted when their guard drops.
//!
//! A [`ScratchDir`] hands out [`ScratchFile`] guards. Each guard owns exactly one
//! file and removes it on [`ScratchFile::release`] or on drop, whichever comes
//! first, so cleanup also runs on early returns and unwinding.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use uuid::Uuid;

/// A directory in which uniquely named, individually owned files are created.
///
/// Clones share the live-artifact counter.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
    live: Arc<AtomicUsize>,
}

impl ScratchDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of artifacts created through this directory that are still on disk.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Generate a fresh `<prefix>_<uuid>.<ext>` path. Nothing is created.
    pub fn allocate(&self, prefix: &str, ext: &str) -> PathBuf {
        self.root
            .join(format!("{prefix}_{}.{ext}", Uuid::new_v4().simple()))
    }

    /// Write `bytes` to a newly allocated path and return its guard.
    ///
    /// The file is opened with `create_new`, so an existing file is never
    /// clobbered. A failed write removes whatever was written.
    pub fn create(&self, prefix: &str, ext: &str, bytes: &[u8]) -> io::Result<ScratchFile> {
        let path = self.allocate(prefix, ext);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;

        if let Err(e) = file.write_all(bytes).and_then(|()| file.sync_data()) {
            drop(file);
            discard_partial(&path);
            return Err(e);
        }

        self.live.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "scratch file created");

        Ok(ScratchFile {
            path,
            live: Some(Arc::clone(&self.live)),
        })
    }
}

/// Owning guard for one scratch file.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    /// `None` once released.
    live: Option<Arc<AtomicUsize>>,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name component, used for self-exclusion during gallery enumeration.
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    pub fn is_released(&self) -> bool {
        self.live.is_none()
    }

    /// Delete the file. Calling this again, or after the file vanished, is a no-op.
    ///
    /// If removal fails the guard stays live, so a later call or `Drop` retries.
    pub fn release(&mut self) -> io::Result<()> {
        let Some(live) = &self.live else {
            return Ok(());
        };
        release_path(&self.path)?;
        live.fetch_sub(1, Ordering::AcqRel);
        self.live = None;
        tracing::debug!(path = %self.path.display(), "scratch file released");
        Ok(())
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove scratch file");
        }
    }
}

/// Best-effort removal of a file whose write failed.
fn discard_partial(path: &Path) {
    if let Err(e) = release_path(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove partial scratch file");
    }
}

/// Remove `path` if it exists. A missing file is not an error.
pub fn release_path(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_allocate_is_unique_and_uncreated() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchDir::new(dir.path());
        let a = scratch.allocate("resized", "jpg");
        let b = scratch.allocate("resized", "jpg");
        assert_ne!(a, b);
        assert!(!a.exists());
        assert!(a.file_name().unwrap().to_str().unwrap().starts_with("resized_"));
        assert_eq!(a.extension().unwrap(), "jpg");
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchDir::new(dir.path());
        let path = {
            let file = scratch.create("temp", "jpg", b"payload").unwrap();
            assert_eq!(fs::read(file.path()).unwrap(), b"payload");
            assert_eq!(scratch.live(), 1);
            file.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(scratch.live(), 0);
    }

    #[test]
    fn test_release_twice_is_noop() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchDir::new(dir.path());
        let mut file = scratch.create("temp", "jpg", b"x").unwrap();
        file.release().unwrap();
        assert!(file.is_released());
        file.release().unwrap();
        drop(file);
        assert_eq!(scratch.live(), 0);
    }

    #[test]
    fn test_release_after_external_delete() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchDir::new(dir.path());
        let mut file = scratch.create("temp", "jpg", b"x").unwrap();
        fs::remove_file(file.path()).unwrap();
        assert!(file.release().is_ok());
        assert_eq!(scratch.live(), 0);
    }

    #[test]
    fn test_failed_release_stays_live_and_retries() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchDir::new(dir.path());
        let mut file = scratch.create("temp", "jpg", b"x").unwrap();

        // A non-empty directory in the file's place cannot be unlinked.
        fs::remove_file(file.path()).unwrap();
        fs::create_dir(file.path()).unwrap();
        fs::write(file.path().join("inner"), b"y").unwrap();

        assert!(file.release().is_err());
        assert!(!file.is_released());
        assert_eq!(scratch.live(), 1);

        fs::remove_dir_all(file.path()).unwrap();
        file.release().unwrap();
        assert!(file.is_released());
        assert_eq!(scratch.live(), 0);
    }

    #[test]
    fn test_discard_partial_removes_file_and_tolerates_failure() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("resized_partial.jpg");
        fs::write(&partial, b"half").unwrap();
        discard_partial(&partial);
        assert!(!partial.exists());

        let stuck = dir.path().join("stuck.jpg");
        fs::create_dir(&stuck).unwrap();
        discard_partial(&stuck);
        assert!(stuck.is_dir());
    }

    #[test]
    fn test_release_path_never_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("never_created.jpg");
        assert!(release_path(&path).is_ok());
        assert!(release_path(&path).is_ok());
    }

    #[test]
    fn test_create_in_missing_dir_fails_without_counting() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchDir::new(dir.path().join("missing"));
        assert!(scratch.create("temp", "jpg", b"x").is_err());
        assert_eq!(scratch.live(), 0);
    }

    #[test]
    fn test_file_name_matches_path() {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchDir::new(dir.path());
        let file = scratch.create("temp", "jpg", b"x").unwrap();
        assert_eq!(dir.path().join(file.file_name()), file.path());
    }
}
