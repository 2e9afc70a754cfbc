//! §5 "Directory locking": an exclusive OS-level lock on a `~dirty` marker file. The marker
//! existing at open time (before the new lock is acquired) means a previous run crashed or
//! was killed without closing cleanly, and the directory should go through verification
//! before being trusted. Grounded on `fs2`'s `FileExt::try_lock_exclusive`, the same crate
//! the pack uses for advisory file locks.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Result, StateError};

const MARKER_NAME: &str = "~dirty";

/// RAII guard around the `~dirty` marker and its exclusive lock. Dropping it without calling
/// [`DirLock::release`] leaves the marker in place, which is the crash-safety point: a clean
/// shutdown is the only path that removes it.
pub struct DirLock {
    path: PathBuf,
    file: Option<File>,
}

impl DirLock {
    /// Acquires the lock, reporting whether the marker already existed (a stale-lock /
    /// unclean-shutdown signal the caller should act on, typically by running the verifier).
    pub fn acquire(dir: impl AsRef<Path>) -> Result<(Self, bool)> {
        let path = dir.as_ref().join(MARKER_NAME);
        let pre_existing = path.exists();

        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            StateError::Contention(format!("{:?} is locked by another process", path))
        })?;

        Ok((
            Self {
                path,
                file: Some(file),
            },
            pre_existing,
        ))
    }

    /// Releases the lock and removes the marker: the "clean close" signal (§5).
    pub fn release(mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            FileExt::unlock(&file).ok();
        }
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
    }
}
