//! Exclusive lock on a run directory
//!
//! Held for the lifetime of one sequencer execution. The lock is an OS advisory
//! lock on `<output_dir>/run.lock`, so it disappears with the process and a crash
//! never leaves a stale lock behind. The file itself is left in place and carries
//! the holder's pid for diagnostics.

use crate::error::{RunError, RunResult};
use std::fs::{File, OpenOptions, TryLockError};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Guard for an acquired run directory lock
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
    acquired_at: Instant,
}

impl RunLock {
    /// Take the lock without waiting; `RunError::RunLocked` if another holder exists
    pub fn acquire(path: impl AsRef<Path>) -> RunResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| RunError::io(&path, e))?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                tracing::error!(lock = %path.display(), "Run directory is already in use");
                return Err(RunError::RunLocked { path });
            }
            Err(TryLockError::Error(e)) => return Err(RunError::io(&path, e)),
        }

        file.set_len(0).map_err(|e| RunError::io(&path, e))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| RunError::io(&path, e))?;
        writeln!(file, "{}", std::process::id()).map_err(|e| RunError::io(&path, e))?;

        tracing::debug!(lock = %path.display(), "Run directory lock acquired");
        Ok(Self {
            file,
            path,
            acquired_at: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(lock = %self.path.display(), error = %e, "Failed to release run lock");
            return;
        }
        tracing::debug!(
            lock = %self.path.display(),
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Run directory lock released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");

        let first = RunLock::acquire(&path).unwrap();
        match RunLock::acquire(&path) {
            Err(RunError::RunLocked { path: locked }) => assert_eq!(locked, path),
            other => panic!("expected RunLocked, got {:?}", other),
        }

        drop(first);
        assert!(RunLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_lock_file_records_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        let _lock = RunLock::acquire(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }
}
