//! Single-instance guard for a project directory.
//!
//! Acquisition is an advisory, exclusive, non-blocking lock on the lock file
//! (`flock(LOCK_EX | LOCK_NB)` on Unix). The lock lives as long as the open
//! file handle, so the OS releases it on every exit path, including crashes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;

use crate::error::RalphError;

/// An acquired project lock. Dropping it releases the lock.
///
/// The file itself is left on disk; removing it would let a third process
/// lock a fresh inode while a second one still holds the old one.
#[derive(Debug)]
pub struct LockHandle {
    file: File,
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Acquires the exclusive project lock without waiting.
///
/// On success the holder's PID is recorded in the file so a competing
/// instance can report it.
///
/// # Errors
///
/// Returns [`RalphError::AlreadyRunning`] immediately if another handle holds
/// the lock, or an I/O error if the lock file cannot be opened.
pub fn acquire_lock(path: &Path) -> Result<LockHandle, RalphError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    if let Err(err) = file.try_lock_exclusive() {
        if err.kind() == fs2::lock_contended_error().kind() {
            return Err(RalphError::AlreadyRunning {
                path: path.to_path_buf(),
                holder: read_holder(&mut file),
            });
        }
        return Err(err.into());
    }

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()?;

    tracing::debug!(path = %path.display(), "acquired project lock");
    Ok(LockHandle { file })
}

fn read_holder(file: &mut File) -> Option<String> {
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    let pid = content.trim();
    (!pid.is_empty()).then(|| pid.to_string())
}
