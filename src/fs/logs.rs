//! Run logs and their retention.
//!
//! Each controller run writes one `ralph-YYYYmmdd-HHMMSS.log` file. Retention
//! only ever looks at files following that naming convention, so anything else
//! dropped into the directory by other tools is left alone.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};

/// File name prefix of controller-owned run logs.
pub const RUN_LOG_PREFIX: &str = "ralph-";

/// File name suffix of controller-owned run logs.
pub const RUN_LOG_SUFFIX: &str = ".log";

/// File name prefix of transient agent-output capture files.
pub const CAPTURE_PREFIX: &str = ".capture-";

/// Timestamp format embedded in run log names.
const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Length of a formatted [`STAMP_FORMAT`] value.
const STAMP_LEN: usize = "YYYYmmdd-HHMMSS".len();

/// Returns true if `name` is exactly a name [`RunLog::create`] produces:
/// `ralph-YYYYmmdd-HHMMSS.log`, optionally with a `-N` collision suffix.
#[must_use]
pub fn is_run_log_name(name: &str) -> bool {
    let Some(body) = name
        .strip_prefix(RUN_LOG_PREFIX)
        .and_then(|rest| rest.strip_suffix(RUN_LOG_SUFFIX))
    else {
        return false;
    };
    if body.len() < STAMP_LEN || !body.is_char_boundary(STAMP_LEN) {
        return false;
    }

    let (stamp, tail) = body.split_at(STAMP_LEN);
    if chrono::NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).is_err() {
        return false;
    }
    match tail.strip_prefix('-') {
        None => tail.is_empty(),
        Some(n) => !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()),
    }
}

/// The append-only log file for this run.
///
/// Cloning shares the underlying file handle.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
    file: Arc<File>,
}

impl RunLog {
    /// Prunes old run logs, then creates this run's log in `dir`.
    ///
    /// Rotation happens first so the new file never counts against `keep`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn create(dir: &Path, keep: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        rotate(dir, keep)?;

        let stamp = chrono::Local::now().format(STAMP_FORMAT);
        let mut path = dir.join(format!("{RUN_LOG_PREFIX}{stamp}{RUN_LOG_SUFFIX}"));
        let mut n = 1;
        while path.exists() {
            path = dir.join(format!("{RUN_LOG_PREFIX}{stamp}-{n}{RUN_LOG_SUFFIX}"));
            n += 1;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to create run log: {}", path.display()))?;

        Ok(Self {
            path,
            file: Arc::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the shared file handle, for use as a tracing writer.
    #[must_use]
    pub fn file(&self) -> Arc<File> {
        Arc::clone(&self.file)
    }

    /// Appends raw text, adding a trailing newline if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn append(&self, text: &str) -> Result<()> {
        let mut file = &*self.file;
        file.write_all(text.as_bytes())?;
        if !text.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        Ok(())
    }
}

/// Deletes all but the `keep` newest run logs in `dir`.
///
/// `keep == 0` keeps everything. Only files matching [`is_run_log_name`] are
/// considered. Returns the deleted paths.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn rotate(dir: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    if keep == 0 || !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut logs: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read log directory: {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let owned = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(is_run_log_name);
        if owned
            && let Ok(metadata) = entry.metadata()
            && metadata.is_file()
        {
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            logs.push((path, modified));
        }
    }

    // Newest first; name breaks ties since names embed the creation time.
    logs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut deleted = Vec::new();
    for (path, _) in logs.into_iter().skip(keep) {
        match std::fs::remove_file(&path) {
            Ok(()) => deleted.push(path),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove old run log"),
        }
    }
    if !deleted.is_empty() {
        tracing::debug!(count = deleted.len(), "pruned old run logs");
    }
    Ok(deleted)
}

/// Removes transient capture files left behind in `dir`.
///
/// Returns how many files were removed.
pub fn remove_capture_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let is_capture = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(CAPTURE_PREFIX));
        if is_capture && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}
