//! File system operations.

use std::path::{Path, PathBuf};

use anyhow::Context;

pub mod config;
pub mod ledger;
pub mod lock;
pub mod logs;

pub use config::{Config, parse_bool};
pub use ledger::{COMPLETION_HEADER, DONE_MARKER, Ledger, LedgerCounts, Task};
pub use lock::{LockHandle, acquire_lock};
pub use logs::{RunLog, remove_capture_files, rotate};

/// Task list file name, relative to the project root.
pub const TASK_LIST_FILE: &str = "TASKS.md";

/// Completion log file name, relative to the project root.
pub const COMPLETION_LOG_FILE: &str = "progress.txt";

/// Iteration prompt file name, relative to the project root.
pub const PROMPT_FILE: &str = "PROMPT.md";

/// Lock file name, relative to the project root.
pub const LOCK_FILE: &str = ".ralph.lock";

/// Holds all ralph-related paths derived from a project root.
///
/// Tests construct this over a temporary directory; production code roots it
/// at `--dir` or the current working directory.
///
/// # Example
///
/// ```
/// use std::path::Path;
/// use ralph::fs::RalphPaths;
///
/// let paths = RalphPaths::new(Path::new("/tmp/project"));
/// assert_eq!(paths.task_list(), Path::new("/tmp/project/TASKS.md"));
/// assert_eq!(paths.log_dir(), Path::new("/tmp/project/.ralph/logs"));
/// ```
#[derive(Debug, Clone)]
pub struct RalphPaths {
    root: PathBuf,
}

impl RalphPaths {
    /// Creates paths rooted at the given project directory.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Creates paths rooted at the current working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn from_cwd() -> anyhow::Result<Self> {
        let root = std::env::current_dir().context("Failed to get current directory")?;
        Ok(Self { root })
    }

    /// Returns the project root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the `.ralph` state directory.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(".ralph")
    }

    /// Returns the run-log directory (`.ralph/logs`).
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }

    /// Returns the completion-log archive directory (`.ralph/archive`).
    #[must_use]
    pub fn archive_dir(&self) -> PathBuf {
        self.state_dir().join("archive")
    }

    /// Returns the task list path (`TASKS.md`).
    #[must_use]
    pub fn task_list(&self) -> PathBuf {
        self.root.join(TASK_LIST_FILE)
    }

    /// Returns the completion log path (`progress.txt`).
    #[must_use]
    pub fn completion_log(&self) -> PathBuf {
        self.root.join(COMPLETION_LOG_FILE)
    }

    /// Returns the iteration prompt path (`PROMPT.md`).
    #[must_use]
    pub fn prompt_file(&self) -> PathBuf {
        self.root.join(PROMPT_FILE)
    }

    /// Returns the lock file path (`.ralph.lock`).
    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Ensures the log and archive directories exist.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure_state_dirs(&self) -> anyhow::Result<()> {
        for dir in [self.log_dir(), self.archive_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn paths_are_derived_from_root() {
        let paths = RalphPaths::new(Path::new("/work/project"));

        assert_eq!(paths.root(), Path::new("/work/project"));
        assert_eq!(paths.state_dir(), Path::new("/work/project/.ralph"));
        assert_eq!(paths.log_dir(), Path::new("/work/project/.ralph/logs"));
        assert_eq!(
            paths.archive_dir(),
            Path::new("/work/project/.ralph/archive")
        );
        assert_eq!(paths.task_list(), Path::new("/work/project/TASKS.md"));
        assert_eq!(
            paths.completion_log(),
            Path::new("/work/project/progress.txt")
        );
        assert_eq!(paths.prompt_file(), Path::new("/work/project/PROMPT.md"));
        assert_eq!(paths.lock_file(), Path::new("/work/project/.ralph.lock"));
    }

    #[test]
    fn ensure_state_dirs_creates_log_and_archive() {
        let temp = TempDir::new().unwrap();
        let paths = RalphPaths::new(temp.path());

        assert!(!paths.log_dir().exists());
        paths.ensure_state_dirs().unwrap();
        assert!(paths.log_dir().is_dir());
        assert!(paths.archive_dir().is_dir());

        // Idempotent.
        paths.ensure_state_dirs().unwrap();
    }
}
