//! Task ledger: declared tasks and which of them are done.
//!
//! The ledger is derived from two files the agent edits between our reads:
//! the Markdown task list and the append-only completion log. It is cheap to
//! rebuild and is never cached across an agent invocation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs;

use super::RalphPaths;

/// Prefix of a completion record line.
pub const DONE_MARKER: &str = "[DONE]";

/// Header written to a fresh completion log. Ignored when reading.
pub const COMPLETION_HEADER: &str =
    "# Completion log\n# One line per finished task: [DONE] <exact task text>\n";

/// Checkbox prefixes recognized in the task list, after leading indentation.
const TASK_PREFIXES: [&str; 6] = ["- [ ] ", "- [x] ", "- [X] ", "* [ ] ", "* [x] ", "* [X] "];

/// A declared task. Identity is the exact text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Task {
    pub text: String,
}

impl Task {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Returns the completion record line that marks this task done.
    #[must_use]
    pub fn completion_record(&self) -> String {
        format!("{DONE_MARKER} {}", self.text)
    }
}

/// Task totals derived from a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LedgerCounts {
    pub total: usize,
    pub completed: usize,
    pub remaining: usize,
}

/// Snapshot of the task list and completion log at one point in time.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    tasks: Vec<Task>,
    records: HashSet<String>,
}

impl Ledger {
    /// Reads both ledger files fresh from disk.
    ///
    /// A missing completion log counts as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the task list is missing or either file is unreadable.
    pub async fn load(paths: &RalphPaths) -> Result<Self> {
        let task_path = paths.task_list();
        let task_list = fs::read_to_string(&task_path)
            .await
            .with_context(|| format!("Failed to read task list: {}", task_path.display()))?;

        let log_path = paths.completion_log();
        let completion_log = match fs::read_to_string(&log_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read completion log: {}", log_path.display())
                });
            }
        };

        Ok(Self::parse(&task_list, &completion_log))
    }

    /// Builds a ledger from file contents.
    #[must_use]
    pub fn parse(task_list: &str, completion_log: &str) -> Self {
        let mut seen = HashSet::new();
        let tasks = task_list
            .lines()
            .filter_map(parse_task_line)
            .filter(|text| seen.insert(text.clone()))
            .map(Task::new)
            .collect();

        let records = completion_log
            .lines()
            .map(|line| line.trim_end().to_string())
            .filter(|line| line.starts_with(DONE_MARKER))
            .collect();

        Self { tasks, records }
    }

    /// Returns true iff a completion record equals this task's record line exactly.
    #[must_use]
    pub fn is_done(&self, task: &Task) -> bool {
        self.records.contains(&task.completion_record())
    }

    /// Returns the first task, in file order, that is not done.
    #[must_use]
    pub fn next_pending_task(&self) -> Option<&Task> {
        self.tasks.iter().find(|task| !self.is_done(task))
    }

    /// Returns the declared tasks in file order.
    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    #[must_use]
    pub fn counts(&self) -> LedgerCounts {
        let total = self.tasks.len();
        let completed = self.tasks.iter().filter(|t| self.is_done(t)).count();
        LedgerCounts {
            total,
            completed,
            remaining: total - completed,
        }
    }

    /// Number of declared tasks that are done.
    #[must_use]
    pub fn done_count(&self) -> usize {
        self.counts().completed
    }
}

/// Extracts the task text from a checkbox line, if it is one.
fn parse_task_line(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    TASK_PREFIXES
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))
        .map(|rest| rest.trim_end().to_string())
        .filter(|text| !text.is_empty())
}

/// Creates the completion log with its header if it does not exist.
///
/// # Errors
///
/// Returns an error if the file cannot be created.
pub async fn ensure_completion_log(path: &Path) -> Result<()> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        fs::write(path, COMPLETION_HEADER)
            .await
            .with_context(|| format!("Failed to create completion log: {}", path.display()))?;
    }
    Ok(())
}

/// Copies the completion log to a timestamped file in `archive_dir`.
///
/// The live log is left in place: a failed copy must never lose records.
///
/// # Errors
///
/// Returns an error if the archive directory cannot be created or the copy fails.
pub async fn archive_completion_log(log: &Path, archive_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(archive_dir)
        .await
        .context("Failed to create archive directory")?;

    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let mut dest = archive_dir.join(format!("progress-{timestamp}.txt"));
    let mut suffix = 1;
    while fs::try_exists(&dest).await.unwrap_or(false) {
        dest = archive_dir.join(format!("progress-{timestamp}-{suffix}.txt"));
        suffix += 1;
    }

    fs::copy(log, &dest)
        .await
        .with_context(|| format!("Failed to archive {} to {}", log.display(), dest.display()))?;
    Ok(dest)
}

/// Rewrites the completion log to contain only its header.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub async fn reset_completion_log(path: &Path) -> Result<()> {
    fs::write(path, COMPLETION_HEADER)
        .await
        .with_context(|| format!("Failed to reset completion log: {}", path.display()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // =========================================================================
    // Parsing Tests
    // =========================================================================

    mod parsing {
        use super::*;

        #[test]
        fn reads_pending_and_checked_tasks_in_file_order() {
            let list = "# Plan\n\n- [ ] first\n- [x] second\nnot a task\n  - [ ] third\n* [X] fourth\n";
            let ledger = Ledger::parse(list, "");

            let texts: Vec<&str> = ledger.tasks().iter().map(|t| t.text.as_str()).collect();
            assert_eq!(texts, ["first", "second", "third", "fourth"]);
        }

        #[test]
        fn ignores_empty_task_text_and_plain_bullets() {
            let ledger = Ledger::parse("- [ ] \n- plain bullet\n- [ ]   \n- [ ] real\n", "");
            assert_eq!(ledger.tasks(), [Task::new("real")]);
        }

        #[test]
        fn duplicate_tasks_keep_first_occurrence() {
            let ledger = Ledger::parse("- [ ] a\n- [ ] b\n- [x] a\n", "");
            assert_eq!(ledger.counts().total, 2);
        }

        /// Checkbox state in the task list is informational only.
        #[test]
        fn checked_box_without_record_is_pending() {
            let ledger = Ledger::parse("- [x] looks done\n", "");
            assert_eq!(ledger.next_pending_task(), Some(&Task::new("looks done")));
        }

        #[test]
        fn header_and_crlf_lines_in_log_are_handled() {
            let log = format!("{COMPLETION_HEADER}[DONE] a\r\n");
            let ledger = Ledger::parse("- [ ] a\r\n- [ ] b\n", &log);
            assert!(ledger.is_done(&Task::new("a")));
            assert!(!ledger.is_done(&Task::new("b")));
        }
    }

    // =========================================================================
    // Exact Matching Tests
    // =========================================================================

    mod exact_matching {
        use super::*;

        #[test]
        fn prefix_task_is_not_done_when_longer_task_is() {
            let list = "- [ ] task alpha\n- [ ] task alpha extended\n";
            let log = "[DONE] task alpha extended\n";
            let ledger = Ledger::parse(list, log);

            assert!(!ledger.is_done(&Task::new("task alpha")));
            assert!(ledger.is_done(&Task::new("task alpha extended")));
            assert_eq!(ledger.next_pending_task(), Some(&Task::new("task alpha")));
        }

        #[test]
        fn longer_task_is_not_done_when_prefix_task_is() {
            let list = "- [ ] task alpha\n- [ ] task alpha extended\n";
            let ledger = Ledger::parse(list, "[DONE] task alpha\n");

            assert_eq!(
                ledger.next_pending_task(),
                Some(&Task::new("task alpha extended"))
            );
        }

        #[test]
        fn record_must_use_exact_marker_spacing() {
            let ledger = Ledger::parse("- [ ] x\n", "[DONE]x\n[done] x\n [DONE] x\n");
            assert!(!ledger.is_done(&Task::new("x")));
        }

        #[test]
        fn next_pending_never_returns_a_done_task() {
            let list = "- [ ] a\n- [ ] b\n- [ ] c\n- [ ] d\n";
            let log = "[DONE] a\n[DONE] c\n";
            let ledger = Ledger::parse(list, log);

            assert_eq!(ledger.next_pending_task(), Some(&Task::new("b")));
            let log = "[DONE] a\n[DONE] b\n[DONE] c\n[DONE] d\n";
            assert_eq!(Ledger::parse(list, log).next_pending_task(), None);
        }

        #[test]
        fn counts_reflect_records() {
            let ledger = Ledger::parse(
                "- [ ] a\n- [ ] b\n- [ ] c\n",
                "[DONE] b\n[DONE] not declared\n",
            );
            assert_eq!(
                ledger.counts(),
                LedgerCounts {
                    total: 3,
                    completed: 1,
                    remaining: 2
                }
            );
        }
    }

    // =========================================================================
    // File Tests
    // =========================================================================

    mod files {
        use super::*;

        fn project() -> (TempDir, RalphPaths) {
            let temp = TempDir::new().unwrap();
            let paths = RalphPaths::new(temp.path());
            (temp, paths)
        }

        #[tokio::test]
        async fn load_treats_missing_completion_log_as_empty() {
            let (_temp, paths) = project();
            std::fs::write(paths.task_list(), "- [ ] one\n").unwrap();

            let ledger = Ledger::load(&paths).await.unwrap();
            assert_eq!(ledger.counts().remaining, 1);
        }

        #[tokio::test]
        async fn load_fails_without_task_list() {
            let (_temp, paths) = project();
            let err = Ledger::load(&paths).await.unwrap_err();
            assert!(err.to_string().contains("Failed to read task list"));
        }

        /// Each load observes edits made since the previous one.
        #[tokio::test]
        async fn load_rereads_files_every_time() {
            let (_temp, paths) = project();
            std::fs::write(paths.task_list(), "- [ ] one\n").unwrap();
            assert_eq!(Ledger::load(&paths).await.unwrap().done_count(), 0);

            std::fs::write(paths.completion_log(), "[DONE] one\n").unwrap();
            assert_eq!(Ledger::load(&paths).await.unwrap().done_count(), 1);
        }

        #[tokio::test]
        async fn ensure_completion_log_writes_header_once() {
            let (_temp, paths) = project();
            let log = paths.completion_log();

            ensure_completion_log(&log).await.unwrap();
            assert_eq!(std::fs::read_to_string(&log).unwrap(), COMPLETION_HEADER);

            std::fs::write(&log, "[DONE] kept\n").unwrap();
            ensure_completion_log(&log).await.unwrap();
            assert_eq!(std::fs::read_to_string(&log).unwrap(), "[DONE] kept\n");
        }

        #[tokio::test]
        async fn archive_copies_and_keeps_original() {
            let (_temp, paths) = project();
            let log = paths.completion_log();
            std::fs::write(&log, "[DONE] a\n").unwrap();

            let first = archive_completion_log(&log, &paths.archive_dir())
                .await
                .unwrap();
            let second = archive_completion_log(&log, &paths.archive_dir())
                .await
                .unwrap();

            assert_ne!(first, second);
            assert_eq!(std::fs::read_to_string(&first).unwrap(), "[DONE] a\n");
            assert_eq!(std::fs::read_to_string(&log).unwrap(), "[DONE] a\n");
        }

        #[tokio::test]
        async fn archive_of_missing_log_fails_without_side_effects() {
            let (_temp, paths) = project();
            let result =
                archive_completion_log(&paths.completion_log(), &paths.archive_dir()).await;
            assert!(result.is_err());
        }

        #[tokio::test]
        async fn reset_leaves_only_header() {
            let (_temp, paths) = project();
            let log = paths.completion_log();
            std::fs::write(&log, "[DONE] a\n[DONE] b\n").unwrap();

            reset_completion_log(&log).await.unwrap();

            let content = std::fs::read_to_string(&log).unwrap();
            assert_eq!(content, COMPLETION_HEADER);
            assert_eq!(Ledger::parse("- [ ] a\n", &content).done_count(), 0);
        }
    }
}
