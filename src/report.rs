//! Read-only reports for `status` and `dry-run`.
//!
//! Neither report takes the project lock; both read the ledger once.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::fs::{Ledger, LedgerCounts, RalphPaths};

/// Message printed when no task is pending.
pub const ALL_COMPLETE: &str = "All tasks complete";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    pub text: String,
    pub done: bool,
}

/// Ledger summary rendered by `ralph status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub root: PathBuf,
    #[serde(flatten)]
    pub counts: LedgerCounts,
    pub next: Option<String>,
    pub tasks: Vec<TaskStatus>,
}

impl StatusReport {
    #[must_use]
    pub fn from_ledger(paths: &RalphPaths, ledger: &Ledger) -> Self {
        Self {
            root: paths.root().to_path_buf(),
            counts: ledger.counts(),
            next: ledger.next_pending_task().map(|t| t.text.clone()),
            tasks: ledger
                .tasks()
                .iter()
                .map(|task| TaskStatus {
                    text: task.text.clone(),
                    done: ledger.is_done(task),
                })
                .collect(),
        }
    }

    /// Pretty JSON for `--json`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let LedgerCounts {
            total,
            completed,
            remaining,
        } = self.counts;
        writeln!(f, "Project: {}", self.root.display())?;
        writeln!(f, "Tasks:   {completed}/{total} done, {remaining} remaining")?;
        for task in &self.tasks {
            let mark = if task.done { 'x' } else { ' ' };
            writeln!(f, "  [{mark}] {}", task.text)?;
        }
        match &self.next {
            Some(next) => write!(f, "Next:    {next}"),
            None => write!(f, "{ALL_COMPLETE}"),
        }
    }
}

/// The single line `ralph dry-run` prints: the next pending task, or
/// [`ALL_COMPLETE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunReport {
    pub next: Option<String>,
}

impl DryRunReport {
    #[must_use]
    pub fn new(ledger: &Ledger) -> Self {
        Self {
            next: ledger.next_pending_task().map(|t| t.text.clone()),
        }
    }
}

impl fmt::Display for DryRunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.next {
            Some(next) => write!(f, "Next task: {next}"),
            None => write!(f, "{ALL_COMPLETE}"),
        }
    }
}
