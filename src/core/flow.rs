//! Iteration controller state machine.

use std::borrow::Cow;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::retry::RetryCounters;

/// Why a run ended. Exactly one is recorded per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Replanning produced no pending tasks.
    Complete,
    /// Too many consecutive iterations without progress.
    Stall,
    /// The iteration budget ran out.
    MaxIterations,
    /// SIGINT/SIGTERM was received.
    Signal,
    /// A fatal error, such as exceeding the quota wait cap.
    Error,
}

impl ExitReason {
    /// Value exported to hooks as `RALPH_EXIT_REASON`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Stall => "stall",
            Self::MaxIterations => "max_iterations",
            Self::Signal => "signal",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phases of the iteration controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerPhase {
    /// Preflight, lock and log setup.
    Init,
    /// Running the build invocation of one iteration.
    Iterating { iteration: u32, max: u32 },
    /// Regenerating the task list after a completed cycle.
    Replanning { iteration: u32 },
    /// The run is over.
    Terminated { reason: ExitReason },
}

impl ControllerPhase {
    /// Returns a human-readable description of the current phase.
    #[must_use]
    pub fn description(&self) -> Cow<'static, str> {
        match self {
            Self::Init => Cow::Borrowed("Initializing"),
            Self::Iterating { iteration, max } => {
                Cow::Owned(format!("Iteration {iteration}/{max}"))
            }
            Self::Replanning { iteration } => {
                Cow::Owned(format!("Replanning after iteration {iteration}"))
            }
            Self::Terminated { reason } => Cow::Owned(format!("Terminated ({reason})")),
        }
    }
}

/// Mutable state of one controller run.
#[derive(Debug, Clone)]
pub struct RunState {
    pub phase: ControllerPhase,
    /// Iterations started so far (1-based once the first begins).
    pub iteration: u32,
    pub max_iterations: u32,
    /// `[DONE]` records gained across all iterations.
    pub tasks_completed: usize,
    /// Replanning cycles that finished successfully.
    pub cycles: u32,
    pub planning_failures: u32,
    pub counters: RetryCounters,
    started: Instant,
}

impl RunState {
    #[must_use]
    pub fn new(max_iterations: u32) -> Self {
        Self {
            phase: ControllerPhase::Init,
            iteration: 0,
            max_iterations,
            tasks_completed: 0,
            cycles: 0,
            planning_failures: 0,
            counters: RetryCounters::default(),
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn budget_left(&self) -> bool {
        self.iteration < self.max_iterations
    }

    #[must_use]
    pub fn summary(&self, reason: ExitReason) -> RunSummary {
        RunSummary {
            reason,
            elapsed: self.started.elapsed(),
            iterations: self.iteration,
            max_iterations: self.max_iterations,
            tasks_completed: self.tasks_completed,
            cycles: self.cycles,
            planning_failures: self.planning_failures,
            attempts: self.counters.attempts,
            quota_waits: self.counters.quota_waits,
        }
    }
}

/// End-of-run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub reason: ExitReason,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub iterations: u32,
    pub max_iterations: u32,
    pub tasks_completed: usize,
    pub cycles: u32,
    pub planning_failures: u32,
    pub attempts: u32,
    pub quota_waits: u32,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

/// Formats a duration as `1h 2m 3s`, dropping leading zero units.
#[must_use]
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run finished: {}", self.reason)?;
        writeln!(f, "  elapsed:           {}", format_elapsed(self.elapsed))?;
        writeln!(
            f,
            "  iterations used:   {}/{}",
            self.iterations, self.max_iterations
        )?;
        writeln!(f, "  tasks completed:   {}", self.tasks_completed)?;
        writeln!(f, "  replan cycles:     {}", self.cycles)?;
        if self.planning_failures > 0 {
            writeln!(f, "  planning failures: {}", self.planning_failures)?;
        }
        write!(
            f,
            "  agent invocations: {} ({} quota waits)",
            self.attempts, self.quota_waits
        )
    }
}
