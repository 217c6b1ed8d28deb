//! Process-level error taxonomy and exit codes.
//!
//! Module internals use `anyhow` for contextual I/O errors. Anything that can
//! terminate the process is funneled into [`RalphError`], which knows the exit
//! code it maps to.

use std::path::PathBuf;

use thiserror::Error;

/// Exit code for a normal termination (including an exhausted budget).
pub const EXIT_OK: i32 = 0;
/// Exit code for unexpected failures.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for a missing tool, missing input, or invalid configuration.
pub const EXIT_PREFLIGHT: i32 = 2;
/// Exit code when another controller already holds the project lock.
pub const EXIT_LOCKED: i32 = 3;
/// Exit code when the stall limit was reached.
pub const EXIT_STALLED: i32 = 4;
/// Exit code when the configured quota wait cap was exceeded.
pub const EXIT_QUOTA: i32 = 5;
/// Exit code for an invocation that timed out on every attempt.
pub const EXIT_TIMEOUT: i32 = 124;

/// Errors that end the controller.
#[derive(Debug, Error)]
pub enum RalphError {
    /// A required external tool or input file is missing.
    #[error("{0}")]
    Preflight(String),

    /// A configuration variable failed validation.
    #[error("invalid {var}={value:?}: {reason}")]
    Config {
        var: &'static str,
        value: String,
        reason: &'static str,
    },

    /// Another controller holds the project lock.
    #[error("another ralph instance is already running in this project (lock: {}{})", path.display(), holder.as_ref().map(|pid| format!(", pid {pid}")).unwrap_or_default())]
    AlreadyRunning {
        path: PathBuf,
        holder: Option<String>,
    },

    /// The loop made no progress for `stalls` consecutive iterations.
    #[error("stalled: no task completed in {stalls} consecutive iterations (RALPH_MAX_STALLS={stalls})")]
    Stalled { stalls: u32 },

    /// The agent kept reporting quota exhaustion past the configured cap.
    #[error("quota wait limit reached: agent still out of quota after {limit} wait(s) (RALPH_QUOTA_MAX_WAITS={limit})")]
    QuotaWaitLimit { limit: u32 },

    /// A standalone invocation timed out on every attempt.
    #[error("agent invocation timed out after {attempts} attempt(s)")]
    InvocationTimeout { attempts: u32 },

    /// A standalone invocation failed on every attempt.
    #[error("agent invocation failed after {attempts} attempt(s)")]
    InvocationFailed { attempts: u32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RalphError {
    /// Returns the process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Preflight(_) | Self::Config { .. } => EXIT_PREFLIGHT,
            Self::AlreadyRunning { .. } => EXIT_LOCKED,
            Self::Stalled { .. } => EXIT_STALLED,
            Self::QuotaWaitLimit { .. } => EXIT_QUOTA,
            Self::InvocationTimeout { .. } => EXIT_TIMEOUT,
            Self::InvocationFailed { .. } | Self::Other(_) => EXIT_FAILURE,
        }
    }
}

impl From<std::io::Error> for RalphError {
    fn from(err: std::io::Error) -> Self {
        Self::Other(err.into())
    }
}
