//! Operator lifecycle hooks.
//!
//! Hooks are shell commands configured through `RALPH_ON_ITERATION_START` and
//! `RALPH_ON_EXIT`. Every hook runs through [`run_with_env`], which binds the
//! loop context as environment variables. The command string itself is never
//! rewritten, so values reach the hook only through the environment.
//!
//! A failing hook is logged and otherwise ignored.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::core::flow::ExitReason;

/// Variable carrying the 1-based iteration number.
pub const ENV_ITERATION: &str = "RALPH_ITERATION";
/// Variable carrying the iteration budget.
pub const ENV_MAX_ITERATIONS: &str = "RALPH_MAX_ITERATIONS";
/// Variable carrying the exit reason (exit hook only).
pub const ENV_EXIT_REASON: &str = "RALPH_EXIT_REASON";

/// A hook command as configured by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookCommand {
    /// A command line interpreted by `sh -c`.
    Shell(String),
}

impl HookCommand {
    #[must_use]
    pub fn shell(command: impl Into<String>) -> Self {
        Self::Shell(command.into())
    }

    fn to_command(&self) -> Command {
        match self {
            Self::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
        }
    }
}

/// Runs `hook` in `cwd` with `env` added to the inherited environment.
///
/// Hook output is inherited so operators see it inline.
///
/// # Errors
///
/// Returns an error if the hook cannot be spawned or waited on.
pub async fn run_with_env(
    hook: &HookCommand,
    env: &[(&'static str, String)],
    cwd: &Path,
) -> Result<ExitStatus> {
    let mut cmd = hook.to_command();
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .envs(env.iter().map(|(k, v)| (*k, v.as_str())));

    cmd.status()
        .await
        .with_context(|| format!("Failed to run hook {hook:?}"))
}

/// A lifecycle point at which a hook may fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    IterationStart { iteration: u32, max: u32 },
    Exit { reason: ExitReason, iteration: u32, max: u32 },
}

impl HookEvent {
    /// Environment bound for this event.
    #[must_use]
    pub fn env(&self) -> Vec<(&'static str, String)> {
        match *self {
            Self::IterationStart { iteration, max } => vec![
                (ENV_ITERATION, iteration.to_string()),
                (ENV_MAX_ITERATIONS, max.to_string()),
            ],
            Self::Exit {
                reason,
                iteration,
                max,
            } => vec![
                (ENV_ITERATION, iteration.to_string()),
                (ENV_MAX_ITERATIONS, max.to_string()),
                (ENV_EXIT_REASON, reason.as_str().to_string()),
            ],
        }
    }

    const fn label(&self) -> &'static str {
        match self {
            Self::IterationStart { .. } => "iteration-start",
            Self::Exit { .. } => "exit",
        }
    }
}

/// Fires configured hooks, guaranteeing the exit hook runs at most once.
#[derive(Debug)]
pub struct HookDispatcher {
    on_iteration_start: Option<HookCommand>,
    on_exit: Option<HookCommand>,
    cwd: PathBuf,
    exit_fired: bool,
}

impl HookDispatcher {
    #[must_use]
    pub fn new(
        on_iteration_start: Option<HookCommand>,
        on_exit: Option<HookCommand>,
        cwd: &Path,
    ) -> Self {
        Self {
            on_iteration_start,
            on_exit,
            cwd: cwd.to_path_buf(),
            exit_fired: false,
        }
    }

    /// Fires the hook for `event`, if one is configured.
    ///
    /// Returns whether a hook command ran. A second exit event is ignored.
    pub async fn fire(&mut self, event: HookEvent) -> bool {
        let hook = match event {
            HookEvent::IterationStart { .. } => self.on_iteration_start.as_ref(),
            HookEvent::Exit { reason, .. } => {
                if self.exit_fired {
                    tracing::debug!(%reason, "exit hook already fired; ignoring");
                    return false;
                }
                self.exit_fired = true;
                self.on_exit.as_ref()
            }
        };
        let Some(hook) = hook else {
            return false;
        };

        let label = event.label();
        tracing::debug!(hook = label, "running hook");
        match run_with_env(hook, &event.env(), &self.cwd).await {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::warn!(hook = label, %status, "hook exited unsuccessfully"),
            Err(e) => tracing::warn!(hook = label, "hook failed: {e:#}"),
        }
        true
    }
}
