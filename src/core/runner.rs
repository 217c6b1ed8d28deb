//! The iteration controller.
//!
//! One run is: prepare ([`prepare`]: preflight, completion log, lock, run log),
//! then up to `max_iterations` build iterations, each followed by a replanning
//! sub-cycle whenever the agent reports completion, then exactly one
//! termination path. The ledger files are re-read around every invocation;
//! nothing parsed from them survives an iteration boundary.

use anyhow::Context;

use crate::core::executor::AgentExecutor;
use crate::core::flow::{ControllerPhase, ExitReason, RunState, RunSummary};
use crate::core::hooks::{HookDispatcher, HookEvent};
use crate::core::prompts::{contains_completion_token, replan_prompt, wrap_for_iteration};
use crate::core::publish::Publisher;
use crate::core::retry::{InvocationKind, InvocationResult, Invoker, RetryConfig, RetryCounters};
use crate::core::shutdown::{ShutdownSignal, cleanup_transient};
use crate::core::stall::{StallAction, StallDetector};
use crate::core::cli_check::preflight;
use crate::error::{EXIT_OK, RalphError};
use crate::fs::ledger::{archive_completion_log, ensure_completion_log, reset_completion_log};
use crate::fs::{Config, Ledger, LockHandle, RalphPaths, RunLog, acquire_lock};

/// Lines of failed agent output echoed into the log.
const FAILURE_TAIL_LINES: usize = 20;

/// Resources held for the lifetime of a run.
#[derive(Debug)]
pub struct Session {
    /// Dropping this releases the project lock.
    pub lock: LockHandle,
    pub run_log: RunLog,
}

/// Init phase: everything that must succeed before the first iteration.
///
/// Stale capture files from a crashed run are removed once the lock is held.
///
/// # Errors
///
/// Returns [`RalphError::Preflight`] for missing tools or inputs,
/// [`RalphError::AlreadyRunning`] if another controller holds the lock, or
/// an I/O error if the state directories or run log cannot be created.
pub async fn prepare(config: &Config, paths: &RalphPaths) -> Result<Session, RalphError> {
    preflight(config, paths)?;
    paths.ensure_state_dirs()?;
    ensure_completion_log(&paths.completion_log()).await?;

    let lock = acquire_lock(&paths.lock_file())?;
    let run_log = RunLog::create(&paths.log_dir(), config.log_keep)?;
    cleanup_transient(&paths.log_dir());
    tracing::debug!(log = %run_log.path().display(), "run log created");

    Ok(Session { lock, run_log })
}

/// How a run ended.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    /// Set when the reason carries a failure (stall, fatal error).
    pub error: Option<RalphError>,
}

impl RunOutcome {
    #[must_use]
    pub const fn reason(&self) -> ExitReason {
        self.summary.reason
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map_or(EXIT_OK, RalphError::exit_code)
    }
}

/// Why the iteration loop stopped.
struct Stop {
    reason: ExitReason,
    error: Option<RalphError>,
}

impl Stop {
    const fn clean(reason: ExitReason) -> Self {
        Self {
            reason,
            error: None,
        }
    }

    fn fatal(reason: ExitReason, error: impl Into<RalphError>) -> Self {
        Self {
            reason,
            error: Some(error.into()),
        }
    }
}

/// Drives iterations until completion, budget exhaustion, a stall, a signal
/// or a fatal error.
pub struct Controller<'a> {
    config: &'a Config,
    paths: &'a RalphPaths,
    invoker: Invoker<'a>,
    publisher: &'a dyn Publisher,
    hooks: HookDispatcher,
    stall: StallDetector,
    shutdown: ShutdownSignal,
    state: RunState,
}

impl<'a> Controller<'a> {
    #[must_use]
    pub fn new(
        config: &'a Config,
        paths: &'a RalphPaths,
        executor: &'a dyn AgentExecutor,
        publisher: &'a dyn Publisher,
        shutdown: ShutdownSignal,
    ) -> Self {
        let invoker = Invoker::new(
            executor,
            RetryConfig::from_config(config),
            &paths.log_dir(),
            shutdown.clone(),
        );
        Self {
            config,
            paths,
            invoker,
            publisher,
            hooks: HookDispatcher::new(
                config.on_iteration_start.clone(),
                config.on_exit.clone(),
                paths.root(),
            ),
            stall: StallDetector::new(config.max_stalls),
            shutdown,
            state: RunState::new(config.max_iterations),
        }
    }

    /// Mirrors agent output into the run log.
    #[must_use]
    pub fn with_run_log(mut self, run_log: Option<RunLog>) -> Self {
        self.invoker = self.invoker.with_run_log(run_log);
        self
    }

    /// Echoes agent output to the terminal.
    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.invoker = self.invoker.with_echo(echo);
        self
    }

    /// Runs up to `max_iterations` iterations and terminates exactly once.
    pub async fn run(mut self, max_iterations: u32) -> RunOutcome {
        self.state.max_iterations = max_iterations;
        tracing::info!(
            "starting loop: up to {max_iterations} iteration(s) in {}",
            self.paths.root().display()
        );
        let stop = self.iterate().await;
        self.terminate(stop).await
    }

    async fn iterate(&mut self) -> Stop {
        while self.state.budget_left() {
            if self.shutdown.is_requested() {
                return Stop::clean(ExitReason::Signal);
            }

            self.state.iteration += 1;
            let iteration = self.state.iteration;
            let max = self.state.max_iterations;
            self.state.phase = ControllerPhase::Iterating { iteration, max };
            tracing::info!("{}", self.state.phase.description());
            self.hooks
                .fire(HookEvent::IterationStart { iteration, max })
                .await;

            let before = match Ledger::load(self.paths).await {
                Ok(ledger) => ledger,
                Err(e) => {
                    tracing::warn!("iteration {iteration}: skipped, {e:#}");
                    if let Some(stop) = self.record_stall(iteration) {
                        return stop;
                    }
                    continue;
                }
            };
            if before.next_pending_task().is_none() {
                tracing::info!("no pending tasks at iteration start");
                if let Some(stop) = self.replan(iteration).await {
                    return stop;
                }
                continue;
            }

            let prompt = match self.iteration_prompt(&before).await {
                Ok(prompt) => prompt,
                Err(e) => {
                    tracing::warn!("iteration {iteration}: skipped, {e:#}");
                    if let Some(stop) = self.record_stall(iteration) {
                        return stop;
                    }
                    continue;
                }
            };
            let done_before = before.done_count();

            let result = match self.invoker.invoke(&prompt, &mut self.state.counters).await {
                Ok(result) => Some(result),
                Err(e @ RalphError::QuotaWaitLimit { .. }) => {
                    return Stop::fatal(ExitReason::Error, e);
                }
                Err(e) => {
                    tracing::warn!("iteration {iteration}: invocation error: {e}");
                    None
                }
            };
            if let Some(result) = result.as_ref().filter(|r| !r.is_success()) {
                log_failure(iteration, result);
            }

            if self.shutdown.is_requested() {
                return Stop::clean(ExitReason::Signal);
            }

            let done_after = match Ledger::load(self.paths).await {
                Ok(ledger) => Some(ledger.done_count()),
                Err(e) => {
                    tracing::warn!("iteration {iteration}: progress not measured, {e:#}");
                    None
                }
            };
            if let Some(done_after) = done_after {
                let gained = done_after.saturating_sub(done_before);
                self.state.tasks_completed += gained;
                match self.stall.observe(done_before, done_after) {
                    StallAction::Reset => {
                        tracing::info!("iteration {iteration}: {gained} task(s) completed");
                    }
                    action => {
                        if let Some(stop) = self.on_no_progress(iteration, action) {
                            return stop;
                        }
                    }
                }
            }

            self.publish(
                &format!("ralph: iteration {iteration}"),
                &done_after.map_or_else(
                    || format!("Iteration {iteration}/{max}."),
                    |done| format!("Iteration {iteration}/{max}: {done} task(s) recorded as done."),
                ),
            )
            .await;

            if result
                .as_ref()
                .is_some_and(|r| contains_completion_token(&r.output))
            {
                tracing::info!("iteration {iteration}: agent reported completion");
                if let Some(stop) = self.replan(iteration).await {
                    return stop;
                }
            }
        }
        Stop::clean(ExitReason::MaxIterations)
    }

    /// Runs the replanning sub-cycle. Returns `Some` if the run should end.
    async fn replan(&mut self, iteration: u32) -> Option<Stop> {
        self.state.phase = ControllerPhase::Replanning { iteration };
        tracing::info!("{}", self.state.phase.description());

        let prompt = replan_prompt(self.config.replan_prompt.as_deref());
        match self.invoker.invoke(&prompt, &mut self.state.counters).await {
            Ok(result) if result.is_success() => {}
            Ok(result) => {
                self.state.planning_failures += 1;
                tracing::error!(
                    "planning failed ({:?} after {} attempt(s)); completion log left intact",
                    result.kind,
                    result.attempts
                );
                return None;
            }
            Err(e @ RalphError::QuotaWaitLimit { .. }) => {
                return Some(Stop::fatal(ExitReason::Error, e));
            }
            Err(e) => {
                self.state.planning_failures += 1;
                tracing::error!("planning failed: {e}; completion log left intact");
                return None;
            }
        }

        let log = self.paths.completion_log();
        match archive_completion_log(&log, &self.paths.archive_dir()).await {
            Ok(dest) => {
                tracing::info!("archived completion log to {}", dest.display());
                if let Err(e) = reset_completion_log(&log).await {
                    tracing::warn!("{e:#}");
                }
            }
            Err(e) => tracing::warn!("{e:#}; completion log left intact"),
        }
        self.state.cycles += 1;

        self.publish(
            &format!("ralph: replan after cycle {}", self.state.cycles),
            "Regenerated TASKS.md and archived the completion log.",
        )
        .await;

        match Ledger::load(self.paths).await {
            Ok(ledger) => match ledger.next_pending_task() {
                None => {
                    tracing::info!("replanning produced no pending tasks");
                    Some(Stop::clean(ExitReason::Complete))
                }
                Some(next) => {
                    tracing::info!(
                        "replanning produced {} pending task(s); next: {}",
                        ledger.counts().remaining,
                        next.text
                    );
                    None
                }
            },
            Err(e) => {
                tracing::warn!("cannot check the new plan yet, {e:#}");
                None
            }
        }
    }

    /// Counts an iteration that was skipped before invoking the agent.
    fn record_stall(&mut self, iteration: u32) -> Option<Stop> {
        let action = self.stall.record_stall();
        self.on_no_progress(iteration, action)
    }

    fn on_no_progress(&self, iteration: u32, action: StallAction) -> Option<Stop> {
        match action {
            StallAction::Reset => None,
            StallAction::Continue => {
                tracing::warn!(
                    "iteration {iteration}: no new [DONE] entries ({} consecutive)",
                    self.stall.consecutive()
                );
                None
            }
            StallAction::Abort => {
                tracing::error!(
                    "no progress in {} consecutive iterations; giving up",
                    self.stall.consecutive()
                );
                Some(Stop::fatal(
                    ExitReason::Stall,
                    RalphError::Stalled {
                        stalls: self.stall.consecutive(),
                    },
                ))
            }
        }
    }

    async fn iteration_prompt(&self, ledger: &Ledger) -> anyhow::Result<String> {
        let path = self.paths.prompt_file();
        let prompt = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read prompt: {}", path.display()))?;
        Ok(wrap_for_iteration(&prompt, ledger, self.paths.root()))
    }

    async fn publish(&self, title: &str, body: &str) {
        match self.publisher.publish(title, body).await {
            Ok(outcome) => tracing::debug!(?outcome, "publish handoff"),
            Err(e) => tracing::warn!("publish failed: {e:#}"),
        }
    }

    async fn terminate(mut self, stop: Stop) -> RunOutcome {
        let Stop { reason, error } = stop;
        let iteration = self.state.iteration;
        let max = self.state.max_iterations;
        self.state.phase = ControllerPhase::Terminated { reason };

        if reason == ExitReason::Signal {
            tracing::warn!("shutdown requested; stopping at iteration {iteration}/{max}");
            cleanup_transient(&self.paths.log_dir());
        }

        let summary = self.state.summary(reason);
        println!("{summary}");
        tracing::info!(
            reason = %reason,
            iterations = summary.iterations,
            tasks_completed = summary.tasks_completed,
            "run finished"
        );

        self.hooks
            .fire(HookEvent::Exit {
                reason,
                iteration,
                max,
            })
            .await;

        RunOutcome { summary, error }
    }
}

fn log_failure(iteration: u32, result: &InvocationResult) {
    tracing::warn!(
        "iteration {iteration}: agent failed ({:?}, exit code {:?}) after {} attempt(s); continuing",
        result.kind,
        result.exit_code,
        result.attempts
    );
    let tail = result.output_tail(FAILURE_TAIL_LINES);
    if !tail.is_empty() {
        tracing::debug!("last output:\n{tail}");
    }
}

/// Runs a single iteration prompt with retries and no loop around it.
///
/// # Errors
///
/// Returns [`RalphError::InvocationTimeout`] or [`RalphError::InvocationFailed`]
/// if every attempt failed, or [`RalphError::QuotaWaitLimit`] past the cap.
pub async fn run_once(
    config: &Config,
    paths: &RalphPaths,
    executor: &dyn AgentExecutor,
    shutdown: ShutdownSignal,
    run_log: Option<RunLog>,
) -> Result<InvocationResult, RalphError> {
    let ledger = Ledger::load(paths).await?;
    let prompt_path = paths.prompt_file();
    let prompt = tokio::fs::read_to_string(&prompt_path)
        .await
        .with_context(|| format!("Failed to read prompt: {}", prompt_path.display()))?;
    let prompt = wrap_for_iteration(&prompt, &ledger, paths.root());

    let invoker = Invoker::new(
        executor,
        RetryConfig::from_config(config),
        &paths.log_dir(),
        shutdown,
    )
    .with_run_log(run_log)
    .with_echo(true);
    let mut counters = RetryCounters::default();
    let result = invoker.invoke(&prompt, &mut counters).await?;

    match result.kind {
        InvocationKind::Success => Ok(result),
        InvocationKind::Timeout => Err(RalphError::InvocationTimeout {
            attempts: result.attempts,
        }),
        InvocationKind::Transient | InvocationKind::QuotaExhausted => {
            Err(RalphError::InvocationFailed {
                attempts: result.attempts,
            })
        }
    }
}
