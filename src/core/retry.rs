//! Agent invocation with bounded retries, exponential backoff, a per-call
//! timeout and a long-wait path for quota exhaustion.
//!
//! Every attempt streams the agent's combined output into a scratch capture
//! file in the log directory. The file is a [`tempfile::NamedTempFile`], so it
//! is removed on every return path; [`crate::core::shutdown::cleanup_transient`]
//! catches any left behind by a crash.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::core::executor::{AgentExecutor, CliOutput};
use crate::core::shutdown::ShutdownSignal;
use crate::error::RalphError;
use crate::fs::{Config, RunLog};
use crate::fs::logs::CAPTURE_PREFIX;

/// Upper bound on a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// How long to wait for output forwarding after the agent call returns.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Case-insensitive markers of quota or credit exhaustion in agent output.
pub const QUOTA_PATTERNS: [&str; 8] = [
    "credit balance",
    "usage limit",
    "payment required",
    "quota exceed",
    "insufficient credits",
    "insufficient_quota",
    "billing hard limit",
    "out of credits",
];

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts per invocation, counting the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles after each failure.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Hard wall-clock limit per attempt; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Sleep after a quota-exhaustion response.
    pub quota_wait: Duration,
    /// Quota waits allowed per run; 0 means unlimited.
    pub quota_max_waits: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RetryConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: config.retry_delay,
            max_delay: MAX_BACKOFF,
            timeout: config.timeout,
            quota_wait: config.quota_wait,
            quota_max_waits: config.quota_max_waits,
        }
    }

    /// Calculates the sleep after failed attempt `attempt` (1-indexed).
    ///
    /// Uses exponential backoff: `min(base * 2^(attempt-1), max_delay)`.
    ///
    /// # Examples
    ///
    /// ```
    /// use ralph::core::RetryConfig;
    /// use std::time::Duration;
    ///
    /// let config = RetryConfig {
    ///     base_delay: Duration::from_secs(5),
    ///     ..RetryConfig::default()
    /// };
    /// assert_eq!(config.backoff(1), Duration::from_secs(5));
    /// assert_eq!(config.backoff(3), Duration::from_secs(20));
    /// assert_eq!(config.backoff(5), Duration::from_secs(60));
    /// ```
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Returns true if another attempt may follow attempt `attempt` (1-indexed).
    #[must_use]
    pub const fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Returns true if the quota wait cap has been reached.
    #[must_use]
    pub const fn quota_cap_reached(&self, waits: u32) -> bool {
        self.quota_max_waits > 0 && waits >= self.quota_max_waits
    }
}

/// Run-wide counters shared by every invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryCounters {
    /// Agent processes started.
    pub attempts: u32,
    /// Quota waits consumed.
    pub quota_waits: u32,
    pub timeouts: u32,
}

/// Classification of an invocation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    Success,
    Transient,
    Timeout,
    QuotaExhausted,
}

/// Outcome of one invocation, after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    /// `None` when the attempt timed out or the process never ran.
    pub exit_code: Option<i32>,
    /// Combined output of the last attempt.
    pub output: String,
    pub kind: InvocationKind,
    /// Attempts used, not counting quota re-runs.
    pub attempts: u32,
}

impl InvocationResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.kind == InvocationKind::Success
    }

    /// Last `n` lines of output, for failure logs.
    #[must_use]
    pub fn output_tail(&self, n: usize) -> String {
        let lines: Vec<&str> = self.output.lines().collect();
        lines[lines.len().saturating_sub(n)..].join("\n")
    }
}

/// Returns true if `output` reports quota or credit exhaustion.
#[must_use]
pub fn is_quota_exhausted(output: &str) -> bool {
    let lower = output.to_lowercase();
    QUOTA_PATTERNS.iter().any(|p| lower.contains(p))
}

/// How one attempt ended.
enum AttemptEnd {
    Exited(ExitStatus),
    Failed(anyhow::Error),
    TimedOut,
}

struct Attempt {
    end: AttemptEnd,
    output: String,
}

impl Attempt {
    fn classify(&self) -> InvocationKind {
        match &self.end {
            AttemptEnd::Exited(status) if status.success() => InvocationKind::Success,
            AttemptEnd::TimedOut => InvocationKind::Timeout,
            _ if is_quota_exhausted(&self.output) => InvocationKind::QuotaExhausted,
            _ => InvocationKind::Transient,
        }
    }

    fn into_result(self, kind: InvocationKind, attempts: u32) -> InvocationResult {
        let exit_code = match &self.end {
            AttemptEnd::Exited(status) => status.code(),
            AttemptEnd::Failed(_) | AttemptEnd::TimedOut => None,
        };
        InvocationResult {
            exit_code,
            output: self.output,
            kind,
            attempts,
        }
    }
}

/// Runs prompts through an [`AgentExecutor`] with the retry policy.
pub struct Invoker<'a> {
    executor: &'a dyn AgentExecutor,
    config: RetryConfig,
    capture_dir: PathBuf,
    run_log: Option<RunLog>,
    shutdown: ShutdownSignal,
    echo: bool,
}

impl<'a> Invoker<'a> {
    #[must_use]
    pub fn new(
        executor: &'a dyn AgentExecutor,
        config: RetryConfig,
        capture_dir: &Path,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            executor,
            config,
            capture_dir: capture_dir.to_path_buf(),
            run_log: None,
            shutdown,
            echo: false,
        }
    }

    /// Also appends agent output to `run_log`.
    #[must_use]
    pub fn with_run_log(mut self, run_log: Option<RunLog>) -> Self {
        self.run_log = run_log;
        self
    }

    /// Also echoes agent output to the terminal as it arrives.
    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Invokes the agent on `prompt` until success, attempts run out, or
    /// shutdown is requested.
    ///
    /// A failed invocation is returned as `Ok` with a non-success kind; the
    /// caller decides whether that matters.
    ///
    /// # Errors
    ///
    /// Returns [`RalphError::QuotaWaitLimit`] when quota exhaustion persists
    /// past the configured cap, or an I/O error if the capture file cannot
    /// be created.
    pub async fn invoke(
        &self,
        prompt: &str,
        counters: &mut RetryCounters,
    ) -> Result<InvocationResult, RalphError> {
        let mut attempt = 1;
        loop {
            counters.attempts += 1;
            tracing::info!(
                "{} attempt {attempt}/{}",
                self.executor.name(),
                self.config.max_attempts
            );
            let outcome = self.run_attempt(prompt).await?;
            let kind = outcome.classify();

            match kind {
                InvocationKind::Success => return Ok(outcome.into_result(kind, attempt)),
                InvocationKind::Timeout => {
                    counters.timeouts += 1;
                    tracing::warn!(
                        "attempt {attempt} timed out after {}s",
                        self.config.timeout.unwrap_or_default().as_secs()
                    );
                }
                InvocationKind::QuotaExhausted => {
                    if self.config.quota_cap_reached(counters.quota_waits) {
                        tracing::error!(
                            "agent still out of quota after {} wait(s)",
                            counters.quota_waits
                        );
                        return Err(RalphError::QuotaWaitLimit {
                            limit: self.config.quota_max_waits,
                        });
                    }
                    if self.shutdown.is_requested() {
                        return Ok(outcome.into_result(kind, attempt));
                    }
                    counters.quota_waits += 1;
                    tracing::warn!(
                        "agent reported quota exhaustion; waiting {}s before retrying (wait {})",
                        self.config.quota_wait.as_secs(),
                        counters.quota_waits
                    );
                    if !self.sleep_unless_shutdown(self.config.quota_wait).await {
                        return Ok(outcome.into_result(kind, attempt));
                    }
                    continue;
                }
                InvocationKind::Transient => match &outcome.end {
                    AttemptEnd::Exited(status) => {
                        tracing::warn!("attempt {attempt} failed: {status}");
                    }
                    AttemptEnd::Failed(e) => tracing::warn!("attempt {attempt} failed: {e:#}"),
                    AttemptEnd::TimedOut => {}
                },
            }

            if self.shutdown.is_requested() {
                tracing::info!("shutdown requested; not retrying");
                return Ok(outcome.into_result(kind, attempt));
            }
            if !self.config.has_attempts_remaining(attempt) {
                tracing::warn!("giving up after {attempt} attempt(s)");
                return Ok(outcome.into_result(kind, attempt));
            }

            let delay = self.config.backoff(attempt);
            tracing::info!("retrying in {}ms", delay.as_millis());
            if !self.sleep_unless_shutdown(delay).await {
                return Ok(outcome.into_result(kind, attempt));
            }
            attempt += 1;
        }
    }

    /// Sleeps for `duration`; returns false if shutdown cut it short.
    async fn sleep_unless_shutdown(&self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.shutdown.requested() => false,
        }
    }

    async fn run_attempt(&self, prompt: &str) -> Result<Attempt, RalphError> {
        let capture = tempfile::Builder::new()
            .prefix(CAPTURE_PREFIX)
            .tempfile_in(&self.capture_dir)
            .with_context(|| {
                format!(
                    "Failed to create capture file in {}",
                    self.capture_dir.display()
                )
            })?;
        let writer = tokio::fs::File::from_std(
            capture
                .reopen()
                .context("Failed to open capture file for writing")?,
        );

        let (output_tx, output_rx) = mpsc::channel::<CliOutput>(1000);
        let forward = tokio::spawn(forward_output(
            output_rx,
            writer,
            self.run_log.clone(),
            self.echo,
        ));

        let call = self
            .executor
            .execute(prompt, output_tx, self.shutdown.clone());
        let end = match self.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(Ok(status)) => AttemptEnd::Exited(status),
                Ok(Err(e)) => AttemptEnd::Failed(e),
                Err(_) => AttemptEnd::TimedOut,
            },
            None => match call.await {
                Ok(status) => AttemptEnd::Exited(status),
                Err(e) => AttemptEnd::Failed(e),
            },
        };

        // A grandchild holding the pipes open must not stall the loop.
        match tokio::time::timeout(DRAIN_TIMEOUT, forward).await {
            Ok(_) => {}
            Err(_) => tracing::debug!("output forwarding did not drain; continuing"),
        }

        let bytes = tokio::fs::read(capture.path()).await.unwrap_or_default();
        let mut output = String::from_utf8_lossy(&bytes).into_owned();
        if let AttemptEnd::Failed(e) = &end
            && output.trim().is_empty()
        {
            output = format!("{e:#}");
        }

        Ok(Attempt { end, output })
    }
}

async fn forward_output(
    mut rx: mpsc::Receiver<CliOutput>,
    mut capture: tokio::fs::File,
    run_log: Option<RunLog>,
    echo: bool,
) {
    while let Some(line) = rx.recv().await {
        let text = line.text();
        let _ = capture.write_all(text.as_bytes()).await;
        let _ = capture.write_all(b"\n").await;
        if let Some(log) = &run_log {
            let _ = log.append(text);
        }
        if echo {
            match &line {
                CliOutput::Stdout(s) => println!("{s}"),
                CliOutput::Stderr(s) => eprintln!("{s}"),
            }
        }
    }
    let _ = capture.flush().await;
}
