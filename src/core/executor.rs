//! Agent process execution.
//!
//! [`AgentExecutor`] is the seam between the controller and the external
//! coding agent. One call spawns one non-interactive agent process, streams its
//! output lines over a channel and returns its exit status. Retries, timeouts
//! and output capture live one layer up in [`crate::core::retry`].
//!
//! An in-flight agent is never interrupted by a first shutdown request; only a
//! forced shutdown
//! ([`ShutdownState::Forced`](crate::core::shutdown::ShutdownState::Forced)) kills it.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::cli_check::resolve_cli_command;
use crate::core::shutdown::ShutdownSignal;
use crate::fs::Config;

/// Output line from an agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliOutput {
    Stdout(String),
    Stderr(String),
}

impl CliOutput {
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Stdout(s) | Self::Stderr(s) => s,
        }
    }
}

/// Parses a line from Claude's stream-json output and extracts displayable content.
///
/// Claude's `--output-format stream-json` emits newline-delimited JSON (JSONL).
/// Each line has a top-level `type` field indicating the message type:
/// - `assistant`: Contains assistant text in `message.content[].text`
/// - `user`: Tool results echoed back (filtered out)
/// - `system`: Session initialization
/// - `result`: Final completion; `result` carries the final text or error
///
/// Returns `Some(text)` if displayable content was found, `None` otherwise.
fn parse_claude_stream_json(line: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(line).ok()?;

    match json.get("type")?.as_str()? {
        "assistant" => {
            let content = json.get("message")?.get("content")?.as_array()?;
            let texts: Vec<&str> = content
                .iter()
                .filter_map(|item| {
                    if item.get("type")?.as_str()? == "text" {
                        item.get("text")?.as_str()
                    } else {
                        None
                    }
                })
                .collect();

            if texts.is_empty() {
                None
            } else {
                Some(texts.join(""))
            }
        }
        // Quota and rate-limit failures arrive here with `is_error: true`,
        // so the text must survive for classification.
        "result" => {
            let is_error = json
                .get("is_error")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
                || json.get("subtype").and_then(serde_json::Value::as_str) == Some("error");
            let text = json.get("result").and_then(serde_json::Value::as_str);
            match (is_error, text) {
                (true, Some(text)) => Some(format!("[agent error] {text}")),
                (true, None) => Some("[agent error]".to_string()),
                (false, text) => text.map(str::to_string),
            }
        }
        "system" => {
            let subtype = json.get("subtype").and_then(serde_json::Value::as_str);
            (subtype == Some("init")).then(|| "[agent session started]".to_string())
        }
        _ => None,
    }
}

/// One non-interactive invocation of a coding agent.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Runs the agent on `prompt`, streaming output to `output_tx`.
    ///
    /// Returns once the process exits. If `shutdown` becomes
    /// `ShutdownState::Forced` the process is killed and an error returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or waited on, or
    /// was killed by a forced shutdown.
    async fn execute(
        &self,
        prompt: &str,
        output_tx: mpsc::Sender<CliOutput>,
        shutdown: ShutdownSignal,
    ) -> Result<ExitStatus>;

    /// Display name for logs.
    fn name(&self) -> &str;
}

/// Claude Code in print mode.
///
/// Executes: `<cmd> -p <prompt> --model <model> [--allowedTools <list>]
/// --dangerously-skip-permissions --output-format stream-json --verbose`
///
/// The `--verbose` flag is required when using `stream-json` with `--print`.
#[derive(Debug, Clone)]
pub struct ClaudeExecutor {
    command: String,
    model: String,
    allowed_tools: Option<String>,
    workdir: PathBuf,
}

impl ClaudeExecutor {
    #[must_use]
    pub fn new(command: impl Into<String>, model: impl Into<String>, workdir: &Path) -> Self {
        Self {
            command: command.into(),
            model: model.into(),
            allowed_tools: None,
            workdir: workdir.to_path_buf(),
        }
    }

    #[must_use]
    pub fn with_allowed_tools(mut self, tools: Option<String>) -> Self {
        self.allowed_tools = tools;
        self
    }

    #[must_use]
    pub fn from_config(config: &Config, workdir: &Path) -> Self {
        Self::new(&config.agent_cmd, &config.model, workdir)
            .with_allowed_tools(config.allowed_tools.clone())
    }

    fn args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--model".to_string(),
            self.model.clone(),
        ];
        if let Some(tools) = &self.allowed_tools {
            args.push("--allowedTools".to_string());
            args.push(tools.clone());
        }
        args.extend(
            [
                "--dangerously-skip-permissions",
                "--output-format",
                "stream-json",
                "--verbose",
            ]
            .map(str::to_string),
        );
        args
    }
}

#[async_trait]
impl AgentExecutor for ClaudeExecutor {
    async fn execute(
        &self,
        prompt: &str,
        output_tx: mpsc::Sender<CliOutput>,
        shutdown: ShutdownSignal,
    ) -> Result<ExitStatus> {
        let spawned = spawn_agent_process(&self.command, &self.args(prompt), &self.workdir)?;
        run_process_with_output(&self.command, spawned, output_tx, shutdown, |line| {
            // Unparseable non-empty lines are forwarded as-is.
            parse_claude_stream_json(&line).or_else(|| (!line.trim().is_empty()).then_some(line))
        })
        .await
    }

    fn name(&self) -> &str {
        "Claude Code"
    }
}

/// A spawned agent process with captured stdout and stderr.
struct SpawnedProcess {
    child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

/// Spawns an agent process in `workdir` with stdout and stderr captured.
///
/// The child is killed when its handle is dropped, which is how an expired
/// invocation timeout terminates it. On Linux it is also killed if this
/// process dies, via `PR_SET_PDEATHSIG`.
fn spawn_agent_process(command: &str, args: &[String], workdir: &Path) -> Result<SpawnedProcess> {
    let program = resolve_cli_command(command).with_context(|| {
        format!("Agent command '{command}' not found. Ensure it is installed and available in PATH.")
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(target_os = "linux")]
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {command}"))?;

    let stdout = child.stdout.take().context("Failed to capture stdout")?;
    let stderr = child.stderr.take().context("Failed to capture stderr")?;

    Ok(SpawnedProcess {
        child,
        stdout,
        stderr,
    })
}

/// Output reader tasks, aborted when dropped.
///
/// A grandchild that inherited the pipes can keep them open after the agent
/// itself is gone; dropping the guard stops reading from them.
struct ReaderTasks(Vec<JoinHandle<()>>);

impl ReaderTasks {
    /// Waits for every reader to reach end of output.
    async fn join(&mut self) {
        for handle in &mut self.0 {
            let _ = handle.await;
        }
    }
}

impl Drop for ReaderTasks {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

fn forward_lines<R, F>(
    reader: R,
    tx: mpsc::Sender<CliOutput>,
    wrap: fn(String) -> CliOutput,
    mut filter: F,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(String) -> Option<String> + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(text) = filter(line) {
                let _ = tx.send(wrap(text)).await;
            }
        }
    })
}

/// Streams a spawned process's output until it exits or is force-killed.
///
/// `map_stdout` turns each raw stdout line into the text to forward, or
/// `None` to drop it. Stderr is forwarded verbatim.
async fn run_process_with_output<F>(
    command: &str,
    spawned: SpawnedProcess,
    output_tx: mpsc::Sender<CliOutput>,
    shutdown: ShutdownSignal,
    map_stdout: F,
) -> Result<ExitStatus>
where
    F: FnMut(String) -> Option<String> + Send + 'static,
{
    let SpawnedProcess {
        mut child,
        stdout,
        stderr,
    } = spawned;

    // Dropped on every exit path, including a timeout cancelling this future.
    let mut readers = ReaderTasks(vec![
        forward_lines(stdout, output_tx.clone(), CliOutput::Stdout, map_stdout),
        forward_lines(stderr, output_tx, CliOutput::Stderr, Some),
    ]);

    let status = tokio::select! {
        result = child.wait() => {
            result.with_context(|| format!("Failed to wait for {command}"))?
        }
        () = shutdown.forced() => {
            let _ = child.kill().await;
            anyhow::bail!("Forced shutdown - {command} process killed");
        }
    };

    readers.join().await;
    Ok(status)
}
