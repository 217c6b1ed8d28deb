//! Core loop logic: invoking the agent, detecting progress and deciding what
//! happens next.

pub mod cli_check;
pub mod executor;
pub mod flow;
pub mod hooks;
pub mod prompts;
pub mod publish;
pub mod retry;
pub mod runner;
pub mod shutdown;
pub mod stall;

pub use cli_check::{check_cli_available, is_safe_command_name, preflight, resolve_cli_command};
pub use executor::{AgentExecutor, ClaudeExecutor, CliOutput};
pub use flow::{ControllerPhase, ExitReason, RunState, RunSummary};
pub use hooks::{HookCommand, HookDispatcher, HookEvent};
pub use prompts::{COMPLETION_TOKEN, contains_completion_token, replan_prompt, wrap_for_iteration};
pub use publish::{GitPublisher, NoopPublisher, PublishOutcome, Publisher};
pub use retry::{InvocationKind, InvocationResult, Invoker, RetryConfig, RetryCounters};
pub use runner::{Controller, RunOutcome, Session, prepare, run_once};
pub use shutdown::{ShutdownController, ShutdownSignal, ShutdownState, install_signal_handlers};
pub use stall::{StallAction, StallDetector};
