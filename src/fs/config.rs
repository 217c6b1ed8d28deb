//! Environment-style configuration.
//!
//! Every knob is a `RALPH_*` variable. Integer values are validated up front so
//! a typo fails the run immediately instead of hours into it.

use std::time::Duration;

use crate::core::hooks::HookCommand;
use crate::error::RalphError;

/// Default agent binary.
pub const DEFAULT_AGENT_CMD: &str = "claude";
/// Default model selector passed to the agent.
pub const DEFAULT_MODEL: &str = "opus";
/// Default per-invocation timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;
/// Default number of attempts per invocation.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default base backoff delay in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
/// Default consecutive no-progress iterations before aborting.
pub const DEFAULT_MAX_STALLS: u32 = 3;
/// Default number of run logs retained.
pub const DEFAULT_LOG_KEEP: usize = 20;
/// Default sleep after a quota-exhaustion response, in seconds.
pub const DEFAULT_QUOTA_WAIT_SECS: u64 = 3600;
/// Default iteration budget when none is given on the command line.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
/// Default branch pull requests target.
pub const DEFAULT_BASE_BRANCH: &str = "main";

const POSITIVE: &str = "expected a positive integer";
const NON_NEGATIVE: &str = "expected a non-negative integer (0 disables)";

/// Validated controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Agent binary name.
    pub agent_cmd: String,
    /// Model selector passed through to the agent.
    pub model: String,
    /// Hard timeout per agent call; `None` disables it.
    pub timeout: Option<Duration>,
    /// Attempts per invocation, including the first.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub retry_delay: Duration,
    /// Capability list passed unmodified to the agent.
    pub allowed_tools: Option<String>,
    /// Branch pull requests target.
    pub base_branch: String,
    pub on_iteration_start: Option<HookCommand>,
    pub on_exit: Option<HookCommand>,
    /// Consecutive no-progress iterations before aborting; 0 disables.
    pub max_stalls: u32,
    /// Run logs to retain; 0 keeps all.
    pub log_keep: usize,
    pub no_commit: bool,
    pub no_push: bool,
    pub no_pr: bool,
    /// Quota waits allowed per run; 0 waits forever.
    pub quota_max_waits: u32,
    /// Sleep after a quota-exhaustion response.
    pub quota_wait: Duration,
    /// Iteration budget used when the CLI gives none.
    pub max_iterations: u32,
    /// Replaces the built-in replanning prompt.
    pub replan_prompt: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_cmd: DEFAULT_AGENT_CMD.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            allowed_tools: None,
            base_branch: DEFAULT_BASE_BRANCH.to_string(),
            on_iteration_start: None,
            on_exit: None,
            max_stalls: DEFAULT_MAX_STALLS,
            log_keep: DEFAULT_LOG_KEEP,
            no_commit: false,
            no_push: false,
            no_pr: false,
            quota_max_waits: 0,
            quota_wait: Duration::from_secs(DEFAULT_QUOTA_WAIT_SECS),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            replan_prompt: None,
        }
    }
}

impl Config {
    /// Reads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`RalphError::Config`] naming the first invalid variable.
    pub fn from_env() -> Result<Self, RalphError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through `lookup`, which maps a variable name to its value.
    ///
    /// Empty values count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`RalphError::Config`] naming the first invalid variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RalphError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let agent_cmd = get("RALPH_AGENT_CMD").unwrap_or(defaults.agent_cmd);
        if !crate::core::cli_check::is_safe_command_name(&agent_cmd) {
            return Err(RalphError::Config {
                var: "RALPH_AGENT_CMD",
                value: agent_cmd,
                reason: "expected a bare command name ([A-Za-z0-9_-], at most 64 chars)",
            });
        }

        let timeout_secs = non_negative(&get, "RALPH_TIMEOUT", DEFAULT_TIMEOUT_SECS)?;
        let retry_delay_secs = positive(&get, "RALPH_RETRY_DELAY", DEFAULT_RETRY_DELAY_SECS)?;
        let quota_wait_secs = positive(&get, "RALPH_QUOTA_WAIT", DEFAULT_QUOTA_WAIT_SECS)?;

        Ok(Self {
            agent_cmd,
            model: get("RALPH_MODEL").unwrap_or(defaults.model),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            max_retries: positive(&get, "RALPH_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            retry_delay: Duration::from_secs(retry_delay_secs),
            allowed_tools: get("RALPH_ALLOWED_TOOLS"),
            base_branch: get("RALPH_BASE_BRANCH").unwrap_or(defaults.base_branch),
            on_iteration_start: get("RALPH_ON_ITERATION_START").map(HookCommand::shell),
            on_exit: get("RALPH_ON_EXIT").map(HookCommand::shell),
            max_stalls: non_negative(&get, "RALPH_MAX_STALLS", DEFAULT_MAX_STALLS)?,
            log_keep: non_negative(&get, "RALPH_LOG_KEEP", DEFAULT_LOG_KEEP)?,
            no_commit: flag(&get, "RALPH_NO_COMMIT")?,
            no_push: flag(&get, "RALPH_NO_PUSH")?,
            no_pr: flag(&get, "RALPH_NO_PR")?,
            quota_max_waits: non_negative(&get, "RALPH_QUOTA_MAX_WAITS", 0)?,
            quota_wait: Duration::from_secs(quota_wait_secs),
            max_iterations: positive(&get, "RALPH_MAX_ITERATIONS", DEFAULT_MAX_ITERATIONS)?,
            replan_prompt: get("RALPH_REPLAN_PROMPT"),
        })
    }

    /// External tools a full run needs on PATH.
    #[must_use]
    pub fn required_tools(&self) -> Vec<&str> {
        let mut tools = vec![self.agent_cmd.as_str()];
        if !self.no_commit {
            tools.push("git");
            if !self.no_push && !self.no_pr {
                tools.push("gh");
            }
        }
        tools
    }
}

/// Parses a boolean flag value.
///
/// Accepts `1/0`, `true/false`, `yes/no`, and `on/off`, case-insensitively.
#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn flag<G>(get: &G, var: &'static str) -> Result<bool, RalphError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(false),
        Some(value) => parse_bool(&value).ok_or(RalphError::Config {
            var,
            value,
            reason: "expected a boolean (1/0, true/false, yes/no)",
        }),
    }
}

fn positive<G, T>(get: &G, var: &'static str, default: T) -> Result<T, RalphError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialOrd + Default,
{
    let value = integer(get, var, default, POSITIVE)?;
    if value > T::default() {
        Ok(value)
    } else {
        Err(RalphError::Config {
            var,
            value: get(var).unwrap_or_default(),
            reason: POSITIVE,
        })
    }
}

fn non_negative<G, T>(get: &G, var: &'static str, default: T) -> Result<T, RalphError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    integer(get, var, default, NON_NEGATIVE)
}

fn integer<G, T>(
    get: &G,
    var: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, RalphError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| RalphError::Config { var, value, reason }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, RalphError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    fn invalid_var(result: Result<Config, RalphError>) -> &'static str {
        match result {
            Err(RalphError::Config { var, .. }) => var,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(config_from(&[]).unwrap(), Config::default());
    }

    #[test]
    fn reads_all_values() {
        let config = config_from(&[
            ("RALPH_AGENT_CMD", "my-agent"),
            ("RALPH_MODEL", "sonnet"),
            ("RALPH_TIMEOUT", "60"),
            ("RALPH_MAX_RETRIES", "5"),
            ("RALPH_RETRY_DELAY", "2"),
            ("RALPH_ALLOWED_TOOLS", "Edit,Bash(git:*)"),
            ("RALPH_BASE_BRANCH", "develop"),
            ("RALPH_ON_ITERATION_START", "echo start"),
            ("RALPH_ON_EXIT", "echo $RALPH_EXIT_REASON"),
            ("RALPH_MAX_STALLS", "2"),
            ("RALPH_LOG_KEEP", "7"),
            ("RALPH_NO_PUSH", "yes"),
            ("RALPH_QUOTA_MAX_WAITS", "4"),
            ("RALPH_QUOTA_WAIT", "30"),
            ("RALPH_MAX_ITERATIONS", "25"),
            ("RALPH_REPLAN_PROMPT", "regenerate"),
        ])
        .unwrap();

        assert_eq!(config.agent_cmd, "my-agent");
        assert_eq!(config.model, "sonnet");
        assert_eq!(config.timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay, Duration::from_secs(2));
        assert_eq!(config.allowed_tools.as_deref(), Some("Edit,Bash(git:*)"));
        assert_eq!(config.base_branch, "develop");
        assert_eq!(config.on_iteration_start, Some(HookCommand::shell("echo start")));
        assert_eq!(config.max_stalls, 2);
        assert_eq!(config.log_keep, 7);
        assert!(config.no_push);
        assert!(!config.no_pr);
        assert_eq!(config.quota_max_waits, 4);
        assert_eq!(config.quota_wait, Duration::from_secs(30));
        assert_eq!(config.max_iterations, 25);
        assert_eq!(config.replan_prompt.as_deref(), Some("regenerate"));
    }

    #[test]
    fn zero_means_disabled_where_allowed() {
        let config = config_from(&[
            ("RALPH_TIMEOUT", "0"),
            ("RALPH_MAX_STALLS", "0"),
            ("RALPH_LOG_KEEP", "0"),
            ("RALPH_QUOTA_MAX_WAITS", "0"),
        ])
        .unwrap();

        assert_eq!(config.timeout, None);
        assert_eq!(config.max_stalls, 0);
        assert_eq!(config.log_keep, 0);
        assert_eq!(config.quota_max_waits, 0);
    }

    #[test]
    fn zero_is_rejected_for_positive_values() {
        assert_eq!(invalid_var(config_from(&[("RALPH_MAX_RETRIES", "0")])), "RALPH_MAX_RETRIES");
        assert_eq!(invalid_var(config_from(&[("RALPH_RETRY_DELAY", "0")])), "RALPH_RETRY_DELAY");
        assert_eq!(
            invalid_var(config_from(&[("RALPH_MAX_ITERATIONS", "0")])),
            "RALPH_MAX_ITERATIONS"
        );
    }

    #[test]
    fn non_numeric_and_negative_values_are_rejected() {
        assert_eq!(invalid_var(config_from(&[("RALPH_MAX_STALLS", "two")])), "RALPH_MAX_STALLS");
        assert_eq!(invalid_var(config_from(&[("RALPH_LOG_KEEP", "-1")])), "RALPH_LOG_KEEP");
        assert_eq!(invalid_var(config_from(&[("RALPH_TIMEOUT", "1.5")])), "RALPH_TIMEOUT");
    }

    #[test]
    fn error_message_is_actionable() {
        let err = config_from(&[("RALPH_MAX_RETRIES", "abc")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid RALPH_MAX_RETRIES=\"abc\": expected a positive integer"
        );
    }

    #[test]
    fn unsafe_agent_command_is_rejected() {
        assert_eq!(
            invalid_var(config_from(&[("RALPH_AGENT_CMD", "claude; rm -rf /")])),
            "RALPH_AGENT_CMD"
        );
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = config_from(&[("RALPH_MAX_RETRIES", "  "), ("RALPH_ON_EXIT", "")]).unwrap();
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.on_exit, None);
    }

    #[test]
    fn bad_boolean_is_rejected() {
        assert_eq!(invalid_var(config_from(&[("RALPH_NO_PR", "maybe")])), "RALPH_NO_PR");
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for v in ["1", "true", "TRUE", "yes", "On"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["0", "false", "No", "off"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn required_tools_follow_publish_opt_outs() {
        let mut config = Config::default();
        assert_eq!(config.required_tools(), ["claude", "git", "gh"]);

        config.no_pr = true;
        assert_eq!(config.required_tools(), ["claude", "git"]);

        config.no_commit = true;
        assert_eq!(config.required_tools(), ["claude"]);
    }

    /// Reads the real process environment; serialized with other env users.
    #[test]
    #[serial_test::serial]
    fn from_env_reads_process_variables() {
        // SAFETY: serialized; no other test thread touches these variables.
        unsafe {
            std::env::set_var("RALPH_MAX_ITERATIONS", "7");
            std::env::set_var("RALPH_NO_PUSH", "yes");
        }
        let config = Config::from_env();
        unsafe {
            std::env::remove_var("RALPH_MAX_ITERATIONS");
            std::env::remove_var("RALPH_NO_PUSH");
        }

        let config = config.unwrap();
        assert_eq!(config.max_iterations, 7);
        assert!(config.no_push);
    }
}
