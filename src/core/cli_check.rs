//! Pre-flight checks: required external tools and input files.
//!
//! Tools are resolved by scanning `PATH` for an executable regular file. The
//! controller usually runs headless (CI, containers), so there is no fallback
//! to interactive shell aliases.
//!
//! # Security
//!
//! Command names are validated against `^[a-zA-Z0-9_-]{1,64}$` before use.
//! See [`is_safe_command_name`].

use std::path::{Path, PathBuf};

use crate::error::RalphError;
use crate::fs::{Config, RalphPaths};

/// Validates that a command name is a bare, safe program name.
///
/// # Rules
/// - Only alphanumeric characters, hyphens (`-`), and underscores (`_`) allowed
/// - Maximum 64 characters
/// - Must not be empty
///
/// # Examples
/// ```
/// use ralph::core::cli_check::is_safe_command_name;
///
/// assert!(is_safe_command_name("claude"));
/// assert!(is_safe_command_name("my_tool"));
/// assert!(!is_safe_command_name(""));
/// assert!(!is_safe_command_name("cmd; rm -rf"));
/// assert!(!is_safe_command_name("../bin/sh"));
/// ```
#[must_use]
pub fn is_safe_command_name(command: &str) -> bool {
    if command.is_empty() || command.len() > 64 {
        return false;
    }

    command
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Resolves a command to an executable on `PATH`.
///
/// Returns `None` for unsafe names, missing commands, and non-executable files.
#[must_use]
pub fn resolve_cli_command(command: &str) -> Option<PathBuf> {
    if !is_safe_command_name(command) {
        return None;
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .flat_map(|dir| candidates(&dir, command))
        .find(|candidate| is_executable(candidate))
}

#[cfg(windows)]
fn candidates(dir: &Path, command: &str) -> Vec<PathBuf> {
    ["exe", "cmd", "bat", "com"]
        .iter()
        .map(|ext| dir.join(format!("{command}.{ext}")))
        .collect()
}

#[cfg(not(windows))]
fn candidates(dir: &Path, command: &str) -> Vec<PathBuf> {
    vec![dir.join(command)]
}

/// Checks if a path points to an executable file.
#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .is_ok_and(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Returns `true` if `name` resolves to an executable on `PATH`.
#[must_use]
pub fn check_cli_available(name: &str) -> bool {
    resolve_cli_command(name).is_some()
}

/// Verifies every tool and input file a run needs.
///
/// All problems are collected into a single message so the operator can fix
/// them in one pass.
///
/// # Errors
///
/// Returns [`RalphError::Preflight`] listing each missing tool or file.
pub fn preflight(config: &Config, paths: &RalphPaths) -> Result<(), RalphError> {
    let mut problems: Vec<String> = config
        .required_tools()
        .into_iter()
        .filter(|tool| !check_cli_available(tool))
        .map(|tool| format!("required tool `{tool}` not found in PATH"))
        .collect();

    problems.extend(missing_inputs(paths));

    if problems.is_empty() {
        tracing::debug!("preflight checks passed");
        Ok(())
    } else {
        Err(RalphError::Preflight(format!(
            "preflight failed: {}",
            problems.join("; ")
        )))
    }
}

/// Returns a description of each required input file that is missing.
#[must_use]
pub fn missing_inputs(paths: &RalphPaths) -> Vec<String> {
    [paths.prompt_file(), paths.task_list()]
        .into_iter()
        .filter(|path| !path.is_file())
        .map(|path| format!("required file {} is missing", path.display()))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // =========================================================================
    // is_safe_command_name Tests
    // =========================================================================

    mod is_safe_command_name_tests {
        use super::*;

        #[test]
        fn accepts_valid_command_names() {
            assert!(is_safe_command_name("claude"));
            assert!(is_safe_command_name("codex-cli"));
            assert!(is_safe_command_name("my_tool"));
            assert!(is_safe_command_name("tool123"));
            assert!(is_safe_command_name("a"));
        }

        #[test]
        fn rejects_too_long_names() {
            assert!(!is_safe_command_name(&"a".repeat(65)));
            assert!(is_safe_command_name(&"a".repeat(64)));
        }

        #[test]
        fn rejects_shell_metacharacters_and_paths() {
            for name in ["", "a b", "a;b", "$(x)", "`x`", "a|b", "./x", "/bin/sh", "a&&b"] {
                assert!(!is_safe_command_name(name), "{name:?} should be rejected");
            }
        }
    }

    // =========================================================================
    // Resolution Tests
    // =========================================================================

    mod resolution {
        use super::*;

        #[test]
        fn finds_sh() {
            assert!(check_cli_available("sh"));
            assert!(resolve_cli_command("sh").unwrap().is_absolute());
        }

        #[test]
        fn missing_command_is_unavailable() {
            assert!(!check_cli_available("this_command_definitely_does_not_exist_12345"));
        }

        #[test]
        fn unsafe_name_never_resolves() {
            assert_eq!(resolve_cli_command("sh; true"), None);
        }
    }

    // =========================================================================
    // Preflight Tests
    // =========================================================================

    mod preflight_tests {
        use super::*;

        fn config_with_agent(agent: &str) -> Config {
            Config {
                agent_cmd: agent.to_string(),
                no_commit: true,
                ..Config::default()
            }
        }

        #[test]
        fn passes_with_tools_and_inputs_present() {
            let temp = TempDir::new().unwrap();
            let paths = RalphPaths::new(temp.path());
            std::fs::write(paths.prompt_file(), "do it").unwrap();
            std::fs::write(paths.task_list(), "- [ ] a\n").unwrap();

            preflight(&config_with_agent("sh"), &paths).unwrap();
        }

        #[test]
        fn reports_every_missing_item_in_one_message() {
            let temp = TempDir::new().unwrap();
            let paths = RalphPaths::new(temp.path());

            let err = preflight(&config_with_agent("no_such_agent_xyz"), &paths).unwrap_err();
            let msg = err.to_string();

            assert_eq!(err.exit_code(), crate::error::EXIT_PREFLIGHT);
            assert!(msg.contains("`no_such_agent_xyz`"));
            assert!(msg.contains("PROMPT.md"));
            assert!(msg.contains("TASKS.md"));
        }

        #[test]
        fn missing_inputs_lists_only_absent_files() {
            let temp = TempDir::new().unwrap();
            let paths = RalphPaths::new(temp.path());
            std::fs::write(paths.prompt_file(), "x").unwrap();

            let missing = missing_inputs(&paths);
            assert_eq!(missing.len(), 1);
            assert!(missing[0].contains("TASKS.md"));
        }
    }
}
