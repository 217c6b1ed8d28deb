//! Publishing iteration results: commit, push and pull request.
//!
//! The controller hands off after every iteration and every replanning cycle.
//! [`GitPublisher`] shells out to `git` and `gh`; [`NoopPublisher`] is used
//! when `RALPH_NO_COMMIT` is set. Publish failures are logged by the caller and
//! never stop the loop.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use crate::fs::{Config, LOCK_FILE};

/// Pathspec limiting `git status` and `git add` to project files. Controller
/// state (`.ralph/`, the lock file) is never committed.
fn project_pathspec() -> [String; 4] {
    [
        "--".to_string(),
        ".".to_string(),
        ":(exclude).ralph".to_string(),
        format!(":(exclude){LOCK_FILE}"),
    ]
}

/// What a publish handoff did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The working tree had no changes.
    Clean,
    /// Changes were committed on `branch`.
    Committed {
        branch: String,
        pushed: bool,
        pull_request: bool,
    },
    /// Publishing is turned off.
    Disabled,
}

/// Receives file changes after an iteration or replanning cycle.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Commits (and optionally pushes) whatever the agent changed.
    ///
    /// # Errors
    ///
    /// Returns an error if a `git` or `gh` step fails.
    async fn publish(&self, title: &str, body: &str) -> Result<PublishOutcome>;
}

/// Publisher that never touches version control.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    async fn publish(&self, _title: &str, _body: &str) -> Result<PublishOutcome> {
        Ok(PublishOutcome::Disabled)
    }
}

/// Commits to a run branch via `git`, then pushes and opens a PR via `gh`.
#[derive(Debug, Clone)]
pub struct GitPublisher {
    workdir: PathBuf,
    base_branch: String,
    /// Branch used when HEAD is on the base branch or detached.
    run_branch: String,
    push: bool,
    pull_request: bool,
}

impl GitPublisher {
    #[must_use]
    pub fn new(workdir: &Path, base_branch: impl Into<String>, run_branch: impl Into<String>) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            base_branch: base_branch.into(),
            run_branch: run_branch.into(),
            push: true,
            pull_request: true,
        }
    }

    /// Enables or disables `git push` and `gh pr create`.
    #[must_use]
    pub fn with_remote(mut self, push: bool, pull_request: bool) -> Self {
        self.push = push;
        self.pull_request = push && pull_request;
        self
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let out = Command::new(program)
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run {program} {}", args.join(" ")))?;
        if !out.status.success() {
            bail!(
                "{program} {} failed ({}): {}",
                args.join(" "),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        self.run("git", args).await
    }

    async fn git_in_project(&self, args: &[&str]) -> Result<String> {
        let pathspec = project_pathspec();
        let mut full = args.to_vec();
        full.extend(pathspec.iter().map(String::as_str));
        self.git(&full).await
    }

    /// Switches to the run branch unless already on a feature branch.
    async fn ensure_branch(&self) -> Result<String> {
        let current = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let current = current.trim();
        if current != self.base_branch && current != "HEAD" {
            return Ok(current.to_string());
        }
        tracing::info!(branch = %self.run_branch, "switching to run branch");
        self.git(&["checkout", "-B", &self.run_branch]).await?;
        Ok(self.run_branch.clone())
    }

    async fn open_pull_request(&self, branch: &str, title: &str, body: &str) -> Result<()> {
        let args: [&str; 10] = [
            "pr",
            "create",
            "--base",
            self.base_branch.as_str(),
            "--head",
            branch,
            "--title",
            title,
            "--body",
            body,
        ];
        match self.run("gh", &args).await {
            Ok(url) => {
                tracing::info!("opened pull request {}", url.trim());
                Ok(())
            }
            // Later iterations push to the same branch; its PR already exists.
            Err(e) if format!("{e:#}").contains("already exists") => {
                tracing::debug!("pull request for {branch} already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Publisher for GitPublisher {
    async fn publish(&self, title: &str, body: &str) -> Result<PublishOutcome> {
        let status = self.git_in_project(&["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            tracing::debug!("nothing to publish");
            return Ok(PublishOutcome::Clean);
        }

        let branch = self.ensure_branch().await?;
        self.git_in_project(&["add", "-A"]).await?;
        if body.is_empty() {
            self.git(&["commit", "-m", title]).await?;
        } else {
            self.git(&["commit", "-m", title, "-m", body]).await?;
        }
        tracing::info!(%branch, "committed: {title}");

        if self.push {
            self.git(&["push", "-u", "origin", &branch]).await?;
        }
        if self.pull_request {
            self.open_pull_request(&branch, title, body).await?;
        }

        Ok(PublishOutcome::Committed {
            branch,
            pushed: self.push,
            pull_request: self.pull_request,
        })
    }
}

/// Returns the run branch name for a run started at `stamp`.
#[must_use]
pub fn run_branch_name(stamp: &chrono::DateTime<chrono::Local>) -> String {
    format!("ralph/{}", stamp.format("%Y%m%d-%H%M%S"))
}

/// Builds the publisher selected by `config`.
#[must_use]
pub fn from_config(config: &Config, workdir: &Path, run_branch: &str) -> Box<dyn Publisher> {
    if config.no_commit {
        Box::new(NoopPublisher)
    } else {
        Box::new(
            GitPublisher::new(workdir, &config.base_branch, run_branch)
                .with_remote(!config.no_push, !config.no_pr),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::core::cli_check::check_cli_available;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) -> String {
        let out = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {args:?}: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).into_owned()
    }

    fn init_repo() -> Option<TempDir> {
        if !check_cli_available("git") {
            return None;
        }
        let temp = TempDir::new().unwrap();
        let dir = temp.path();
        git(dir, &["init", "-q"]);
        git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(dir, &["config", "user.email", "loop@example.com"]);
        git(dir, &["config", "user.name", "Loop"]);
        git(dir, &["config", "commit.gpgsign", "false"]);
        std::fs::write(dir.join("README.md"), "hi\n").unwrap();
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "-q", "-m", "initial"]);
        Some(temp)
    }

    #[tokio::test]
    async fn noop_publisher_is_disabled() {
        assert_eq!(
            NoopPublisher.publish("t", "b").await.unwrap(),
            PublishOutcome::Disabled
        );
    }

    #[tokio::test]
    async fn clean_tree_is_not_committed() {
        let Some(repo) = init_repo() else { return };
        let publisher = GitPublisher::new(repo.path(), "main", "ralph/test").with_remote(false, false);

        assert_eq!(
            publisher.publish("t", "").await.unwrap(),
            PublishOutcome::Clean
        );
    }

    #[tokio::test]
    async fn controller_state_is_never_published() {
        let Some(repo) = init_repo() else { return };
        let dir = repo.path();
        std::fs::write(dir.join(LOCK_FILE), "123").unwrap();
        std::fs::create_dir_all(dir.join(".ralph/logs")).unwrap();
        std::fs::write(dir.join(".ralph/logs/ralph-20240101-000000.log"), "x").unwrap();
        let publisher = GitPublisher::new(dir, "main", "ralph/t").with_remote(false, false);

        assert_eq!(
            publisher.publish("t", "").await.unwrap(),
            PublishOutcome::Clean
        );
    }

    #[tokio::test]
    async fn commits_on_run_branch_when_on_base() {
        let Some(repo) = init_repo() else { return };
        let dir = repo.path();
        std::fs::write(dir.join("progress.txt"), "[DONE] a\n").unwrap();
        let publisher = GitPublisher::new(dir, "main", "ralph/20240101-000000").with_remote(false, true);

        let outcome = publisher
            .publish("ralph: iteration 1", "1 of 2 tasks done")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PublishOutcome::Committed {
                branch: "ralph/20240101-000000".to_string(),
                pushed: false,
                pull_request: false,
            }
        );
        assert_eq!(
            git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).trim(),
            "ralph/20240101-000000"
        );
        assert!(git(dir, &["log", "-1", "--format=%s"]).contains("ralph: iteration 1"));
        assert!(git(dir, &["status", "--porcelain"]).trim().is_empty());
    }

    #[tokio::test]
    async fn stays_on_existing_feature_branch() {
        let Some(repo) = init_repo() else { return };
        let dir = repo.path();
        git(dir, &["checkout", "-q", "-b", "feature/x"]);
        std::fs::write(dir.join("new.txt"), "x").unwrap();
        let publisher = GitPublisher::new(dir, "main", "ralph/unused").with_remote(false, false);

        let outcome = publisher.publish("t", "").await.unwrap();

        assert!(matches!(outcome, PublishOutcome::Committed { branch, .. } if branch == "feature/x"));
    }

    #[tokio::test]
    async fn push_failure_is_an_error() {
        let Some(repo) = init_repo() else { return };
        let dir = repo.path();
        std::fs::write(dir.join("new.txt"), "x").unwrap();
        let publisher = GitPublisher::new(dir, "main", "ralph/t").with_remote(true, false);

        let err = publisher.publish("t", "").await.unwrap_err();
        assert!(format!("{err:#}").contains("git push"));
    }

    #[test]
    fn run_branch_is_timestamped() {
        let stamp = chrono::Local::now();
        let name = run_branch_name(&stamp);
        assert!(name.starts_with("ralph/"));
        assert_eq!(name.len(), "ralph/YYYYmmdd-HHMMSS".len());
    }

    #[tokio::test]
    async fn no_commit_selects_noop() {
        let temp = TempDir::new().unwrap();
        let config = Config {
            no_commit: true,
            ..Config::default()
        };
        let publisher = from_config(&config, temp.path(), "ralph/x");

        assert_eq!(
            publisher.publish("t", "").await.unwrap(),
            PublishOutcome::Disabled
        );
    }
}
