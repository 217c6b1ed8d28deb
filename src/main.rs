//! `ralph` - supervised iteration loop for autonomous coding agents
//!
//! Entry point for the application.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use ralph::cli::{Args, Command};
use ralph::core::publish::{self, run_branch_name};
use ralph::core::{ClaudeExecutor, Controller, install_signal_handlers, prepare, run_once};
use ralph::error::{EXIT_OK, RalphError};
use ralph::fs::{Config, Ledger, RalphPaths};
use ralph::logging::{self, RunLogSlot};
use ralph::report::{DryRunReport, StatusReport};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let log_slot = logging::init(args.verbose);

    let code = match dispatch(&args, &log_slot).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn dispatch(args: &Args, log_slot: &RunLogSlot) -> Result<i32, RalphError> {
    let paths = resolve_paths(args)?;

    // The read-only modes never look at RALPH_* settings.
    match args.command() {
        Command::Run { iterations } => {
            run(&Config::from_env()?, &paths, iterations, log_slot).await
        }
        Command::Status { json } => status(&paths, json).await,
        Command::DryRun => dry_run(&paths).await,
        Command::Once => once(&Config::from_env()?, &paths, log_slot).await,
    }
}

fn resolve_paths(args: &Args) -> Result<RalphPaths, RalphError> {
    match &args.dir {
        Some(dir) => {
            let root = std::fs::canonicalize(dir)
                .with_context(|| format!("Failed to open project directory: {}", dir.display()))?;
            Ok(RalphPaths::new(&root))
        }
        None => Ok(RalphPaths::from_cwd()?),
    }
}

async fn run(
    config: &Config,
    paths: &RalphPaths,
    iterations: Option<u32>,
    log_slot: &RunLogSlot,
) -> Result<i32, RalphError> {
    let shutdown = install_signal_handlers()?;
    let session = prepare(config, paths).await?;
    log_slot.attach(session.run_log.file());
    tracing::info!("run log: {}", session.run_log.path().display());

    let executor = ClaudeExecutor::from_config(config, paths.root());
    let run_branch = run_branch_name(&chrono::Local::now());
    let publisher = publish::from_config(config, paths.root(), &run_branch);

    let outcome = Controller::new(config, paths, &executor, publisher.as_ref(), shutdown)
        .with_run_log(Some(session.run_log.clone()))
        .with_echo(true)
        .run(iterations.unwrap_or(config.max_iterations))
        .await;

    if let Some(e) = &outcome.error {
        eprintln!("error: {e}");
    }
    Ok(outcome.exit_code())
}

/// Reads the ledger without taking the lock.
async fn load_ledger(paths: &RalphPaths) -> Result<Ledger, RalphError> {
    let task_list = paths.task_list();
    if !task_list.is_file() {
        return Err(RalphError::Preflight(format!(
            "required file {} is missing",
            task_list.display()
        )));
    }
    Ok(Ledger::load(paths).await?)
}

async fn status(paths: &RalphPaths, json: bool) -> Result<i32, RalphError> {
    let report = StatusReport::from_ledger(paths, &load_ledger(paths).await?);
    if json {
        println!("{}", report.to_json().context("Failed to encode status")?);
    } else {
        println!("{report}");
    }
    Ok(EXIT_OK)
}

async fn dry_run(paths: &RalphPaths) -> Result<i32, RalphError> {
    let ledger = load_ledger(paths).await?;
    println!("{}", DryRunReport::new(&ledger));
    Ok(EXIT_OK)
}

async fn once(config: &Config, paths: &RalphPaths, log_slot: &RunLogSlot) -> Result<i32, RalphError> {
    let shutdown = install_signal_handlers()?;
    let session = prepare(config, paths).await?;
    log_slot.attach(session.run_log.file());

    let executor = ClaudeExecutor::from_config(config, paths.root());
    let result = run_once(config, paths, &executor, shutdown, Some(session.run_log.clone())).await?;

    tracing::info!(
        "invocation succeeded after {} attempt(s), exit code {:?}",
        result.attempts,
        result.exit_code
    );
    Ok(EXIT_OK)
}
