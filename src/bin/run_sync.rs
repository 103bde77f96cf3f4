//! Headless pipeline runner: same orchestration as the API, without the
//! HTTP surface. Ctrl-C maps to a cooperative cancel.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fedsync::scrape::{HttpSiteSource, SiteSource};
use fedsync::sync::cancel::CancelReason;
use fedsync::sync::orchestrator::{self, Launch, RetryLaunch, StartOptions};
use fedsync::sync::runs::{RunStatus, RunStore};
use fedsync::sync::skipped::SkippedLedger;
use fedsync::util::db::Db;
use fedsync::util::env::{db_url, env_parse, init_env, preflight_check};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "run_sync", about = "Run the federation import pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start (or resume) a full import run and wait for it to finish.
    Run {
        /// Discard any checkpoint and start over from the first phase.
        #[arg(long)]
        force_restart: bool,
    },
    /// Print the live status row.
    Status,
    /// Print the skipped-entity summary.
    Skipped,
    /// Retry specific skipped-entity ledger rows by id.
    Retry {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env();
    fedsync::tracing::init_tracing("info,sqlx=warn")?;
    preflight_check(
        "run_sync",
        &["SITE_BASE_URL"],
        &["DATABASE_URL", "SITE_BASE_URL", "SYNC_MAX_HOURS"],
    )?;

    let cli = Cli::parse();
    let database_url = db_url().context("resolving database url")?;
    let db = Db::connect(&database_url, env_parse("DB_MAX_CONNECTIONS", 10u32)).await?;

    match cli.command {
        Command::Run { force_restart } => {
            let source: Arc<dyn SiteSource> = Arc::new(HttpSiteSource::from_env()?);
            run(db, source, force_restart).await
        }
        Command::Status => status(db).await,
        Command::Skipped => skipped(db).await,
        Command::Retry { ids } => {
            let source: Arc<dyn SiteSource> = Arc::new(HttpSiteSource::from_env()?);
            retry(db, source, ids).await
        }
    }
}

async fn run(db: Db, source: Arc<dyn SiteSource>, force_restart: bool) -> Result<()> {
    let handle = match orchestrator::launch(db, source, StartOptions { force_restart }).await? {
        Launch::Started(handle) => handle,
        Launch::Busy => bail!("another import is already running"),
    };
    println!("run {} started", handle.run_id);
    if let Some(phase) = handle.resuming_from {
        println!("resuming from phase {phase}");
    }

    let cancel = handle.cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling at the next safe point");
            cancel.cancel(CancelReason::UserRequested);
        }
    });

    let status = handle.join.await.context("pipeline task panicked")?;
    ctrl_c.abort();
    println!("run finished: {status}");
    match status {
        RunStatus::Completed => Ok(()),
        other => bail!("run ended with status {other}"),
    }
}

async fn status(db: Db) -> Result<()> {
    let runs = RunStore::new(db);
    match runs.live_status().await? {
        Some(live) => println!("{}", serde_json::to_string_pretty(&live)?),
        None => println!("no run recorded"),
    }
    Ok(())
}

async fn skipped(db: Db) -> Result<()> {
    let ledger = SkippedLedger::new(db);
    let summary = ledger.summary().await?;
    if summary.is_empty() {
        println!("no skipped entities");
        return Ok(());
    }
    for row in summary {
        println!("{:<28} {:<10} {}", row.phase, row.status, row.count);
    }
    Ok(())
}

async fn retry(db: Db, source: Arc<dyn SiteSource>, ids: Vec<i64>) -> Result<()> {
    match orchestrator::retry_skipped(db, source, ids).await? {
        RetryLaunch::Done(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        RetryLaunch::Busy => bail!("an import is running; retry after it finishes"),
    }
}
