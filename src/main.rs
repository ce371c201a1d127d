//! Reconloop - scheduled reconnaissance sweeps over a pool of IP blocks
//!
//! - Cycle-fair block sampling that survives restarts
//! - A run pipeline that drives an external scanner per block and stores
//!   every endpoint it reports
//! - A durable scheduler that launches runs as separate processes

mod config;
mod db;
mod logging;
mod pipeline;
mod sampler;
mod scheduler;
mod web;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::db::{Database, InitiatedBy, RunStatus, SeedOutcome};
use crate::pipeline::Pipeline;
use crate::sampler::BlockSampler;
use crate::scheduler::{ControlSource, Scheduler, SelfExecLauncher};

const EXIT_RUN_FAILED: u8 = 2;
const SHOW_ENDPOINT_LIMIT: i64 = 50;

#[derive(Parser)]
#[command(name = "reconloop", version, about = "Scheduled block sweeps with endpoint ingestion")]
struct Cli {
    /// Configuration file (TOML); missing file means defaults plus environment
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one run in the foreground
    Run {
        #[arg(long, value_enum, default_value_t = InitiatedBy::Manual)]
        initiated_by: InitiatedBy,
        /// Override pipeline.blocks_per_run for this run
        #[arg(long)]
        blocks: Option<u32>,
    },
    /// Run the scheduler loop (and the control API when enabled) until Ctrl-C
    Schedule,
    /// Arm the scheduler with a fixed delay between runs
    Arm {
        #[arg(allow_negative_numbers = true)]
        delay_seconds: i64,
    },
    /// Disarm the scheduler; a run in flight is not interrupted
    Cancel,
    /// Start a run as soon as the scheduler polls
    RunNow,
    /// Print scheduler status as JSON
    Status,
    /// Block pool administration
    Blocks {
        #[command(subcommand)]
        action: BlocksCommand,
    },
    /// Run history
    Runs {
        #[command(subcommand)]
        action: RunsCommand,
    },
}

#[derive(Subcommand)]
enum BlocksCommand {
    /// Seed the pool from a file when the pool is empty
    Seed {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    List,
    Enable { cidr: String },
    Disable { cidr: String },
}

#[derive(Subcommand)]
enum RunsCommand {
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    Show { run_id: String },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    if let Command::Run { blocks: Some(n), .. } = &cli.command {
        config.pipeline.blocks_per_run = *n;
        config.validate()?;
    }

    let fresh_log = matches!(cli.command, Command::Run { .. });
    logging::init_logging(&config.logging, fresh_log)?;

    let db = Database::new(&config.database).await?;
    db.run_migrations().await?;

    match cli.command {
        Command::Run { initiated_by, .. } => run(config, db, initiated_by).await,
        Command::Schedule => {
            schedule(config, db, cli.config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Arm { delay_seconds } => {
            let scheduler = control_scheduler(&config, db, cli.config)?;
            print_json(&scheduler.arm(delay_seconds, ControlSource::Cli).await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Cancel => {
            let scheduler = control_scheduler(&config, db, cli.config)?;
            print_json(&scheduler.cancel(ControlSource::Cli).await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::RunNow => {
            let scheduler = control_scheduler(&config, db, cli.config)?;
            print_json(&scheduler.run_now(ControlSource::Cli).await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            let scheduler = control_scheduler(&config, db, cli.config)?;
            print_json(&scheduler.status().await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Blocks { action } => {
            blocks(&config, &db, action).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Runs { action } => {
            runs(&db, action).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Console output plus the operator log, which only carries `oplog` events.
///
/// Use LOG_FORMAT=gcp for structured GCP Cloud Logging on the console.
async fn run(config: Config, db: Database, initiated_by: InitiatedBy) -> Result<ExitCode> {
    let pipeline = Pipeline::new(db, config.pipeline, config.producer);
    let outcome = pipeline.execute(initiated_by).await?;

    println!(
        "run {} {}: {} blocks, {} unique IPs",
        outcome.run.run_id,
        outcome.run.status.as_str(),
        outcome.run.blocks_scanned,
        outcome.run.ips_found
    );
    if let Some(abort) = &outcome.abort {
        eprintln!("run aborted: {}", abort);
    }

    Ok(match outcome.run.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::from(EXIT_RUN_FAILED),
    })
}

async fn schedule(config: Config, db: Database, config_path: PathBuf) -> Result<()> {
    let launcher = SelfExecLauncher::new(config_path).context("locating own executable")?;
    let scheduler = Scheduler::new(db.clone(), &config.scheduler, Arc::new(launcher));

    if config.server.enabled {
        let state = Arc::new(web::AppState {
            scheduler: scheduler.clone(),
            db,
        });
        let server_config = config.server.clone();
        tokio::spawn(async move {
            if let Err(e) = web::start_server(&server_config, state).await {
                tracing::error!("Control API stopped: {:#}", e);
            }
        });
    }

    info!("Scheduler started (poll every {} ms)", config.scheduler.poll_interval_ms);
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => shutdown.cancel(),
                Err(e) => tracing::error!("Cannot listen for Ctrl-C: {}", e),
            }
        }
    });
    scheduler.run(shutdown).await;
    info!("Scheduler stopped");
    Ok(())
}

/// Scheduler handle for one-shot control commands; it never ticks, so it never launches.
fn control_scheduler(config: &Config, db: Database, config_path: PathBuf) -> Result<Scheduler> {
    let launcher = SelfExecLauncher::new(config_path).context("locating own executable")?;
    Ok(Scheduler::new(db, &config.scheduler, Arc::new(launcher)))
}

async fn blocks(config: &Config, db: &Database, action: BlocksCommand) -> Result<()> {
    match action {
        BlocksCommand::Seed { file } => {
            let path = file.unwrap_or_else(|| PathBuf::from(&config.pipeline.seed_file));
            match db.seed_blocks_if_empty(&path).await? {
                SeedOutcome::AlreadySeeded => println!("pool already seeded, nothing to do"),
                SeedOutcome::MissingFile => bail!("seed file {} not found", path.display()),
                SeedOutcome::Seeded { inserted, rejected } => {
                    println!("seeded {} blocks ({} invalid lines skipped)", inserted, rejected)
                }
            }
        }
        BlocksCommand::List => {
            let sampler = BlockSampler::new(db.clone());
            match sampler.cycle_state(&config.pipeline.namespace).await? {
                Some(state) => println!(
                    "# namespace {}: cycle {}, {} of {} left",
                    config.pipeline.namespace,
                    state.cycle,
                    state.remaining.len(),
                    state.total
                ),
                None => println!("# namespace {}: no cycle yet", config.pipeline.namespace),
            }
            for block in db.list_blocks().await? {
                println!(
                    "{}\t{}\t{}",
                    block.id,
                    block.cidr,
                    if block.enabled { "enabled" } else { "disabled" }
                );
            }
        }
        BlocksCommand::Enable { cidr } => set_enabled(db, &cidr, true).await?,
        BlocksCommand::Disable { cidr } => set_enabled(db, &cidr, false).await?,
    }
    Ok(())
}

async fn set_enabled(db: &Database, cidr: &str, enabled: bool) -> Result<()> {
    if !db.set_block_enabled(cidr, enabled).await? {
        bail!("no block {} in the pool", cidr);
    }
    info!(target: "oplog", block = cidr, enabled, "Block toggled");
    Ok(())
}

async fn runs(db: &Database, action: RunsCommand) -> Result<()> {
    match action {
        RunsCommand::List { limit } => {
            for run in db.list_runs(limit.max(1)).await? {
                println!(
                    "{}\t{}\t{}\t{}\tblocks={}\tips={}",
                    run.run_id,
                    run.started_at,
                    run.initiated_by,
                    run.status.as_str(),
                    run.blocks_scanned,
                    run.ips_found
                );
            }
        }
        RunsCommand::Show { run_id } => {
            let Some(run) = db.get_run(&run_id).await? else {
                bail!("no run {}", run_id);
            };
            let mut blocks = Vec::new();
            for block in db.run_blocks(&run_id).await? {
                let found = db.block_endpoints(&run_id, &block.ip_block).await?.len();
                blocks.push(json!({ "block": block, "endpoints": found }));
            }
            let endpoints = db.run_endpoints(&run_id, SHOW_ENDPOINT_LIMIT).await?;
            print_json(&json!({ "run": run, "blocks": blocks, "endpoints": endpoints }))?;
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
