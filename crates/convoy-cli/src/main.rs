//! # convoy-cli
//!
//! Binary entry point for Convoy.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Batch runs via `convoy run` (from a batch file or issue numbers)
//! - Resume of interrupted batches via `convoy run --resume`
//! - State discovery via `convoy status`
//! - Administrative circuit breaker resets via `convoy reset`

mod display;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use convoy_core::{
    BatchOrchestrator, BatchState, BatchSummary, CheckpointCoordinator, CommandDispatch,
    ConvoyConfig, Feature, GhIssueTracker, NullDispatch, StateStore,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Convoy: drive feature batches through an external agent runtime.
#[derive(Debug, Parser)]
#[command(name = "convoy", version, about)]
struct Cli {
    /// Path to a convoy.yml config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State directory override (also: CONVOY_STATE_DIR).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a batch of features.
    Run {
        /// Batch file: one feature description per line ('#' comments).
        #[arg(long)]
        batch: Option<PathBuf>,

        /// Issue numbers to implement, comma separated.
        #[arg(long, value_delimiter = ',')]
        issues: Vec<u64>,

        /// Resume a persisted batch by id.
        #[arg(long, value_name = "BATCH_ID")]
        resume: Option<String>,

        /// Agent command override (also: CONVOY_AGENT_CMD).
        #[arg(long)]
        agent_cmd: Option<String>,

        /// Close/label linked issues through the gh CLI.
        #[arg(long)]
        track_issues: bool,

        /// Dispatch nothing; every feature "succeeds" instantly.
        #[arg(long)]
        dry_run: bool,
    },

    /// List persisted batches.
    Status,

    /// Reset the circuit breaker on a persisted retry loop.
    Reset {
        /// The loop's session id.
        session_id: String,
    },
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CONVOY_LOG")
        .unwrap_or_else(|_| EnvFilter::new("convoy_core=info,convoy_cli=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<ConvoyConfig> {
    let mut config =
        ConvoyConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    let store = StateStore::new(&config.state_dir)
        .with_context(|| format!("failed to open state directory {}", config.state_dir.display()))?;

    match cli.command {
        Command::Run {
            batch,
            issues,
            resume,
            agent_cmd,
            track_issues,
            dry_run,
        } => {
            let mut config = config;
            if let Some(cmd) = agent_cmd {
                config.agent_command = Some(cmd);
            }
            let summary = run_batch(
                &config,
                &store,
                batch.as_deref(),
                &issues,
                resume.as_deref(),
                track_issues,
                dry_run,
            )?;
            display::print_summary(&summary);
            Ok(exit_code(summary.exit_code()))
        }
        Command::Status => {
            let ids = store.list_batches()?;
            if ids.is_empty() {
                println!("No batches in {}", config.state_dir.display());
                return Ok(ExitCode::SUCCESS);
            }
            println!("Batches in {}:", config.state_dir.display());
            for id in ids {
                match store.load_batch(&id) {
                    Ok(batch) => display::print_batch_line(&batch),
                    Err(e) => println!("  {id}  (unreadable: {e})"),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Reset { session_id } => {
            let mut state = store
                .load_loop(&session_id)
                .with_context(|| format!("no retry loop state for {session_id}"))?;
            state.reset_breaker();
            store.save_loop(&state)?;
            println!("Circuit breaker reset for {session_id}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_batch(
    config: &ConvoyConfig,
    store: &StateStore,
    batch_file: Option<&std::path::Path>,
    issues: &[u64],
    resume: Option<&str>,
    track_issues: bool,
    dry_run: bool,
) -> Result<BatchSummary> {
    let coordinator = CheckpointCoordinator::new(store);

    let (mut batch, position) = if let Some(batch_id) = resume {
        let batch = store
            .load_batch(batch_id)
            .with_context(|| format!("cannot resume batch {batch_id}"))?;
        let position = coordinator.resume(&batch)?;
        debug!(batch_id, source = ?position.source, "Resuming batch");
        (batch, Some(position))
    } else {
        let batch = build_batch(batch_file, issues)?;
        (batch, None)
    };

    let mut orchestrator = if dry_run {
        BatchOrchestrator::new(config, store, Box::new(NullDispatch))
    } else {
        let command = config
            .agent_command
            .as_deref()
            .context("no agent command configured (set agent_command, --agent-cmd or CONVOY_AGENT_CMD)")?;
        BatchOrchestrator::new(config, store, Box::new(CommandDispatch::new(command)?))
    };
    if track_issues {
        orchestrator = orchestrator.with_tracker(Box::new(GhIssueTracker));
    }

    Ok(orchestrator.run(&mut batch, position)?)
}

/// Builds a fresh batch from a batch file and/or issue numbers.
fn build_batch(batch_file: Option<&std::path::Path>, issues: &[u64]) -> Result<BatchState> {
    let mut features = Vec::new();

    if let Some(path) = batch_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read batch file {}", path.display()))?;
        features.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(Feature::new),
        );
    }

    features.extend(
        issues
            .iter()
            .map(|&n| Feature::new(format!("Implement issue #{n}")).with_issue(n)),
    );

    if features.is_empty() {
        bail!("nothing to run: provide --batch <file>, --issues <n,n,...> or --resume <batch_id>");
    }

    Ok(BatchState::new(features))
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
