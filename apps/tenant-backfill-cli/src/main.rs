mod config;
mod logging;

use anyhow::{Context, Result, anyhow};
use backfill_db::DbHandle;
use clap::{Parser, Subcommand};
use config::{AppConfig, CliOverrides};
use std::path::PathBuf;
use std::process::ExitCode;
use tenant_backfill::{
    BackfillEngine, MutationProgress, RollbackCoordinator, RollbackStatus, RunStatistics, Snapshot,
    TableRegistry,
};

/// Tenant attribution backfill for the mentoring schema
#[derive(Parser)]
#[command(name = "tenant-backfill")]
#[command(about = "Populate tenant_code / organization_code across the mentoring schema")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backfill; a failed run is rolled back from its snapshot
    Run {
        /// Organization mapping file (overrides config)
        #[arg(long)]
        mapping_file: Option<PathBuf>,
        /// Where to write the run report (overrides config)
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Read-only readiness report; exits non-zero on blocking findings
    Check {
        /// Organization mapping file (overrides config)
        #[arg(long)]
        mapping_file: Option<PathBuf>,
    },
    /// Restore the database from a snapshot left by an interrupted run
    Rollback {
        /// Snapshot file (defaults to backfill.snapshot_path)
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Print effective configuration (YAML) and exit
    PrintConfig,
}

impl Commands {
    fn overrides(&self, verbose: u8) -> CliOverrides {
        let (mapping_file, report_path) = match self {
            Self::Run {
                mapping_file,
                report,
            } => (mapping_file.clone(), report.clone()),
            Self::Check { mapping_file } => (mapping_file.clone(), None),
            Self::Rollback { .. } | Self::PrintConfig => (None, None),
        };
        CliOverrides {
            mapping_file,
            report_path,
            verbose,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config
        && !path.is_file()
    {
        anyhow::bail!("config file does not exist: {}", path.display());
    }

    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_cli_overrides(&cli.command.overrides(cli.verbose));

    if matches!(cli.command, Commands::PrintConfig) {
        print!("{}", config.to_yaml()?);
        return Ok(ExitCode::SUCCESS);
    }

    let _guard = logging::init_logging(&config.logging)?;

    match cli.command {
        Commands::Run { .. } => run_backfill(&config).await,
        Commands::Check { .. } => check_readiness(&config).await,
        Commands::Rollback { snapshot } => rollback(&config, snapshot).await,
        Commands::PrintConfig => Ok(ExitCode::SUCCESS),
    }
}

async fn connect(config: &AppConfig) -> Result<DbHandle> {
    let db = DbHandle::from_config(&config.database)
        .await
        .context("failed to connect to database")?;
    tracing::info!(engine = ?db.engine(), "Connected to database");
    Ok(db)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn run_backfill(config: &AppConfig) -> Result<ExitCode> {
    let settings = config.backfill.settings()?;
    let registry = TableRegistry::mentoring()?;
    let db = connect(config).await?;

    let engine = BackfillEngine::for_connection(db.sea(), registry, settings)?;
    let report = engine.run().await;
    db.close().await;

    println!(
        "Backfill {}: {} rows updated; report at {}",
        if report.succeeded() { "succeeded" } else { "failed" },
        report.statistics.total_rows_updated(),
        engine.settings().report_path.display()
    );
    if !report.statistics.anomalies.is_empty() {
        println!("Anomalies recorded; see the report for details");
    }
    if let Some(error) = &report.error {
        eprintln!("{}: {}", error.kind, error.message);
    }
    if report.rollback.manual_intervention_required() {
        eprintln!("Rollback incomplete; manual intervention required");
    }
    Ok(exit_code(report.exit_code()))
}

async fn check_readiness(config: &AppConfig) -> Result<ExitCode> {
    let settings = config.backfill.settings()?;
    let registry = TableRegistry::mentoring()?;
    let db = connect(config).await?;

    let report = BackfillEngine::for_connection(db.sea(), registry, settings)?
        .check()
        .await;
    db.close().await;
    let report = report?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn rollback(config: &AppConfig, snapshot: Option<PathBuf>) -> Result<ExitCode> {
    let path = snapshot
        .or_else(|| config.backfill.snapshot_path.clone())
        .ok_or_else(|| anyhow!("no snapshot file given and backfill.snapshot_path is not set"))?;
    let batch_size = config.backfill.checked_batch_size()?;
    let snapshot = Snapshot::read_from(&path).await?;
    let registry = TableRegistry::mentoring()?;
    let db = connect(config).await?;

    let coordinator = RollbackCoordinator::for_connection(db.sea(), batch_size)?;
    let progress = MutationProgress::from_snapshot(&snapshot, &registry);
    let mut stats = RunStatistics::default();
    let report = coordinator.rollback(&snapshot, &progress, &mut stats).await;
    db.close().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.status == RollbackStatus::FullyRestored {
        Snapshot::discard(&path).await?;
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
