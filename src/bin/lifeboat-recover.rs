//! lifeboat-recover: assess database health and restore from backups

use clap::{Args, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use lifeboat::config::RecoveryConfig;
use lifeboat::database::admin::PgAdmin;
use lifeboat::database::assess::{DfProbe, DisasterAssessor};
use lifeboat::database::restore::{RestoreMode, RestoreOrchestrator, RestoreSource, StdinConfirmer};
use lifeboat::database::storage::{RemoteStore, create_remote_store};
use lifeboat::database::tools::PgTools;
use lifeboat::notify::Notifier;
use lifeboat::report::{ReportGenerator, format_rows, local_rows, remote_rows};

/// Assess a PostgreSQL database and recover it from backups
#[derive(Parser, Debug)]
#[command(name = "lifeboat-recover")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    action: Action,

    /// Restore mode (replace asks for confirmation)
    #[arg(long, value_enum, conflicts_with_all = ["parallel", "test"])]
    mode: Option<RestoreMode>,

    /// Shorthand for --mode parallel
    #[arg(long, conflicts_with = "test")]
    parallel: bool,

    /// Shorthand for --mode test
    #[arg(long)]
    test: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct Action {
    /// Check database health and backup inventory
    #[arg(long)]
    assess: bool,

    /// Restore the newest backup (local first, then remote)
    #[arg(long)]
    restore_latest: bool,

    /// Restore a specific backup file
    #[arg(long, value_name = "FILE")]
    restore_file: Option<PathBuf>,

    /// Restore the newest backup in remote storage
    #[arg(long)]
    restore_remote_latest: bool,

    /// Point-in-time recovery target (not supported)
    #[arg(long, value_name = "TIMESTAMP")]
    pitr: Option<String>,

    /// List local and remote backups
    #[arg(long)]
    list: bool,

    /// Download a remote object into the backup directory
    #[arg(long, value_name = "KEY")]
    download: Option<String>,

    /// Write a backup report
    #[arg(long)]
    report: bool,
}

impl Cli {
    fn restore_mode(&self) -> RestoreMode {
        if self.parallel {
            RestoreMode::Parallel
        } else if self.test {
            RestoreMode::Test
        } else {
            self.mode.unwrap_or(RestoreMode::Replace)
        }
    }

    fn restore_source(&self) -> Option<RestoreSource> {
        if self.action.restore_latest {
            Some(RestoreSource::LatestLocal)
        } else if self.action.restore_remote_latest {
            Some(RestoreSource::RemoteLatest)
        } else {
            self.action.restore_file.clone().map(RestoreSource::Explicit)
        }
    }
}

async fn open_remote(config: &RecoveryConfig) -> anyhow::Result<Option<Box<dyn RemoteStore>>> {
    match &config.remote {
        Some(settings) => Ok(Some(create_remote_store(settings).await?)),
        None => Ok(None),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = RecoveryConfig::load(cli.config.as_deref())?;
    if let Some(path) = lifeboat::logging::init(Some(&config.log_path()), cli.verbose) {
        info!(log_file = %path.display(), "logging to file");
    }

    let admin = PgAdmin::new(&config.database);

    if cli.action.assess {
        config.validate()?;
        let report = DisasterAssessor::new(&config, &admin, &DfProbe).assess().await;
        println!("Assessment at {}", report.checked_at.to_rfc3339());
        if report.healthy {
            println!("Healthy: no issues found");
            return Ok(());
        }
        for issue in &report.issues {
            println!("  - {}", issue);
        }
        anyhow::bail!("assessment found {} issue(s)", report.issues.len());
    }

    if cli.action.list {
        println!("Local backups in {}:", config.backup_dir.display());
        print!("{}", format_rows(&local_rows(&config).await?));
        if let Some(remote) = open_remote(&config).await? {
            println!("Remote backups in {}:", remote.describe());
            print!("{}", format_rows(&remote_rows(&config, remote.as_ref()).await?));
        }
        return Ok(());
    }

    config.validate()?;
    let remote = open_remote(&config).await?;

    if cli.action.report {
        let path = ReportGenerator::new(&config, remote.as_deref(), &DfProbe).write().await?;
        println!("Report written to {}", path.display());
        return Ok(());
    }

    let tools = PgTools::new(&config.database);
    let notifier = Notifier::from_config(&config);
    let orchestrator = RestoreOrchestrator::new(
        &config,
        &admin,
        &tools,
        remote.as_deref(),
        &DfProbe,
        &StdinConfirmer,
        &notifier,
    );

    if let Some(key) = &cli.action.download {
        let path = orchestrator.download(key).await?;
        println!("Downloaded {} to {}", key, path.display());
        return Ok(());
    }

    if let Some(timestamp) = &cli.action.pitr {
        orchestrator.restore_point_in_time(timestamp).await?;
        return Ok(());
    }

    let Some(source) = cli.restore_source() else {
        anyhow::bail!("no action selected");
    };
    let outcome = orchestrator.restore(source, cli.restore_mode()).await?;
    println!(
        "Restored {} into {} ({} mode)",
        outcome.artifact.display(),
        outcome.target,
        outcome.mode
    );
    println!(
        "Tables: {}, essential rows: {}",
        outcome.verification.total_tables, outcome.verification.total_rows
    );
    for warning in &outcome.warnings {
        println!("warning: {}", warning);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "lifeboat-recover failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
