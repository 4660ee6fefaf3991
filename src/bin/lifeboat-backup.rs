//! lifeboat-backup: create, verify, list and rotate PostgreSQL backups

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use lifeboat::config::RecoveryConfig;
use lifeboat::database::admin::PgAdmin;
use lifeboat::database::assess::DfProbe;
use lifeboat::database::backup::BackupManager;
use lifeboat::database::restore::{RestoreMode, RestoreOrchestrator, RestoreSource, StdinConfirmer};
use lifeboat::database::storage::{RemoteStore, create_remote_store};
use lifeboat::database::tools::PgTools;
use lifeboat::database::verify::IntegrityVerifier;
use lifeboat::notify::Notifier;
use lifeboat::report::{ReportGenerator, format_rows, local_rows, remote_rows};

/// Create verified, compressed and optionally encrypted PostgreSQL backups
///
/// Without an action flag a backup is taken, uploaded when remote storage is
/// configured, and old backups are rotated.
#[derive(Parser, Debug)]
#[command(name = "lifeboat-backup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding backups (overrides BACKUP_DIR)
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Retention window in days (overrides RETENTION_DAYS)
    #[arg(short, long, value_name = "DAYS")]
    retention_days: Option<u32>,

    /// Only verify the given backup file
    #[arg(long, value_name = "FILE", conflicts_with_all = ["list", "report_only", "restore"])]
    verify_only: Option<PathBuf>,

    /// List local and remote backups
    #[arg(long, conflicts_with_all = ["report_only", "restore"])]
    list: bool,

    /// Only write a backup report
    #[arg(long, conflicts_with = "restore")]
    report_only: bool,

    /// Skip remote storage even when configured
    #[arg(long)]
    no_upload: bool,

    /// Restore the given backup file instead of taking a backup
    #[arg(long, value_name = "FILE")]
    restore: Option<PathBuf>,

    /// Restore mode used with --restore
    #[arg(long, value_enum, default_value_t = RestoreMode::Test)]
    mode: RestoreMode,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(cli: &Cli) -> anyhow::Result<RecoveryConfig> {
    let mut config = RecoveryConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.output_dir {
        config.backup_dir = dir.clone();
    }
    if let Some(days) = cli.retention_days {
        config.retention_days = days;
    }
    if cli.no_upload {
        config.remote = None;
    }
    Ok(config)
}

async fn open_remote(config: &RecoveryConfig) -> anyhow::Result<Option<Box<dyn RemoteStore>>> {
    match &config.remote {
        Some(settings) => Ok(Some(create_remote_store(settings).await?)),
        None => Ok(None),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let log_file = lifeboat::logging::init(Some(&config.log_path()), cli.verbose);
    if let Some(path) = log_file {
        info!(log_file = %path.display(), "logging to file");
    }

    let tools = PgTools::new(&config.database);

    if let Some(file) = &cli.verify_only {
        let outcome = IntegrityVerifier::new(&tools, &config.backup_dir).verify(file).await?;
        match outcome.table_count {
            Some(tables) => println!("OK: {} ({} tables)", file.display(), tables),
            None => println!("OK: {} (encrypted, checksum verified)", file.display()),
        }
        return Ok(());
    }

    if cli.list {
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

    if cli.report_only {
        let path = ReportGenerator::new(&config, remote.as_deref(), &DfProbe).write().await?;
        println!("Report written to {}", path.display());
        return Ok(());
    }

    let notifier = Notifier::from_config(&config);

    if let Some(file) = &cli.restore {
        let admin = PgAdmin::new(&config.database);
        let outcome = RestoreOrchestrator::new(
            &config,
            &admin,
            &tools,
            remote.as_deref(),
            &DfProbe,
            &StdinConfirmer,
            &notifier,
        )
        .restore(RestoreSource::Explicit(file.clone()), cli.mode)
        .await?;
        println!(
            "Restored {} into {} ({} mode)",
            outcome.artifact.display(),
            outcome.target,
            outcome.mode
        );
        for warning in &outcome.warnings {
            println!("warning: {}", warning);
        }
        return Ok(());
    }

    let (result, retention) = BackupManager::new(&config, &tools, remote.as_deref(), &notifier)
        .run()
        .await?;
    println!("Backup created: {}", result.artifact.display());
    println!("SHA-256: {}", result.checksum);
    for key in &result.uploaded {
        println!("Uploaded: {}", key);
    }
    for warning in &result.warnings {
        println!("warning: {}", warning);
    }
    if let Some(summary) = retention {
        println!(
            "Retention: removed {} local and {} remote object(s)",
            summary.local_removed.len(),
            summary.remote_removed.len()
        );
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
            error!(error = %e, "lifeboat-backup failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
