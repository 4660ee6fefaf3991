//! PostgreSQL client utilities (`pg_dump` / `pg_restore`) driven as child processes

use async_trait::async_trait;
use std::path::Path;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::DatabaseSettings;
use crate::database::{DatabaseError, Result};

/// Options for a restore run
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Parallel workers used for table-level restore steps
    pub jobs: usize,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self { jobs: 4 }
    }
}

/// Producer and consumer of portable dump archives
#[async_trait]
pub trait DumpTool: Send + Sync {
    /// Dump `database` into `output` in the portable archive format
    async fn dump(&self, database: &str, output: &Path) -> Result<()>;

    /// Table-of-contents entries of an archive; fails if the archive is unreadable
    async fn list_contents(&self, archive: &Path) -> Result<Vec<String>>;

    /// Restore `archive` into the existing database `target`
    async fn restore(&self, archive: &Path, target: &str, options: &RestoreOptions) -> Result<()>;

    /// Version string recorded in backup metadata
    async fn version(&self) -> Result<String>;
}

/// Count table-data entries in a table of contents
pub fn count_table_data(entries: &[String]) -> usize {
    entries.iter().filter(|e| e.contains("TABLE DATA")).count()
}

/// [`DumpTool`] backed by the PostgreSQL client binaries on `PATH`
pub struct PgTools {
    settings: DatabaseSettings,
}

impl PgTools {
    pub fn new(settings: &DatabaseSettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg("--host")
            .arg(&self.settings.host)
            .arg("--port")
            .arg(self.settings.port.to_string())
            .arg("--username")
            .arg(&self.settings.user)
            .arg("--no-password");
        if let Some(password) = &self.settings.password {
            cmd.env("PGPASSWORD", password);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    fn dump_args(&self, database: &str, output: &Path) -> Vec<String> {
        vec![
            "--format=custom".to_string(),
            "--compress=9".to_string(),
            "--verbose".to_string(),
            format!("--lock-wait-timeout={}", self.settings.lock_wait_timeout_secs * 1000),
            format!("--file={}", output.display()),
            format!("--dbname={}", database),
        ]
    }

    /// `pg_restore` refuses `--single-transaction` together with `--jobs > 1`
    fn restore_args(&self, archive: &Path, target: &str, options: &RestoreOptions) -> Vec<String> {
        let mut args = vec![
            format!("--dbname={}", target),
            "--no-owner".to_string(),
            "--exit-on-error".to_string(),
        ];
        if options.jobs > 1 {
            args.push(format!("--jobs={}", options.jobs));
        } else {
            args.push("--single-transaction".to_string());
        }
        args.push(archive.display().to_string());
        args
    }
}

fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().rev().take(5).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join("; ")
}

#[async_trait]
impl DumpTool for PgTools {
    async fn dump(&self, database: &str, output: &Path) -> Result<()> {
        let args = self.dump_args(database, output);
        debug!(?args, "running pg_dump");
        let out = self
            .command("pg_dump")
            .args(&args)
            .output()
            .await
            .map_err(|e| DatabaseError::Dump(format!("failed to start pg_dump: {}", e)))?;
        if !out.status.success() {
            return Err(DatabaseError::Dump(format!(
                "pg_dump exited with {}: {}",
                out.status,
                stderr_tail(&out)
            )));
        }
        Ok(())
    }

    async fn list_contents(&self, archive: &Path) -> Result<Vec<String>> {
        let out = Command::new("pg_restore")
            .arg("--list")
            .arg(archive)
            .output()
            .await
            .map_err(|e| DatabaseError::Integrity(format!("failed to start pg_restore: {}", e)))?;
        if !out.status.success() {
            return Err(DatabaseError::Integrity(format!(
                "cannot read archive table of contents: {}",
                stderr_tail(&out)
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter(|l| !l.starts_with(';') && !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn restore(&self, archive: &Path, target: &str, options: &RestoreOptions) -> Result<()> {
        let args = self.restore_args(archive, target, options);
        debug!(?args, "running pg_restore");
        let out = self
            .command("pg_restore")
            .args(&args)
            .output()
            .await
            .map_err(|e| DatabaseError::RestoreTool(format!("failed to start pg_restore: {}", e)))?;
        if !out.status.success() {
            return Err(DatabaseError::RestoreTool(format!(
                "pg_restore exited with {}: {}",
                out.status,
                stderr_tail(&out)
            )));
        }
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        match Command::new("pg_dump").arg("--version").output().await {
            Ok(out) if out.status.success() => {
                Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
            }
            Ok(out) => {
                warn!(status = %out.status, "pg_dump --version failed");
                Ok(String::from("unknown"))
            }
            Err(e) => Err(DatabaseError::Dump(format!("pg_dump not available: {}", e))),
        }
    }
}
