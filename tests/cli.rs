//! Command-line tests for the lifeboat binaries

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

const ENV_KEYS: &[&str] = &[
    "DB_HOST",
    "DB_PORT",
    "DB_NAME",
    "DB_USER",
    "DB_PASSWORD",
    "BACKUP_DIR",
    "BACKUP_PREFIX",
    "RETENTION_DAYS",
    "S3_BUCKET",
    "ENCRYPTION_KEY_FILE",
    "WEBHOOK_URL",
    "BACKUP_LOG_FILE",
];

fn command(bin: &str) -> Command {
    let mut cmd = Command::cargo_bin(bin).unwrap();
    for key in ENV_KEYS {
        cmd.env_remove(key);
    }
    cmd
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("lifeboat.toml");
    let content = format!(
        r#"backup_dir = "{}"
retention_days = 7

[database]
name = "attribution"
port = 1
connect_timeout_secs = 1
"#,
        dir.join("backups").display()
    );
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_backup_help() {
    command("lifeboat-backup")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--verify-only"))
        .stdout(predicate::str::contains("--retention-days"));
}

#[test]
fn test_recover_help() {
    command("lifeboat-recover")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--restore-latest"))
        .stdout(predicate::str::contains("--pitr"));
}

#[test]
fn test_recover_requires_an_action() {
    command("lifeboat-recover").assert().failure();
}

#[test]
fn test_recover_rejects_two_actions() {
    command("lifeboat-recover")
        .args(["--assess", "--list"])
        .assert()
        .failure();
}

#[test]
fn test_recover_rejects_conflicting_modes() {
    command("lifeboat-recover")
        .args(["--restore-latest", "--parallel", "--test"])
        .assert()
        .failure();
}

#[test]
fn test_verify_only_missing_file_fails() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());

    command("lifeboat-backup")
        .arg("--config")
        .arg(&config)
        .arg("--verify-only")
        .arg(dir.path().join("backup_20250601_143000.sql.gz"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn test_list_empty_backup_dir() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());

    command("lifeboat-backup")
        .arg("--config")
        .arg(&config)
        .arg("--list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Local backups in"))
        .stdout(predicate::str::contains("none"));
}

#[test]
fn test_pitr_is_unsupported() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());

    command("lifeboat-recover")
        .arg("--config")
        .arg(&config)
        .args(["--pitr", "2025-06-01 12:00:00"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("point-in-time recovery"));
}

#[test]
fn test_backup_without_database_name_fails() {
    let dir = tempdir().unwrap();

    command("lifeboat-backup")
        .arg("--output-dir")
        .arg(dir.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("DB_NAME"));
}
