//! Tracing subscriber setup shared by the binaries
//!
//! Events go to stderr and, when the log file can be opened, are appended to
//! a persistent log without ANSI colors.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "lifeboat=info";

fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("lifeboat=debug")
        } else {
            EnvFilter::new(DEFAULT_FILTER)
        }
    })
}

/// Install the global subscriber; returns the log file in use, if any
pub fn init(log_file: Option<&Path>, verbose: bool) -> Option<PathBuf> {
    let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr).boxed();

    let mut open_error = None;
    let file_layer = log_file.and_then(|path| match open_log(path) {
        Ok(file) => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .boxed(),
        ),
        Err(e) => {
            open_error = Some((path.to_path_buf(), e));
            None
        }
    });
    let in_use = file_layer.as_ref().and(log_file.map(Path::to_path_buf));

    let installed = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(console)
        .with(file_layer)
        .try_init()
        .is_ok();

    if let Some((path, e)) = open_error {
        tracing::warn!(path = %path.display(), error = %e, "cannot open log file, logging to console only");
    }
    if installed { in_use } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_log_creates_parent_and_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("lifeboat.log");

        std::io::Write::write_all(&mut open_log(&path).unwrap(), b"one\n").unwrap();
        std::io::Write::write_all(&mut open_log(&path).unwrap(), b"two\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }
}
