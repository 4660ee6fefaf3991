//! SHA-256 checksum sidecars
//!
//! The sidecar uses the same layout as `sha256sum`, so an operator can check
//! an artifact with `sha256sum -c <artifact>.sha256` from its directory.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::database::backup_naming::checksum_path;
use crate::database::{DatabaseError, Result};

pub const ALGORITHM: &str = "sha256";

/// Hash a file's contents
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file on the blocking pool
pub async fn compute(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| DatabaseError::Integrity(format!("checksum task failed: {}", e)))?
}

/// Compute the digest of `artifact` and write its sidecar
pub async fn write_sidecar(artifact: &Path) -> Result<(PathBuf, String)> {
    let digest = compute(artifact).await?;
    let file_name = artifact
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DatabaseError::Integrity(format!("invalid artifact path {}", artifact.display())))?;

    let sidecar = checksum_path(artifact);
    tokio::fs::write(&sidecar, format!("{}  {}\n", digest, file_name)).await?;
    Ok((sidecar, digest))
}

/// Read the expected digest from a sidecar, if one exists
pub async fn read_sidecar(artifact: &Path) -> Result<Option<String>> {
    let sidecar = checksum_path(artifact);
    if !sidecar.exists() {
        return Ok(None);
    }
    let content = tokio::fs::read_to_string(&sidecar).await?;
    let digest = content
        .split_whitespace()
        .next()
        .filter(|d| d.len() == 64 && d.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| {
            DatabaseError::Integrity(format!("malformed checksum file {}", sidecar.display()))
        })?;
    Ok(Some(digest.to_ascii_lowercase()))
}
