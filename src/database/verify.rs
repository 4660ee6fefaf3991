//! Integrity verification of backup artifacts
//!
//! An artifact is trusted only if its checksum sidecar (when present)
//! matches and, for unencrypted artifacts, the dump tool can read its table
//! of contents. Encrypted artifacts are opaque and rely on the checksum alone,
//! so for them the sidecar is mandatory.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::database::backup_naming::{COMPRESSED_EXTENSION, ENCRYPTED_EXTENSION};
use crate::database::tools::{DumpTool, count_table_data};
use crate::database::{DatabaseError, Result, checksum, transform};

/// Result of a successful verification
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationOutcome {
    pub artifact: PathBuf,
    /// Whether a checksum sidecar existed and matched
    pub checksum_verified: bool,
    /// Table-data entries found in the archive (None for encrypted artifacts)
    pub table_count: Option<usize>,
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(extension))
}

pub fn is_encrypted(path: &Path) -> bool {
    has_extension(path, ENCRYPTED_EXTENSION)
}

/// Compressed and not encrypted on top
pub fn is_compressed(path: &Path) -> bool {
    has_extension(path, COMPRESSED_EXTENSION)
}

/// Checks artifacts before they are trusted
pub struct IntegrityVerifier<'a> {
    tools: &'a dyn DumpTool,
    scratch_dir: PathBuf,
}

impl<'a> IntegrityVerifier<'a> {
    /// `scratch_dir` receives temporary decompressed copies during the readability probe
    pub fn new(tools: &'a dyn DumpTool, scratch_dir: &Path) -> Self {
        Self {
            tools,
            scratch_dir: scratch_dir.to_path_buf(),
        }
    }

    pub async fn verify(&self, artifact: &Path) -> Result<VerificationOutcome> {
        if !artifact.is_file() {
            return Err(DatabaseError::BackupNotFound);
        }

        let checksum_verified = match checksum::read_sidecar(artifact).await? {
            Some(expected) => {
                let actual = checksum::compute(artifact).await?;
                if actual != expected {
                    return Err(DatabaseError::Integrity(format!(
                        "checksum mismatch for {}: expected {}, got {}",
                        artifact.display(),
                        expected,
                        actual
                    )));
                }
                true
            }
            None => {
                warn!(artifact = %artifact.display(), "no checksum file, skipping digest check");
                false
            }
        };

        if is_encrypted(artifact) {
            if !checksum_verified {
                return Err(DatabaseError::Integrity(format!(
                    "{} is encrypted and has no checksum file to verify it against",
                    artifact.display()
                )));
            }
            info!(artifact = %artifact.display(), checksum_verified, "encrypted artifact verified by checksum");
            return Ok(VerificationOutcome {
                artifact: artifact.to_path_buf(),
                checksum_verified,
                table_count: None,
            });
        }

        let listed = if is_compressed(artifact) {
            let plain = transform::decompress_to_temp(artifact, &self.scratch_dir).await?;
            let listed = self.tools.list_contents(&plain).await;
            if let Err(e) = plain.close() {
                warn!(error = %e, "failed to remove temporary decompressed file");
            }
            listed
        } else {
            self.tools.list_contents(artifact).await
        };
        let entries = listed.map_err(|e| match e {
            DatabaseError::Integrity(_) => e,
            other => DatabaseError::Integrity(other.to_string()),
        })?;

        let table_count = count_table_data(&entries);
        info!(artifact = %artifact.display(), checksum_verified, table_count, "artifact verified");
        Ok(VerificationOutcome {
            artifact: artifact.to_path_buf(),
            checksum_verified,
            table_count: Some(table_count),
        })
    }
}
