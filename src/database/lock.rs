//! Advisory lease lock keyed by restore target
//!
//! The lease lives at `<dir>/.locks/<target>.lock`. It is written to a
//! temporary file first and published with a no-clobber link, so the lock
//! path only ever holds a complete lease and two processes on hosts sharing
//! the backup directory cannot both take it. An expired lease may be taken
//! over; an unreadable one is treated as held.

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::database::{DatabaseError, Result};

const ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    holder: String,
    target: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// A held lease; released explicitly or on drop
#[derive(Debug)]
pub struct RestoreLock {
    path: PathBuf,
    holder: String,
    released: bool,
}

fn holder_token() -> String {
    let random: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("{}-{}", std::process::id(), random)
}

/// Publish `lease` at `path`; fails with `AlreadyExists` if any lease is there
fn publish(path: &Path, lease: &Lease) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut temp, lease).map_err(std::io::Error::other)?;
    temp.as_file().sync_all()?;
    temp.persist_noclobber(path).map_err(|e| e.error)?;
    Ok(())
}

enum Existing {
    Gone,
    Unreadable,
    Lease(Lease),
}

fn read_existing(path: &Path) -> std::io::Result<Existing> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice::<Lease>(&bytes)
            .map(Existing::Lease)
            .unwrap_or(Existing::Unreadable)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Existing::Gone),
        Err(e) => Err(e),
    }
}

fn lock_held(target: &str, holder: String, expires_at: String) -> DatabaseError {
    DatabaseError::LockHeld {
        target: target.to_string(),
        holder,
        expires_at,
    }
}

/// Move an expired lease out of the way
///
/// Returns the lease that was actually moved when it is not the expired one
/// (another process published a fresh lease in between); that lease is put
/// back.
fn retire(path: &Path, stale: &Lease) -> std::io::Result<Option<Lease>> {
    let parked = path.with_extension(format!("stale-{}", holder_token()));
    match std::fs::rename(path, &parked) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    }
    let moved = match read_existing(&parked)? {
        Existing::Lease(lease) if lease.holder != stale.holder => Some(lease),
        _ => None,
    };
    if moved.is_some() {
        // Restore the live lease unless yet another one has appeared
        if let Err(e) = std::fs::hard_link(&parked, path) {
            warn!(path = %path.display(), error = %e, "could not put back a live restore lock");
        }
    }
    std::fs::remove_file(&parked)?;
    Ok(moved)
}

impl RestoreLock {
    /// Acquire the lease for `target`, taking over an expired one
    pub fn acquire(dir: &Path, target: &str, ttl: Duration) -> Result<Self> {
        let lock_dir = dir.join(".locks");
        std::fs::create_dir_all(&lock_dir)?;
        let path = lock_dir.join(format!("{}.lock", target));

        let now = Utc::now();
        let lease = Lease {
            holder: holder_token(),
            target: target.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        };

        for _ in 0..ACQUIRE_ATTEMPTS {
            match publish(&path, &lease) {
                Ok(()) => {
                    info!(database = target, holder = %lease.holder, expires_at = %lease.expires_at, "restore lock acquired");
                    return Ok(Self {
                        path,
                        holder: lease.holder,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            match read_existing(&path)? {
                Existing::Gone => continue,
                Existing::Unreadable => {
                    warn!(database = target, path = %path.display(), "restore lock is unreadable, remove it manually if no restore is running");
                    return Err(lock_held(target, "unknown".to_string(), "unknown".to_string()));
                }
                Existing::Lease(held) if held.expires_at > now => {
                    return Err(lock_held(target, held.holder, held.expires_at.to_rfc3339()));
                }
                Existing::Lease(held) => {
                    warn!(database = target, stale_holder = %held.holder, "taking over expired restore lock");
                    if let Some(live) = retire(&path, &held)? {
                        return Err(lock_held(target, live.holder, live.expires_at.to_rfc3339()));
                    }
                }
            }
        }

        Err(lock_held(target, "unknown".to_string(), "unknown".to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lease if this process still holds it
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match read_existing(&self.path) {
            Ok(Existing::Lease(lease)) if lease.holder == self.holder => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "failed to release restore lock");
                } else {
                    debug!(path = %self.path.display(), "restore lock released");
                }
            }
            Ok(Existing::Lease(lease)) => {
                warn!(holder = %lease.holder, "restore lock was taken over, leaving it in place");
            }
            Ok(_) => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to read restore lock on release"),
        }
    }
}

impl Drop for RestoreLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_is_rejected_until_release() {
        let dir = tempdir().unwrap();
        let mut first = RestoreLock::acquire(dir.path(), "attribution", Duration::hours(2)).unwrap();

        let err = RestoreLock::acquire(dir.path(), "attribution", Duration::hours(2)).unwrap_err();
        assert!(matches!(err, DatabaseError::LockHeld { .. }));

        // Different target is independent
        let _other = RestoreLock::acquire(dir.path(), "analytics", Duration::hours(2)).unwrap();

        // Only the published leases remain, no staging files
        assert_eq!(std::fs::read_dir(dir.path().join(".locks")).unwrap().count(), 2);

        first.release();
        assert!(!first.path().exists());
        assert!(RestoreLock::acquire(dir.path(), "attribution", Duration::hours(2)).is_ok());
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        let dir = tempdir().unwrap();
        let stale = RestoreLock::acquire(dir.path(), "attribution", Duration::seconds(-1)).unwrap();
        let stale_path = stale.path().to_path_buf();
        std::mem::forget(stale);

        let fresh = RestoreLock::acquire(dir.path(), "attribution", Duration::hours(1)).unwrap();
        assert_eq!(fresh.path(), stale_path);
    }

    #[test]
    fn test_lease_being_written_is_not_taken_over() {
        let dir = tempdir().unwrap();
        let locks = dir.path().join(".locks");
        std::fs::create_dir_all(&locks).unwrap();
        let path = locks.join("attribution.lock");
        std::fs::write(&path, b"").unwrap();

        let err = RestoreLock::acquire(dir.path(), "attribution", Duration::hours(1)).unwrap_err();

        assert!(matches!(err, DatabaseError::LockHeld { .. }));
        assert!(path.exists());
    }

    #[test]
    fn test_drop_releases() {
        let dir = tempdir().unwrap();
        let path = {
            let lock = RestoreLock::acquire(dir.path(), "attribution", Duration::hours(1)).unwrap();
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
