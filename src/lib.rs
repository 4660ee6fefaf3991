//! Lifeboat: verified, encrypted, rotated PostgreSQL backups and
//! mode-aware restores.

pub mod config;
pub mod database;
pub mod logging;
pub mod notify;
pub mod report;

#[cfg(test)]
pub mod testing;
