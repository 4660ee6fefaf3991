//! In-memory stand-in for a PostgreSQL server and its client tools
//!
//! Databases are maps of table name to row count. Dumps are small JSON
//! documents, so backup → transform → restore round trips run without a
//! server while still exercising every file-level step for real.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use crate::database::admin::DatabaseAdmin;
use crate::database::tools::{DumpTool, RestoreOptions};
use crate::database::{DatabaseError, Result};

type Tables = BTreeMap<String, u64>;

#[derive(Serialize, Deserialize)]
struct FakeArchive {
    format: String,
    database: String,
    tables: Tables,
}

const ARCHIVE_FORMAT: &str = "fake-pg-archive/1";

#[derive(Default)]
struct State {
    databases: BTreeMap<String, Tables>,
    unreachable: bool,
    fail_dump: bool,
    fail_restore: bool,
    fail_table_count: bool,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    /// Cluster holding `name` with `users` (3 rows) and `businesses` (1 row)
    pub fn with_sample_database(name: &str) -> Self {
        let cluster = Self::default();
        cluster.add_database(name, &[("users", 3), ("businesses", 1)]);
        cluster
    }

    pub fn add_database(&self, name: &str, tables: &[(&str, u64)]) {
        let tables = tables.iter().map(|(t, n)| (t.to_string(), *n)).collect();
        self.state.lock().unwrap().databases.insert(name.to_string(), tables);
    }

    pub fn tables(&self, name: &str) -> Option<Tables> {
        self.state.lock().unwrap().databases.get(name).cloned()
    }

    pub fn databases(&self) -> Vec<String> {
        self.state.lock().unwrap().databases.keys().cloned().collect()
    }

    pub fn set_unreachable(&self) {
        self.state.lock().unwrap().unreachable = true;
    }

    pub fn fail_dumps(&self) {
        self.state.lock().unwrap().fail_dump = true;
    }

    pub fn fail_restores(&self) {
        self.state.lock().unwrap().fail_restore = true;
    }

    /// Catalog queries fail as if the connection dropped
    pub fn fail_table_counts(&self) {
        self.state.lock().unwrap().fail_table_count = true;
    }

    /// Mutating calls, in order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.state.lock().unwrap().unreachable {
            return Err(DatabaseError::Connectivity("connection refused".to_string()));
        }
        Ok(())
    }

    fn with_database<T>(&self, name: &str, f: impl FnOnce(&Tables) -> T) -> Result<T> {
        self.check_reachable()?;
        let state = self.state.lock().unwrap();
        state
            .databases
            .get(name)
            .map(f)
            .ok_or_else(|| DatabaseError::Database(format!("database \"{}\" does not exist", name)))
    }

    async fn read_archive(archive: &Path) -> Result<FakeArchive> {
        let bytes = tokio::fs::read(archive).await?;
        match serde_json::from_slice::<FakeArchive>(&bytes) {
            Ok(parsed) if parsed.format == ARCHIVE_FORMAT => Ok(parsed),
            _ => Err(DatabaseError::Integrity(format!(
                "{} is not a valid archive",
                archive.display()
            ))),
        }
    }
}

#[async_trait]
impl DatabaseAdmin for FakeCluster {
    async fn server_reachable(&self) -> bool {
        self.check_reachable().is_ok()
    }

    async fn database_exists(&self, name: &str) -> Result<bool> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().databases.contains_key(name))
    }

    async fn ping_database(&self, name: &str) -> Result<()> {
        self.with_database(name, |_| ())
    }

    async fn table_count(&self, name: &str) -> Result<u64> {
        if self.state.lock().unwrap().fail_table_count {
            return Err(DatabaseError::Database("server closed the connection unexpectedly".to_string()));
        }
        self.with_database(name, |tables| tables.len() as u64)
    }

    async fn table_exists(&self, name: &str, table: &str) -> Result<bool> {
        self.with_database(name, |tables| tables.contains_key(table))
    }

    async fn row_count(&self, name: &str, table: &str) -> Result<u64> {
        self.with_database(name, |tables| tables.get(table).copied())?
            .ok_or_else(|| DatabaseError::Database(format!("relation \"{}\" does not exist", table)))
    }

    async fn terminate_connections(&self, name: &str) -> Result<u64> {
        self.check_reachable()?;
        self.record(format!("terminate {}", name));
        Ok(0)
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.check_reachable()?;
        self.record(format!("drop {}", name));
        self.state.lock().unwrap().databases.remove(name);
        Ok(())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.check_reachable()?;
        self.record(format!("create {}", name));
        let mut state = self.state.lock().unwrap();
        if state.databases.contains_key(name) {
            return Err(DatabaseError::Database(format!("database \"{}\" already exists", name)));
        }
        state.databases.insert(name.to_string(), Tables::new());
        Ok(())
    }

    async fn analyze(&self, name: &str) -> Result<()> {
        self.with_database(name, |_| ())?;
        self.record(format!("analyze {}", name));
        Ok(())
    }
}

#[async_trait]
impl DumpTool for FakeCluster {
    async fn dump(&self, database: &str, output: &Path) -> Result<()> {
        if self.state.lock().unwrap().fail_dump {
            return Err(DatabaseError::Dump("pg_dump: error: connection refused".to_string()));
        }
        let tables = self
            .with_database(database, |t| t.clone())
            .map_err(|e| DatabaseError::Dump(e.to_string()))?;
        let archive = FakeArchive {
            format: ARCHIVE_FORMAT.to_string(),
            database: database.to_string(),
            tables,
        };
        tokio::fs::write(output, serde_json::to_vec(&archive)?).await?;
        Ok(())
    }

    async fn list_contents(&self, archive: &Path) -> Result<Vec<String>> {
        let parsed = Self::read_archive(archive).await?;
        Ok(parsed
            .tables
            .keys()
            .enumerate()
            .flat_map(|(i, table)| {
                [
                    format!("{}; 1259 {} TABLE public {} postgres", 200 + i, 16000 + i, table),
                    format!("{}; 0 {} TABLE DATA public {} postgres", 3000 + i, 16000 + i, table),
                ]
            })
            .collect())
    }

    async fn restore(&self, archive: &Path, target: &str, options: &RestoreOptions) -> Result<()> {
        let parsed = Self::read_archive(archive)
            .await
            .map_err(|e| DatabaseError::RestoreTool(e.to_string()))?;
        self.record(format!("restore {} jobs={}", target, options.jobs));

        let mut state = self.state.lock().unwrap();
        if state.fail_restore {
            return Err(DatabaseError::RestoreTool(
                "pg_restore: error: could not execute query".to_string(),
            ));
        }
        let tables = state
            .databases
            .get_mut(target)
            .ok_or_else(|| DatabaseError::RestoreTool(format!("database \"{}\" does not exist", target)))?;
        tables.extend(parsed.tables);
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        Ok("pg_dump (PostgreSQL) 16.2".to_string())
    }
}
