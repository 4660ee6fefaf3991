//! Administrative access to the PostgreSQL server
//!
//! Every call opens its own short-lived connection: the workflows are
//! sequential and mostly need a connection to a *different* database on each
//! step (maintenance database for DDL, restored database for verification).

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Executor};
use tracing::{debug, info, warn};

use crate::config::DatabaseSettings;
use crate::database::{DatabaseError, Result};

/// Database used for server-level statements
const MAINTENANCE_DATABASE: &str = "postgres";

/// Operations the workflows need from the database server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Whether the server accepts connections at all
    async fn server_reachable(&self) -> bool;

    async fn database_exists(&self, name: &str) -> Result<bool>;

    /// Run a trivial query against `name`
    async fn ping_database(&self, name: &str) -> Result<()>;

    /// Number of tables in the public schema of `name`
    async fn table_count(&self, name: &str) -> Result<u64>;

    async fn table_exists(&self, name: &str, table: &str) -> Result<bool>;

    async fn row_count(&self, name: &str, table: &str) -> Result<u64>;

    /// Terminate every other session connected to `name`, returning how many were ended
    async fn terminate_connections(&self, name: &str) -> Result<u64>;

    async fn drop_database(&self, name: &str) -> Result<()>;

    async fn create_database(&self, name: &str) -> Result<()>;

    /// Refresh planner statistics
    async fn analyze(&self, name: &str) -> Result<()>;
}

/// Check that `ident` is safe to interpolate as a quoted identifier
pub fn validate_identifier(ident: &str) -> Result<()> {
    let mut chars = ident.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if !valid_start
        || ident.len() > 63
        || !ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(DatabaseError::Config(format!("invalid identifier: {:?}", ident)));
    }
    Ok(())
}

fn quote_identifier(ident: &str) -> Result<String> {
    validate_identifier(ident)?;
    Ok(format!("\"{}\"", ident))
}

/// [`DatabaseAdmin`] backed by sqlx PostgreSQL connections
pub struct PgAdmin {
    settings: DatabaseSettings,
}

impl PgAdmin {
    pub fn new(settings: &DatabaseSettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    fn options(&self, database: &str) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.settings.host)
            .port(self.settings.port)
            .username(&self.settings.user)
            .database(database)
            .application_name("lifeboat");
        if let Some(password) = &self.settings.password {
            options = options.password(password);
        }
        options
    }

    async fn connect(&self, database: &str) -> Result<PgConnection> {
        let options = self.options(database);
        match tokio::time::timeout(self.settings.connect_timeout(), PgConnection::connect_with(&options)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(DatabaseError::Connectivity(format!(
                "{}:{}/{}: {}",
                self.settings.host, self.settings.port, database, e
            ))),
            Err(_) => Err(DatabaseError::Connectivity(format!(
                "{}:{}/{}: timed out after {}s",
                self.settings.host, self.settings.port, database, self.settings.connect_timeout_secs
            ))),
        }
    }
}

#[async_trait]
impl DatabaseAdmin for PgAdmin {
    async fn server_reachable(&self) -> bool {
        match self.connect(MAINTENANCE_DATABASE).await {
            Ok(conn) => {
                let _ = conn.close().await;
                true
            }
            Err(e) => {
                warn!(error = %e, "database server unreachable");
                false
            }
        }
    }

    async fn database_exists(&self, name: &str) -> Result<bool> {
        let mut conn = self.connect(MAINTENANCE_DATABASE).await?;
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(name)
                .fetch_one(&mut conn)
                .await?;
        Ok(exists)
    }

    async fn ping_database(&self, name: &str) -> Result<()> {
        let mut conn = self.connect(name).await?;
        let _: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&mut conn).await?;
        Ok(())
    }

    async fn table_count(&self, name: &str) -> Result<u64> {
        let mut conn = self.connect(name).await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'",
        )
        .fetch_one(&mut conn)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn table_exists(&self, name: &str, table: &str) -> Result<bool> {
        let mut conn = self.connect(name).await?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name = $1)",
        )
        .bind(table)
        .fetch_one(&mut conn)
        .await?;
        Ok(exists)
    }

    async fn row_count(&self, name: &str, table: &str) -> Result<u64> {
        let sql = format!("SELECT count(*) FROM public.{}", quote_identifier(table)?);
        let mut conn = self.connect(name).await?;
        let count: i64 = sqlx::query_scalar(sql.as_str()).fetch_one(&mut conn).await?;
        Ok(count.max(0) as u64)
    }

    async fn terminate_connections(&self, name: &str) -> Result<u64> {
        let mut conn = self.connect(MAINTENANCE_DATABASE).await?;
        let terminated: Vec<bool> = sqlx::query_scalar(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(name)
        .fetch_all(&mut conn)
        .await?;
        let count = terminated.into_iter().filter(|t| *t).count() as u64;
        info!(database = name, sessions = count, "terminated active connections");
        Ok(count)
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let sql = format!("DROP DATABASE IF EXISTS {}", quote_identifier(name)?);
        let mut conn = self.connect(MAINTENANCE_DATABASE).await?;
        conn.execute(sql.as_str()).await?;
        info!(database = name, "dropped database");
        Ok(())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        let sql = format!(
            "CREATE DATABASE {} OWNER {}",
            quote_identifier(name)?,
            quote_identifier(&self.settings.user)?
        );
        let mut conn = self.connect(MAINTENANCE_DATABASE).await?;
        conn.execute(sql.as_str()).await?;
        info!(database = name, "created database");
        Ok(())
    }

    async fn analyze(&self, name: &str) -> Result<()> {
        let mut conn = self.connect(name).await?;
        conn.execute("ANALYZE").await?;
        debug!(database = name, "statistics refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("attribution_test_20250601_143000").is_ok());
        assert!(validate_identifier("_private").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1users").is_err());
        assert!(validate_identifier("users\"; DROP TABLE x; --").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("users").unwrap(), "\"users\"");
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_false() {
        let settings = DatabaseSettings {
            host: "127.0.0.1".to_string(),
            // Reserved port: nothing listens here
            port: 1,
            name: "attribution".to_string(),
            connect_timeout_secs: 2,
            ..DatabaseSettings::default()
        };
        let admin = PgAdmin::new(&settings);

        assert!(!admin.server_reachable().await);
        assert!(matches!(
            admin.database_exists("attribution").await,
            Err(DatabaseError::Connectivity(_))
        ));
    }
}
