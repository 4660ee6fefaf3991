use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::database::Result;
use crate::database::admin::DatabaseAdmin;

/// Outcome of checking a freshly restored database
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerificationReport {
    pub database: String,
    pub total_tables: u64,
    /// Row counts of the essential tables that exist
    pub row_counts: BTreeMap<String, u64>,
    pub missing_tables: Vec<String>,
    pub total_rows: u64,
}

impl VerificationReport {
    /// Missing essential tables or no rows at all
    pub fn degraded(&self) -> bool {
        !self.missing_tables.is_empty() || self.total_rows == 0
    }

    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.missing_tables.is_empty() {
            warnings.push(format!(
                "Missing essential tables: {}",
                self.missing_tables.join(", ")
            ));
        }
        if self.total_rows == 0 {
            warnings.push("Essential tables contain no rows".to_string());
        }
        warnings
    }
}

/// Checks essential tables in a restored database
pub struct PostRestoreVerifier<'a> {
    admin: &'a dyn DatabaseAdmin,
    essential_tables: &'a [String],
}

impl<'a> PostRestoreVerifier<'a> {
    pub fn new(admin: &'a dyn DatabaseAdmin, essential_tables: &'a [String]) -> Self {
        Self {
            admin,
            essential_tables,
        }
    }

    pub async fn verify(&self, database: &str) -> Result<VerificationReport> {
        let mut report = VerificationReport {
            database: database.to_string(),
            total_tables: self.admin.table_count(database).await?,
            ..VerificationReport::default()
        };

        for table in self.essential_tables {
            if !self.admin.table_exists(database, table).await? {
                report.missing_tables.push(table.clone());
                continue;
            }
            let rows = self.admin.row_count(database, table).await?;
            report.total_rows += rows;
            report.row_counts.insert(table.clone(), rows);
        }

        if report.degraded() {
            for warning in report.warnings() {
                warn!(database, "{}", warning);
            }
        } else {
            info!(
                database,
                total_tables = report.total_tables,
                total_rows = report.total_rows,
                "restored database verified"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::admin::MockDatabaseAdmin;
    use crate::testing::FakeCluster;

    fn essential() -> Vec<String> {
        vec!["users".to_string(), "businesses".to_string(), "attribution_events".to_string()]
    }

    #[tokio::test]
    async fn test_reports_counts_and_missing_tables() {
        let cluster = FakeCluster::with_sample_database("attribution_test_20250601_143000");
        let tables = essential();

        let report = PostRestoreVerifier::new(&cluster, &tables)
            .verify("attribution_test_20250601_143000")
            .await
            .unwrap();

        assert_eq!(report.total_tables, 2);
        assert_eq!(report.row_counts.get("users"), Some(&3));
        assert_eq!(report.row_counts.get("businesses"), Some(&1));
        assert_eq!(report.missing_tables, vec!["attribution_events"]);
        assert_eq!(report.total_rows, 4);
        assert!(report.degraded());
        assert_eq!(report.warnings(), vec!["Missing essential tables: attribution_events"]);
    }

    #[tokio::test]
    async fn test_empty_tables_are_degraded() {
        let mut admin = MockDatabaseAdmin::new();
        admin.expect_table_count().times(1).returning(|_| Ok(1));
        admin.expect_table_exists().returning(|_, _| Ok(true));
        admin.expect_row_count().returning(|_, _| Ok(0));
        let tables = vec!["users".to_string()];

        let report = PostRestoreVerifier::new(&admin, &tables).verify("restored").await.unwrap();

        assert!(report.missing_tables.is_empty());
        assert!(report.degraded());
        assert_eq!(report.warnings(), vec!["Essential tables contain no rows"]);
    }

    #[tokio::test]
    async fn test_complete_restore_is_not_degraded() {
        let cluster = FakeCluster::default();
        cluster.add_database("restored", &[("users", 3), ("businesses", 1), ("attribution_events", 40)]);
        let tables = essential();

        let report = PostRestoreVerifier::new(&cluster, &tables).verify("restored").await.unwrap();
        assert!(!report.degraded());
        assert_eq!(report.total_rows, 44);
    }
}
