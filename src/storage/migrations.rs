//! Schema migrations for the Postgres store.
//!
//! Each schema statement is one migration, named `v1_<nn>` by its position.
//! Applied names are recorded in `_migrations`; re-running is a no-op.

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool};

use super::schema;
use crate::error::StoreError;

const LEDGER_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS _migrations (
    name TEXT PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// A migration already recorded in the ledger.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn migration_name(position: usize) -> String {
        format!("v1_{:02}", position)
    }

    /// Applies every pending statement and returns how many were applied.
    pub async fn run_migrations(&self) -> Result<usize, StoreError> {
        self.pool.execute(LEDGER_DDL).await?;

        let applied: Vec<String> = self.applied().await?.into_iter().map(|m| m.name).collect();
        let mut count = 0;
        for (position, statement) in schema::all_schema_statements().into_iter().enumerate() {
            let name = Self::migration_name(position);
            if applied.contains(&name) {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            // Simple-query protocol: index scripts hold several statements.
            (&mut *tx)
                .execute(statement)
                .await
                .map_err(|e| StoreError::Migration(format!("{}: {}", name, e)))?;
            sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
                .bind(&name)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            tracing::info!(migration = %name, "Applied migration");
            count += 1;
        }
        Ok(count)
    }

    /// Recorded migrations, oldest first.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, StoreError> {
        self.pool.execute(LEDGER_DDL).await?;
        let rows = sqlx::query_as::<_, AppliedMigration>(
            "SELECT name, applied_at FROM _migrations ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Number of schema statements not yet recorded.
    pub async fn pending(&self) -> Result<usize, StoreError> {
        let applied = self.applied().await?;
        Ok(schema::all_schema_statements()
            .len()
            .saturating_sub(applied.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_names_sort_by_position() {
        let names: Vec<String> = (0..schema::all_schema_statements().len())
            .map(MigrationRunner::migration_name)
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(names[0], "v1_00");
    }
}
