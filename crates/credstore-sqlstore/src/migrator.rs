//! Ordered, idempotent schema migrations
//!
//! Each applied migration is recorded in `migration_log`; running the
//! migrator again skips everything already recorded.

use crate::schema::{secret_table, Table};
use crate::session::BEGIN_WRITE;
use chrono::{SubsecRound, Utc};
use credstore_core::{Error, Result};
use sqlx::SqlitePool;
use tracing::{debug, info};

const MIGRATION_LOG_DDL: &str = r#"CREATE TABLE IF NOT EXISTS "migration_log" (
    "id" INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    "migration_id" TEXT NOT NULL UNIQUE,
    "sql" TEXT NOT NULL,
    "timestamp" DATETIME NOT NULL
)"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub id: String,
    pub sql: String,
}

#[derive(Debug, Clone, Default)]
pub struct Migrator {
    migrations: Vec<Migration>,
}

impl Migrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Migrations for the secret store
    pub fn secret_store() -> Self {
        let mut migrator = Self::new();
        migrator.add_table(&secret_table(), "v1");
        migrator
    }

    pub fn add_migration(&mut self, id: impl Into<String>, sql: impl Into<String>) {
        self.migrations.push(Migration {
            id: id.into(),
            sql: sql.into(),
        });
    }

    /// Add a create-table migration followed by one migration per index
    pub fn add_table(&mut self, table: &Table, version: &str) {
        self.add_migration(
            format!("create {} table {}", table.name, version),
            table.create_sql(),
        );
        for index in &table.indexes {
            self.add_migration(index.migration_id(), index.create_sql());
        }
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Apply pending migrations in order, each in its own transaction.
    /// Returns how many were applied.
    pub async fn run(&self, pool: &SqlitePool) -> Result<usize> {
        sqlx::query(MIGRATION_LOG_DDL)
            .execute(pool)
            .await
            .map_err(|e| Error::migration("create migration_log", e.to_string()))?;

        let applied = Self::applied(pool).await?;
        let mut count = 0;

        for migration in &self.migrations {
            if applied.contains(&migration.id) {
                debug!(migration = %migration.id, "Skipping applied migration");
                continue;
            }

            Self::apply(pool, migration)
                .await
                .map_err(|e| Error::migration(&migration.id, e.to_string()))?;
            info!(migration = %migration.id, "Applied migration");
            count += 1;
        }

        Ok(count)
    }

    async fn apply(pool: &SqlitePool, migration: &Migration) -> sqlx::Result<()> {
        let mut tx = pool.begin_with(BEGIN_WRITE).await?;
        sqlx::query(&migration.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO migration_log (migration_id, sql, timestamp) VALUES (?, ?, ?)")
            .bind(&migration.id)
            .bind(&migration.sql)
            .bind(Utc::now().trunc_subsecs(6))
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    /// Ids of recorded migrations in the order they were applied
    pub async fn applied(pool: &SqlitePool) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT migration_id FROM migration_log ORDER BY id")
                .fetch_all(pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
