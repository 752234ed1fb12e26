use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// Persistent store for deduplicated items and per-source run configuration.
///
/// Cloning is cheap; every clone shares one connection pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `path` and run migrations.
    ///
    /// `":memory:"` opens a private in-memory database shared by the pool.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout lets concurrent writers wait for the write lock instead
        // of failing with SQLITE_BUSY. Every pooled connection inherits it.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self { pool };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::Other(e) => DatabaseError::Migration(e.to_string()),
            other => other,
        })?;
        tracing::debug!(path = %path, "Database opened");
        Ok(db)
    }

    /// Create tables and indexes in one transaction. Idempotent.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // One row per (source, url); that pair is the dedup key.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hot_items (
                id INTEGER PRIMARY KEY,
                source TEXT NOT NULL,
                item_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                cover_url TEXT,
                author TEXT,
                popularity TEXT,
                timestamp_millis INTEGER NOT NULL,
                url TEXT NOT NULL,
                mobile_url TEXT NOT NULL,
                first_seen_at INTEGER NOT NULL,
                last_updated_at INTEGER NOT NULL,
                search_text TEXT NOT NULL DEFAULT '',
                UNIQUE(source, url)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_hot_items_source_ts ON hot_items(source, timestamp_millis DESC)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_hot_items_ts ON hot_items(timestamp_millis DESC)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_hot_items_first_seen ON hot_items(first_seen_at DESC)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_configs (
                source TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL DEFAULT 1,
                interval_minutes INTEGER NOT NULL,
                last_fetch_at INTEGER,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = Database::open(":memory:").await.unwrap();
        db.migrate().await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('hot_items', 'source_configs') ORDER BY name",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();
        assert_eq!(tables.len(), 2);
    }
}
