use chrono::Utc;

use super::schema::Database;
use super::types::{DatabaseError, SourceRunConfig};

const CONFIG_COLUMNS: &str = "source, enabled, interval_minutes, last_fetch_at";

impl Database {
    // ========================================================================
    // Source run configuration
    // ========================================================================

    /// Create an enabled config for every name that has none yet.
    ///
    /// Existing rows are left untouched. Returns how many were created.
    pub async fn initialize_configs(
        &self,
        names: &[String],
        default_interval_minutes: i64,
    ) -> Result<usize, DatabaseError> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
        let mut created = 0;
        for name in names {
            let result = sqlx::query(
                "INSERT INTO source_configs (source, enabled, interval_minutes, created_at) \
                 VALUES (?, 1, ?, ?) ON CONFLICT(source) DO NOTHING",
            )
            .bind(name)
            .bind(default_interval_minutes.max(1))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            created += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        if created > 0 {
            tracing::info!(created, total = names.len(), "Initialized source configs");
        }
        Ok(created)
    }

    /// Every config, sorted by source name.
    pub async fn all_configs(&self) -> Result<Vec<SourceRunConfig>, DatabaseError> {
        let sql = format!("SELECT {CONFIG_COLUMNS} FROM source_configs ORDER BY source");
        sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    pub async fn config(&self, source: &str) -> Result<Option<SourceRunConfig>, DatabaseError> {
        let sql = format!("SELECT {CONFIG_COLUMNS} FROM source_configs WHERE source = ?");
        sqlx::query_as(&sql)
            .bind(source)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    pub async fn enabled_configs(&self) -> Result<Vec<SourceRunConfig>, DatabaseError> {
        let sql =
            format!("SELECT {CONFIG_COLUMNS} FROM source_configs WHERE enabled = 1 ORDER BY source");
        sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    pub async fn set_enabled(&self, source: &str, enabled: bool) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE source_configs SET enabled = ? WHERE source = ?")
            .bind(enabled)
            .bind(source)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::UnknownSource(source.to_string()));
        }
        tracing::info!(source = %source, enabled, "Source enabled flag changed");
        Ok(())
    }

    pub async fn set_interval(&self, source: &str, minutes: i64) -> Result<(), DatabaseError> {
        if minutes < 1 {
            return Err(DatabaseError::InvalidArgument(format!(
                "interval must be at least 1 minute, got {minutes}"
            )));
        }
        let result = sqlx::query("UPDATE source_configs SET interval_minutes = ? WHERE source = ?")
            .bind(minutes)
            .bind(source)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::UnknownSource(source.to_string()));
        }
        tracing::info!(source = %source, minutes, "Source interval changed");
        Ok(())
    }

    /// Record a successful scheduled fetch at the current time.
    pub async fn touch_last_fetch(&self, source: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE source_configs SET last_fetch_at = ? WHERE source = ?")
            .bind(Utc::now().timestamp_millis())
            .bind(source)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::UnknownSource(source.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, DatabaseError};
    use pretty_assertions::assert_eq;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_initialize_skips_existing() {
        let db = Database::open(":memory:").await.unwrap();
        assert_eq!(db.initialize_configs(&names(&["b", "a"]), 30).await.unwrap(), 2);
        db.set_interval("a", 5).await.unwrap();

        assert_eq!(db.initialize_configs(&names(&["a", "b", "c"]), 30).await.unwrap(), 1);

        let configs = db.all_configs().await.unwrap();
        let sources: Vec<_> = configs.iter().map(|c| c.source.as_str()).collect();
        assert_eq!(sources, vec!["a", "b", "c"]);
        assert_eq!(configs[0].interval_minutes, 5);
        assert!(configs.iter().all(|c| c.enabled));
        assert!(configs.iter().all(|c| c.last_fetch_at.is_none()));
    }

    #[tokio::test]
    async fn test_enabled_configs_filters_disabled() {
        let db = Database::open(":memory:").await.unwrap();
        db.initialize_configs(&names(&["a", "b"]), 30).await.unwrap();
        db.set_enabled("a", false).await.unwrap();

        let enabled = db.enabled_configs().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].source, "b");
        assert!(!db.config("a").await.unwrap().unwrap().enabled);
    }

    #[tokio::test]
    async fn test_unknown_source_rejected() {
        let db = Database::open(":memory:").await.unwrap();
        assert!(matches!(
            db.set_enabled("ghost", true).await,
            Err(DatabaseError::UnknownSource(_))
        ));
        assert!(matches!(
            db.set_interval("ghost", 10).await,
            Err(DatabaseError::UnknownSource(_))
        ));
        assert!(db.config("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_interval_must_be_positive() {
        let db = Database::open(":memory:").await.unwrap();
        db.initialize_configs(&names(&["a"]), 30).await.unwrap();
        assert!(matches!(
            db.set_interval("a", 0).await,
            Err(DatabaseError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_touch_last_fetch() {
        let db = Database::open(":memory:").await.unwrap();
        db.initialize_configs(&names(&["a"]), 30).await.unwrap();
        db.touch_last_fetch("a").await.unwrap();
        assert!(db.config("a").await.unwrap().unwrap().last_fetch_at.is_some());
    }
}
