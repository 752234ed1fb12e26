use anyhow::{Context, Result};
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::http::HttpClient;
use crate::scheduler::Scheduler;
use crate::source::{adapters, AggregationService, SourceRegistry};
use crate::storage::Database;

// ============================================================================
// Application wiring
// ============================================================================

/// Every long-lived component, built once from a [`Config`].
pub struct App {
    pub config: Config,
    pub cache: CacheStore,
    pub service: AggregationService,
    pub db: Database,
    pub scheduler: Scheduler,
}

impl App {
    /// Connect the cache, build the built-in registry and open the database.
    pub async fn build(config: Config) -> Result<Self> {
        let cache = CacheStore::from_config(&config).await;
        let client = HttpClient::from_config(&config, cache.clone())
            .context("Failed to build HTTP client")?;
        let registry = adapters::default_registry(Arc::new(client))
            .context("Failed to register sources")?;
        Self::with_registry(config, cache, registry).await
    }

    /// Wire the app around a caller-supplied registry.
    pub async fn with_registry(
        config: Config,
        cache: CacheStore,
        registry: SourceRegistry,
    ) -> Result<Self> {
        let db = Database::open(&config.database_path)
            .await
            .with_context(|| format!("Failed to open database '{}'", config.database_path))?;
        let service = AggregationService::new(Arc::new(registry));
        let scheduler = Scheduler::new(service.clone(), db.clone(), &config.scheduler);

        Ok(Self {
            config,
            cache,
            service,
            db,
            scheduler,
        })
    }

    /// Ensure every registered source has a run config.
    pub async fn initialize_configs(&self) -> Result<usize> {
        self.scheduler
            .initialize_configs(i64::from(self.config.default_interval_minutes))
            .await
            .context("Failed to initialize source configs")
    }
}
