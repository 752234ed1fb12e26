//! Key/value cache with TTL over a networked primary and an in-process fallback.
//!
//! [`CacheStore`] probes the primary backend (Redis) exactly once when it is
//! built. If the probe fails the store downgrades to the [`MemoryBackend`] for
//! the rest of the process lifetime; only an explicit [`CacheStore::reprobe`]
//! can promote it back. Callers never see which backend served them.
//!
//! The cache is strictly best-effort: `get` and `set` log backend failures and
//! return an empty result or do nothing. A cache outage costs latency, never
//! correctness.

mod memory;
mod redis_backend;

pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;

/// Errors raised by a cache backend. Never surfaced past [`CacheStore`].
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),
}

/// A raw string key/value backend with per-key TTL.
///
/// Each operation is an independent atomic key operation; no cross-key
/// transactions are offered or needed. Implementations bound every
/// operation in time, so an unresponsive backend surfaces as an error.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short label used in log lines (`redis`, `memory`).
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value` under `key`, replacing any previous value in one step.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Delete every key starting with `prefix`, returning how many were removed.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, CacheError>;

    async fn ping(&self) -> bool;
}

struct Inner {
    primary: Option<Arc<dyn CacheBackend>>,
    fallback: Arc<MemoryBackend>,
    degraded: AtomicBool,
    default_ttl: Duration,
}

/// Shared cache handle. Cloning is cheap.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl CacheStore {
    /// Build a store over `primary`, probing it once.
    ///
    /// With no primary, or when the probe fails, every operation goes to the
    /// in-process fallback.
    pub async fn new(
        primary: Option<Arc<dyn CacheBackend>>,
        fallback_capacity: usize,
        default_ttl: Duration,
    ) -> Self {
        let degraded = match &primary {
            Some(backend) => {
                if backend.ping().await {
                    tracing::info!(backend = backend.name(), "Cache backend reachable");
                    false
                } else {
                    tracing::warn!(
                        backend = backend.name(),
                        "Cache backend unreachable, downgraded to in-memory cache"
                    );
                    true
                }
            }
            None => {
                tracing::info!("No primary cache backend configured, using in-memory cache");
                true
            }
        };

        Self {
            inner: Arc::new(Inner {
                primary,
                fallback: Arc::new(MemoryBackend::new(fallback_capacity)),
                degraded: AtomicBool::new(degraded),
                default_ttl,
            }),
        }
    }

    /// Memory-only store, used by tests and by deployments without Redis.
    pub async fn in_memory(capacity: usize, default_ttl: Duration) -> Self {
        Self::new(None, capacity, default_ttl).await
    }

    /// Build the store described by `config`, probing Redis when enabled.
    ///
    /// An unreachable Redis is kept as the primary, so [`CacheStore::reprobe`]
    /// can reconnect once it comes back.
    pub async fn from_config(config: &Config) -> Self {
        let default_ttl = Duration::from_secs(config.cache_ttl_secs.max(1));
        let primary: Option<Arc<dyn CacheBackend>> = if config.redis.enabled {
            match RedisBackend::new(&config.redis) {
                Ok(backend) => Some(Arc::new(backend)),
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid Redis configuration");
                    None
                }
            }
        } else {
            None
        };
        Self::new(primary, config.memory_cache_capacity, default_ttl).await
    }

    /// True when operations are served by the in-process fallback.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Acquire)
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    fn active(&self) -> &dyn CacheBackend {
        match &self.inner.primary {
            Some(primary) if !self.is_degraded() => primary.as_ref(),
            _ => self.inner.fallback.as_ref(),
        }
    }

    /// Read and decode the value under `key`.
    ///
    /// Returns `None` on a miss, on a backend error, or when the stored value
    /// does not decode as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let backend = self.active();
        let raw = match backend.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::error!(key = %key, backend = backend.name(), error = %e, "Cache read failed");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                tracing::debug!(key = %key, backend = backend.name(), "Cache hit");
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cached value failed to decode, ignoring");
                None
            }
        }
    }

    /// Encode and store `value` under `key` for `ttl_secs` (or the default TTL).
    ///
    /// The value is fully serialized before the backend is touched. If the
    /// write fails the key is deleted so no stale or partial entry remains.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_secs: Option<u64>) {
        let ttl = ttl_secs
            .map(|s| Duration::from_secs(s.max(1)))
            .unwrap_or(self.inner.default_ttl);
        let backend = self.active();

        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Failed to encode cache entry");
                if let Err(e) = backend.delete(key).await {
                    tracing::debug!(key = %key, error = %e, "Cleanup after failed encode also failed");
                }
                return;
            }
        };

        match backend.set(key, &encoded, ttl).await {
            Ok(()) => {
                tracing::info!(key = %key, backend = backend.name(), ttl_secs = ttl.as_secs(), "Cached");
            }
            Err(e) => {
                tracing::error!(key = %key, backend = backend.name(), error = %e, "Cache write failed");
                if let Err(e) = backend.delete(key).await {
                    tracing::debug!(key = %key, error = %e, "Cleanup after failed write also failed");
                }
            }
        }
    }

    pub async fn delete(&self, key: &str) {
        let backend = self.active();
        match backend.delete(key).await {
            Ok(()) => tracing::debug!(key = %key, backend = backend.name(), "Deleted cache entry"),
            Err(e) => {
                tracing::error!(key = %key, backend = backend.name(), error = %e, "Cache delete failed")
            }
        }
    }

    /// Maintenance sweep: delete every key under `prefix`.
    ///
    /// Keys written concurrently with the scan may or may not be removed.
    pub async fn delete_by_prefix(&self, prefix: &str) -> u64 {
        let backend = self.active();
        match backend.delete_by_prefix(prefix).await {
            Ok(removed) => {
                tracing::info!(prefix = %prefix, removed, backend = backend.name(), "Deleted cache entries by prefix");
                removed
            }
            Err(e) => {
                tracing::error!(prefix = %prefix, error = %e, "Cache prefix delete failed");
                0
            }
        }
    }

    /// Liveness of the primary backend. `false` when none is configured.
    pub async fn ping(&self) -> bool {
        match &self.inner.primary {
            Some(primary) => primary.ping().await,
            None => false,
        }
    }

    /// Probe the primary again and promote it back if it answers.
    ///
    /// Returns whether the store is served by the primary afterwards.
    pub async fn reprobe(&self) -> bool {
        let Some(primary) = &self.inner.primary else {
            return false;
        };
        let alive = primary.ping().await;
        let was_degraded = self.inner.degraded.swap(!alive, Ordering::AcqRel);
        if alive && was_degraded {
            tracing::info!(backend = primary.name(), "Cache backend reachable again, promoted");
        } else if !alive && !was_degraded {
            tracing::warn!(backend = primary.name(), "Cache backend lost, downgraded to in-memory cache");
        }
        alive
    }
}
