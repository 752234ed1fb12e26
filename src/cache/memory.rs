use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::{CacheBackend, CacheError};

const MIN_CAPACITY: NonZeroUsize = match NonZeroUsize::new(16) {
    Some(n) => n,
    None => unreachable!(),
};

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// Process-local LRU cache with per-entry expiry.
///
/// Expired entries are dropped lazily when read. The LRU bound keeps memory
/// flat when the fallback has to absorb everything the primary would hold.
pub struct MemoryBackend {
    entries: Mutex<LruCache<String, MemoryEntry>>,
}

impl MemoryBackend {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(MIN_CAPACITY);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<String, MemoryEntry>>, CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable("memory cache lock poisoned".into()))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.lock()?;
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let entry = MemoryEntry {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        };
        self.lock()?.put(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.lock()?.pop(key);
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut entries = self.lock()?;
        let keys: Vec<String> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            entries.pop(key);
        }
        Ok(keys.len() as u64)
    }

    async fn ping(&self) -> bool {
        true
    }
}
