//! Built-in adapters.

mod hackernews;
mod v2ex;

pub use hackernews::HackerNews;
pub use v2ex::V2ex;

use std::sync::Arc;

use super::{RegistryError, SourceRegistry};
use crate::http::HttpClient;

/// Registry holding every built-in adapter over a shared client.
pub fn default_registry(client: Arc<HttpClient>) -> Result<SourceRegistry, RegistryError> {
    let mut registry = SourceRegistry::new();
    registry.register(HackerNews::descriptor(), Arc::new(HackerNews::new(Arc::clone(&client))))?;
    registry.register(V2ex::descriptor(), Arc::new(V2ex::new(client)))?;
    tracing::info!(count = registry.len(), "Source registry built");
    Ok(registry)
}
