use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

use super::{ListOptions, ListResult, Source, SourceDescriptor, SourceError, SourceRegistry};

/// The only error the read path surfaces.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Source '{0}' not found")]
    NotFound(String),
}

/// Resolves a source, runs its adapter and shapes the response.
///
/// Adapter failures never escape: they become a degraded [`ListResult`]
/// with an empty item list and a `message`.
#[derive(Clone)]
pub struct AggregationService {
    registry: Arc<SourceRegistry>,
}

impl AggregationService {
    pub fn new(registry: Arc<SourceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub async fn get_list(
        &self,
        name: &str,
        options: &ListOptions,
        no_cache: bool,
    ) -> Result<ListResult, ServiceError> {
        let (descriptor, adapter) = self
            .registry
            .resolve(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;

        match run_adapter(descriptor, adapter.as_ref(), options, no_cache).await {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::warn!(source = %name, error = %e, "Source failed, serving degraded result");
                Ok(ListResult::degraded(
                    descriptor,
                    format!("Failed to get data: {e}"),
                ))
            }
        }
    }
}

async fn run_adapter(
    descriptor: &SourceDescriptor,
    adapter: &dyn Source,
    options: &ListOptions,
    no_cache: bool,
) -> Result<ListResult, SourceError> {
    let mut list = adapter.fetch_list(options, no_cache).await?;

    if let Some(limit) = options.limit() {
        list.items.truncate(limit);
    }

    Ok(ListResult {
        name: descriptor.name.clone(),
        title: descriptor.title.clone(),
        category_label: Some(list.category.unwrap_or_else(|| descriptor.category.clone())),
        link: descriptor.homepage.clone(),
        description: descriptor.description.clone(),
        total: list.items.len(),
        items: list.items,
        served_from_cache: list.from_cache.unwrap_or(!no_cache),
        fetched_at: Utc::now(),
        selectable_params: (!list.params.is_empty()).then_some(list.params),
        message: None,
    })
}
