//! Source adapters, their registry, and the read path over them.
//!
//! - [`Source`] is the one contract every adapter implements
//! - [`SourceRegistry`] maps a name to its descriptor and adapter
//! - [`AggregationService`] runs an adapter and turns failures into
//!   degraded results
//!
//! Adapters are plain in-process code; [`adapters::default_registry`] wires
//! up the built-in ones.

pub mod adapters;
mod registry;
mod service;
mod types;

pub use registry::{RegistryError, SourceRegistry};
pub use service::{AggregationService, ServiceError};
pub use types::{
    ListOptions, ListResult, NormalizedItem, ParamChoices, Popularity, SourceDescriptor,
    SourceList,
};

use async_trait::async_trait;
use thiserror::Error;

use crate::http::FetchError;

/// Why an adapter could not produce a list.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Unexpected payload: {0}")]
    Parse(String),
    #[error("Invalid option '{name}': {message}")]
    InvalidOption { name: String, message: String },
}

/// One site's fetch-and-normalize logic.
///
/// `options` carries adapter-specific parameters; unknown keys are ignored.
/// With `no_cache` set the adapter must bypass any cached response.
#[async_trait]
pub trait Source: Send + Sync {
    async fn fetch_list(
        &self,
        options: &ListOptions,
        no_cache: bool,
    ) -> Result<SourceList, SourceError>;
}
