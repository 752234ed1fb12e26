//! Trending-list aggregator.
//!
//! Sources are fetched through a caching HTTP client, served on demand by
//! the [`source::AggregationService`], and periodically persisted by the
//! [`scheduler::Scheduler`] into a deduplicating [`storage::Database`].

pub mod app;
pub mod cache;
pub mod config;
pub mod http;
pub mod scheduler;
pub mod source;
pub mod storage;
