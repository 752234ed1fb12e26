//! SQLite persistence: deduplicated item history and per-source run config.
//!
//! [`Database`] is split across files by concern: `schema` (open and
//! migrate), `items` (the write path), `search` (historical reads) and
//! `source_configs` (scheduler settings).

mod items;
mod schema;
mod search;
mod source_configs;
mod types;

pub use schema::Database;
pub use search::DEFAULT_LATEST;
pub use types::{
    DatabaseError, Page, PersistedItem, SearchFilter, SortField, SortOrder, SourceRunConfig,
    SourceStats, Stats, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
