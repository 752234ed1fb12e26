use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::source::{NormalizedItem, Popularity};

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the write lock past the busy timeout
    #[error("Database is locked by another process. Please close it and try again.")]
    Locked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Admin operation on a source with no run config
    #[error("No configuration for source '{0}'")]
    UnknownSource(String),

    /// Rejected input on an admin operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Classify a sqlx error, separating lock contention from everything else
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
        {
            return DatabaseError::Locked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Items
// ============================================================================

/// A stored item: the normalized item plus its owning source and bookkeeping.
///
/// Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedItem {
    pub source: String,
    #[serde(flatten)]
    pub item: NormalizedItem,
    pub first_seen_at: i64,
    pub last_updated_at: i64,
}

/// Internal row type for `hot_items` queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemRow {
    pub source: String,
    pub item_id: String,
    pub title: String,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub author: Option<String>,
    pub popularity: Option<String>,
    pub timestamp_millis: i64,
    pub url: String,
    pub mobile_url: String,
    pub first_seen_at: i64,
    pub last_updated_at: i64,
}

/// Column list matching [`ItemRow`], for SELECT and RETURNING clauses.
pub(crate) const ITEM_COLUMNS: &str = "source, item_id, title, description, cover_url, author, \
     popularity, timestamp_millis, url, mobile_url, first_seen_at, last_updated_at";

impl ItemRow {
    pub(crate) fn into_item(self) -> PersistedItem {
        // Popularity is stored as its JSON encoding; an unreadable value is dropped.
        let popularity = self
            .popularity
            .and_then(|raw| serde_json::from_str::<Popularity>(&raw).ok());
        PersistedItem {
            source: self.source,
            item: NormalizedItem {
                id: self.item_id,
                title: self.title,
                description: self.description,
                cover_url: self.cover_url,
                author: self.author,
                popularity,
                timestamp_millis: Some(self.timestamp_millis),
                canonical_url: self.url,
                mobile_url: self.mobile_url,
            },
            first_seen_at: self.first_seen_at,
            last_updated_at: self.last_updated_at,
        }
    }
}

// ============================================================================
// Search
// ============================================================================

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortField {
    /// Item timestamp as reported by the source
    #[default]
    Timestamp,
    Title,
    /// When the item was first persisted
    FirstSeen,
}

impl SortField {
    pub(crate) fn column(self) -> &'static str {
        match self {
            SortField::Timestamp => "timestamp_millis",
            SortField::Title => "title",
            SortField::FirstSeen => "first_seen_at",
        }
    }
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "timestamp" => Ok(SortField::Timestamp),
            "title" => Ok(SortField::Title),
            "created_at" | "first_seen" => Ok(SortField::FirstSeen),
            other => Err(format!(
                "unknown sort field '{other}' (expected timestamp, title, created_at)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub(crate) fn keyword(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order '{other}' (expected asc, desc)")),
        }
    }
}

/// Historical search criteria. Time bounds are inclusive Unix milliseconds
/// on the item timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilter {
    pub source: Option<String>,
    /// Case-insensitive substring of title or description
    pub keyword: Option<String>,
    pub start_millis: Option<i64>,
    pub end_millis: Option<i64>,
    /// 1-based
    pub page: u32,
    pub limit: u32,
    pub sort: SortField,
    pub order: SortOrder,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self {
            source: None,
            keyword: None,
            start_millis: None,
            end_millis: None,
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
            sort: SortField::default(),
            order: SortOrder::default(),
        }
    }
}

impl SearchFilter {
    /// Page and limit clamped into their valid ranges.
    pub(crate) fn bounds(&self) -> (u32, u32) {
        (self.page.max(1), self.limit.clamp(1, MAX_PAGE_SIZE))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u32,
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    pub source: String,
    pub count: i64,
    pub latest_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_count: i64,
    pub total_sources: usize,
    /// Ordered by count, largest first
    pub sources: Vec<SourceStats>,
}

// ============================================================================
// Run configuration
// ============================================================================

/// Per-source scheduling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SourceRunConfig {
    pub source: String,
    pub enabled: bool,
    pub interval_minutes: i64,
    /// Unix milliseconds of the last successful scheduled fetch
    pub last_fetch_at: Option<i64>,
}
