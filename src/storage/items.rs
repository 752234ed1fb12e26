use chrono::Utc;
use sqlx::QueryBuilder;
use std::collections::HashSet;

use super::schema::Database;
use super::types::{DatabaseError, ItemRow, PersistedItem, ITEM_COLUMNS};
use crate::source::NormalizedItem;

/// URLs bound per `IN (...)` lookup, well under SQLite's parameter limit.
const LOOKUP_CHUNK: usize = 500;

/// Trim text fields and reject items that cannot be stored.
///
/// An item needs a non-blank title and a non-blank URL. Blank optional
/// fields become `None`.
pub(crate) fn clean_item(mut item: NormalizedItem) -> Option<NormalizedItem> {
    item.title = item.title.trim().to_string();
    item.canonical_url = item.canonical_url.trim().to_string();
    if item.title.is_empty() || item.canonical_url.is_empty() {
        return None;
    }
    if item.mobile_url.trim().is_empty() {
        item.mobile_url = item.canonical_url.clone();
    }
    item.description = trim_optional(item.description);
    item.author = trim_optional(item.author);
    item.cover_url = trim_optional(item.cover_url);
    Some(item)
}

fn trim_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Lowercased title and description, matched by keyword search.
///
/// SQLite only folds ASCII case, so the text is folded here instead.
pub(crate) fn search_text(item: &NormalizedItem) -> String {
    let mut text = item.title.to_lowercase();
    if let Some(description) = &item.description {
        text.push('\n');
        text.push_str(&description.to_lowercase());
    }
    text
}

fn encode_popularity(item: &NormalizedItem) -> Option<String> {
    item.popularity
        .as_ref()
        .and_then(|p| serde_json::to_string(p).ok())
}

impl Database {
    // ========================================================================
    // Write path
    // ========================================================================

    /// Persist the genuinely new items of a batch, returning how many were
    /// inserted.
    ///
    /// Invalid items are dropped, URLs already stored for `source` are
    /// skipped, and each survivor is inserted with `ON CONFLICT DO NOTHING`,
    /// so re-running the same batch (or racing another writer) is safe.
    /// Never fails: a broken store logs and yields 0.
    pub async fn save_items(&self, items: &[NormalizedItem], source: &str) -> usize {
        let received = items.len();
        let mut seen = HashSet::new();
        let mut candidates = Vec::with_capacity(received);
        for item in items.iter().cloned() {
            match clean_item(item) {
                Some(item) if seen.insert(item.canonical_url.clone()) => candidates.push(item),
                Some(item) => {
                    tracing::debug!(source = %source, url = %item.canonical_url, "Duplicate URL within batch")
                }
                None => tracing::warn!(source = %source, "Dropping invalid item"),
            }
        }

        if candidates.is_empty() {
            tracing::info!(source = %source, received, saved = 0, "No valid items to save");
            return 0;
        }

        let urls: Vec<&str> = candidates.iter().map(|i| i.canonical_url.as_str()).collect();
        let existing = match self.find_existing(source, &urls).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::error!(source = %source, error = %e, "Failed to look up existing items");
                return 0;
            }
        };

        let now = Utc::now().timestamp_millis();
        let mut saved = 0;
        for item in candidates
            .iter()
            .filter(|item| !existing.contains(&item.canonical_url))
        {
            match self.insert_if_absent(item, source, now).await {
                Ok(true) => saved += 1,
                Ok(false) => {
                    tracing::debug!(source = %source, url = %item.canonical_url, "Item inserted concurrently")
                }
                Err(e) => {
                    tracing::warn!(source = %source, url = %item.canonical_url, error = %e, "Failed to save item")
                }
            }
        }

        tracing::info!(
            source = %source,
            received,
            existing = existing.len(),
            saved,
            "Saved items"
        );
        saved
    }

    async fn insert_if_absent(
        &self,
        item: &NormalizedItem,
        source: &str,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            INSERT INTO hot_items (source, item_id, title, description, cover_url, author,
                                   popularity, timestamp_millis, url, mobile_url,
                                   first_seen_at, last_updated_at, search_text)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source, url) DO NOTHING
        "#,
        )
        .bind(source)
        .bind(&item.id)
        .bind(&item.title)
        .bind(&item.description)
        .bind(&item.cover_url)
        .bind(&item.author)
        .bind(encode_popularity(item))
        .bind(item.timestamp_millis.unwrap_or(now))
        .bind(&item.canonical_url)
        .bind(&item.mobile_url)
        .bind(now)
        .bind(now)
        .bind(search_text(item))
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    /// Which of `urls` are already stored for `source`.
    pub async fn find_existing(
        &self,
        source: &str,
        urls: &[&str],
    ) -> Result<HashSet<String>, DatabaseError> {
        let mut existing = HashSet::new();
        for chunk in urls.chunks(LOOKUP_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("SELECT url FROM hot_items WHERE source = ");
            builder.push_bind(source);
            builder.push(" AND url IN (");
            let mut separated = builder.separated(", ");
            for url in chunk {
                separated.push_bind(*url);
            }
            separated.push_unseparated(")");

            let rows: Vec<(String,)> = builder
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            existing.extend(rows.into_iter().map(|(url,)| url));
        }
        Ok(existing)
    }

    /// Admin upsert: insert, or refresh the metadata of the stored item.
    ///
    /// `first_seen_at` of an existing row is preserved; `last_updated_at`
    /// is bumped.
    pub async fn upsert_item(
        &self,
        item: NormalizedItem,
        source: &str,
    ) -> Result<PersistedItem, DatabaseError> {
        let item = clean_item(item).ok_or_else(|| {
            DatabaseError::InvalidArgument("item needs a non-blank title and url".into())
        })?;
        let now = Utc::now().timestamp_millis();

        let sql = format!(
            r#"
            INSERT INTO hot_items (source, item_id, title, description, cover_url, author,
                                   popularity, timestamp_millis, url, mobile_url,
                                   first_seen_at, last_updated_at, search_text)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source, url) DO UPDATE SET
                item_id = excluded.item_id,
                title = excluded.title,
                description = excluded.description,
                cover_url = excluded.cover_url,
                author = excluded.author,
                popularity = excluded.popularity,
                timestamp_millis = excluded.timestamp_millis,
                mobile_url = excluded.mobile_url,
                last_updated_at = excluded.last_updated_at,
                search_text = excluded.search_text
            RETURNING {ITEM_COLUMNS}
        "#
        );

        let row: ItemRow = sqlx::query_as(&sql)
            .bind(source)
            .bind(&item.id)
            .bind(&item.title)
            .bind(&item.description)
            .bind(&item.cover_url)
            .bind(&item.author)
            .bind(encode_popularity(&item))
            .bind(item.timestamp_millis.unwrap_or(now))
            .bind(&item.canonical_url)
            .bind(&item.mobile_url)
            .bind(now)
            .bind(now)
            .bind(search_text(&item))
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(row.into_item())
    }
}
