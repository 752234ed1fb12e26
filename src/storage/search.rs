use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{
    DatabaseError, ItemRow, Page, PersistedItem, SearchFilter, SourceStats, Stats, ITEM_COLUMNS,
};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of items returned by `latest` and `items_in_range` (OOM protection)
const MAX_ITEMS: usize = 1000;

pub const DEFAULT_LATEST: usize = 50;

/// Escape LIKE wildcards so the keyword matches literally.
fn like_pattern(keyword: &str) -> String {
    let mut out = String::with_capacity(keyword.len() + 2);
    out.push('%');
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

fn push_filters<'a>(builder: &mut QueryBuilder<'a, sqlx::Sqlite>, filter: &'a SearchFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(source) = &filter.source {
        builder.push(" AND source = ").push_bind(source);
    }
    if let Some(keyword) = filter.keyword.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
        let pattern = like_pattern(&keyword.to_lowercase());
        builder
            .push(" AND search_text LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\'");
    }
    if let Some(start) = filter.start_millis {
        builder.push(" AND timestamp_millis >= ").push_bind(start);
    }
    if let Some(end) = filter.end_millis {
        builder.push(" AND timestamp_millis <= ").push_bind(end);
    }
}

impl Database {
    // ========================================================================
    // Historical queries
    // ========================================================================

    /// Paged search over persisted items.
    pub async fn search(&self, filter: &SearchFilter) -> Result<Page<PersistedItem>, DatabaseError> {
        let (page, limit) = filter.bounds();

        let mut count_builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM hot_items");
        push_filters(&mut count_builder, filter);
        let (total,): (i64,) = count_builder
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {ITEM_COLUMNS} FROM hot_items"));
        push_filters(&mut builder, filter);
        builder.push(format!(
            " ORDER BY {} {}, id {}",
            filter.sort.column(),
            filter.order.keyword(),
            filter.order.keyword()
        ));
        builder
            .push(" LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(i64::from(page - 1) * i64::from(limit));

        let rows: Vec<ItemRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let per_page = i64::from(limit);
        let total_pages = u32::try_from((total + per_page - 1) / per_page).unwrap_or(u32::MAX);
        Ok(Page {
            items: rows.into_iter().map(ItemRow::into_item).collect(),
            total,
            page,
            limit,
            total_pages,
        })
    }

    /// Items of `source` with a timestamp in `[start, end]`, newest first.
    pub async fn items_in_range(
        &self,
        source: &str,
        start_millis: i64,
        end_millis: i64,
    ) -> Result<Vec<PersistedItem>, DatabaseError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM hot_items \
             WHERE source = ? AND timestamp_millis BETWEEN ? AND ? \
             ORDER BY timestamp_millis DESC, id DESC LIMIT ?"
        );
        let rows: Vec<ItemRow> = sqlx::query_as(&sql)
            .bind(source)
            .bind(start_millis)
            .bind(end_millis)
            .bind(MAX_ITEMS as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(rows.into_iter().map(ItemRow::into_item).collect())
    }

    /// Most recently timestamped items, optionally for one source.
    pub async fn latest(
        &self,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PersistedItem>, DatabaseError> {
        let limit = limit.clamp(1, MAX_ITEMS) as i64;
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {ITEM_COLUMNS} FROM hot_items"));
        if let Some(source) = source {
            builder.push(" WHERE source = ").push_bind(source);
        }
        builder
            .push(" ORDER BY timestamp_millis DESC, id DESC LIMIT ")
            .push_bind(limit);

        let rows: Vec<ItemRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(rows.into_iter().map(ItemRow::into_item).collect())
    }

    /// Sources with at least one persisted item, sorted.
    pub async fn list_sources(&self) -> Result<Vec<String>, DatabaseError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT source FROM hot_items ORDER BY source")
                .fetch_all(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    pub async fn stats(&self) -> Result<Stats, DatabaseError> {
        let sources: Vec<SourceStats> = sqlx::query_as(
            r#"
            SELECT source, COUNT(*) AS count, MAX(timestamp_millis) AS latest_timestamp
            FROM hot_items
            GROUP BY source
            ORDER BY count DESC, source ASC
        "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(Stats {
            total_count: sources.iter().map(|s| s.count).sum(),
            total_sources: sources.len(),
            sources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::like_pattern;
    use crate::source::NormalizedItem;
    use crate::storage::{Database, SearchFilter, SortField, SortOrder};
    use pretty_assertions::assert_eq;

    fn stamped(n: i64, title: &str, ts: i64) -> NormalizedItem {
        let mut item = NormalizedItem::new(n.to_string(), title, format!("http://x/{n}"));
        item.timestamp_millis = Some(ts);
        item
    }

    async fn seeded() -> Database {
        let db = Database::open(":memory:").await.unwrap();
        let mut rust = stamped(3, "Rust 2.0 released", 3_000);
        rust.description = Some("Big news for rustaceans".into());
        db.save_items(
            &[
                stamped(1, "Alpha", 1_000),
                stamped(2, "Beta 50% off", 2_000),
                rust,
            ],
            "hn",
        )
        .await;
        db.save_items(&[stamped(10, "Gamma", 5_000)], "v2ex").await;
        db
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%"), "%50\\%%");
        assert_eq!(like_pattern("a_b"), "%a\\_b%");
    }

    #[tokio::test]
    async fn test_search_defaults_newest_first() {
        let db = seeded().await;
        let page = db.search(&SearchFilter::default()).await.unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.total_pages, 1);
        let titles: Vec<_> = page.items.iter().map(|i| i.item.title.as_str()).collect();
        assert_eq!(titles, vec!["Gamma", "Rust 2.0 released", "Beta 50% off", "Alpha"]);
    }

    #[tokio::test]
    async fn test_search_keyword_matches_description_case_insensitive() {
        let db = seeded().await;
        let filter = SearchFilter {
            keyword: Some("RUSTACEANS".into()),
            ..SearchFilter::default()
        };
        let page = db.search(&filter).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].item.id, "3");
    }

    #[tokio::test]
    async fn test_search_percent_is_literal() {
        let db = seeded().await;
        let filter = SearchFilter {
            keyword: Some("%".into()),
            ..SearchFilter::default()
        };
        assert_eq!(db.search(&filter).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_search_keyword_folds_non_ascii_case() {
        let db = Database::open(":memory:").await.unwrap();
        db.save_items(&[stamped(1, "Ärger im Büro", 1_000)], "zhihu").await;

        for keyword in ["ärger", "BÜRO", "Ärger Im"] {
            let filter = SearchFilter {
                keyword: Some(keyword.into()),
                ..SearchFilter::default()
            };
            assert_eq!(db.search(&filter).await.unwrap().total, 1, "{keyword}");
        }
    }

    #[tokio::test]
    async fn test_upsert_refreshes_search_text() {
        let db = Database::open(":memory:").await.unwrap();
        db.save_items(&[stamped(1, "Old title", 1_000)], "zhihu").await;
        db.upsert_item(stamped(1, "Ωmega news", 1_000), "zhihu")
            .await
            .unwrap();

        let filter = |keyword: &str| SearchFilter {
            keyword: Some(keyword.into()),
            ..SearchFilter::default()
        };
        assert_eq!(db.search(&filter("ωMEGA")).await.unwrap().total, 1);
        assert_eq!(db.search(&filter("old")).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_search_source_range_and_paging() {
        let db = seeded().await;
        let filter = SearchFilter {
            source: Some("hn".into()),
            start_millis: Some(1_500),
            end_millis: Some(3_000),
            page: 2,
            limit: 1,
            sort: SortField::Title,
            order: SortOrder::Asc,
            ..SearchFilter::default()
        };
        let page = db.search(&filter).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].item.title, "Rust 2.0 released");
    }

    #[tokio::test]
    async fn test_items_in_range() {
        let db = seeded().await;
        let items = db.items_in_range("hn", 0, 2_000).await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.item.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);
    }

    #[tokio::test]
    async fn test_latest_limits_and_filters() {
        let db = seeded().await;
        assert_eq!(db.latest(None, 2).await.unwrap().len(), 2);
        let hn = db.latest(Some("hn"), 50).await.unwrap();
        assert_eq!(hn.len(), 3);
        assert_eq!(hn[0].item.id, "3");
    }

    #[tokio::test]
    async fn test_list_sources_and_stats() {
        let db = seeded().await;
        assert_eq!(db.list_sources().await.unwrap(), vec!["hn", "v2ex"]);

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.total_count, 4);
        assert_eq!(stats.total_sources, 2);
        assert_eq!(stats.sources[0].source, "hn");
        assert_eq!(stats.sources[0].count, 3);
        assert_eq!(stats.sources[0].latest_timestamp, Some(3_000));
    }

    #[tokio::test]
    async fn test_stats_on_empty_store() {
        let db = Database::open(":memory:").await.unwrap();
        let stats = db.stats().await.unwrap();
        assert_eq!(stats.total_count, 0);
        assert!(stats.sources.is_empty());
    }
}
