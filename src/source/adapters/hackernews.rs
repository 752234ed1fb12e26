use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::http::{HttpClient, RequestOptions};
use crate::source::{
    ListOptions, NormalizedItem, Popularity, Source, SourceDescriptor, SourceError, SourceList,
};

const API_BASE: &str = "https://hacker-news.firebaseio.com/v0";
const DISCUSSION_BASE: &str = "https://news.ycombinator.com";
const TOP_STORIES: usize = 30;
/// Item lookups in flight at once.
const ITEM_WINDOW: usize = 10;

#[derive(Debug, Serialize, Deserialize)]
struct HnItem {
    id: u64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    score: Option<i64>,
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    by: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

/// Top stories from the official Hacker News API.
pub struct HackerNews {
    client: Arc<HttpClient>,
    base_url: String,
}

impl HackerNews {
    pub fn new(client: Arc<HttpClient>) -> Self {
        Self::with_base_url(client, API_BASE)
    }

    pub fn with_base_url(client: Arc<HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn descriptor() -> SourceDescriptor {
        SourceDescriptor::new("hackernews", "Hacker News", "Popular")
            .homepage("https://news.ycombinator.com/")
            .description("News about hacking and startups")
    }

    fn request(&self, path: &str, no_cache: bool) -> RequestOptions {
        RequestOptions::new(format!("{}/{path}", self.base_url))
            .header("Accept", "application/json")
            .no_cache(no_cache)
    }

    /// A single story, or `None` when it is missing, not a story, or fails.
    async fn fetch_story(&self, id: u64, no_cache: bool) -> Option<NormalizedItem> {
        let item = match self
            .client
            .get::<Option<HnItem>>(self.request(&format!("item/{id}.json"), no_cache))
            .await
        {
            Ok(resp) => resp.data?,
            Err(e) => {
                tracing::warn!(source = "hackernews", id, error = %e, "Failed to fetch item");
                return None;
            }
        };

        if item.kind.as_deref() != Some("story") {
            return None;
        }
        let title = item.title.filter(|t| !t.trim().is_empty())?;
        let url = item
            .url
            .unwrap_or_else(|| format!("{DISCUSSION_BASE}/item?id={}", item.id));

        let mut story = NormalizedItem::new(item.id.to_string(), title, url);
        story.popularity = Some(Popularity::Count(item.score.unwrap_or(0)));
        story.timestamp_millis = Some(
            item.time
                .and_then(|secs| secs.checked_mul(1000))
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
        );
        story.author = item.by;
        Some(story)
    }
}

#[async_trait]
impl Source for HackerNews {
    async fn fetch_list(
        &self,
        _options: &ListOptions,
        no_cache: bool,
    ) -> Result<SourceList, SourceError> {
        let top = self
            .client
            .get::<Vec<u64>>(self.request("topstories.json", no_cache))
            .await?;
        let ids: Vec<u64> = top.data.into_iter().take(TOP_STORIES).collect();

        let mut items = Vec::with_capacity(ids.len());
        for window in ids.chunks(ITEM_WINDOW) {
            let stories = join_all(window.iter().map(|&id| self.fetch_story(id, no_cache))).await;
            items.extend(stories.into_iter().flatten());
        }

        Ok(SourceList {
            items,
            from_cache: Some(top.from_cache),
            ..SourceList::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn adapter(server: &MockServer) -> HackerNews {
        let cache = CacheStore::in_memory(64, Duration::from_secs(60)).await;
        let client = HttpClient::new(reqwest::Client::new(), cache, Duration::from_secs(5), 0);
        HackerNews::with_base_url(Arc::new(client), server.uri())
    }

    #[tokio::test]
    async fn test_stories_normalized_and_failures_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/topstories.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2, 3, 4])))
            .mount(&server)
            .await;
        Mock::given(path("/item/1.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 1, "type": "story", "title": "Show HN: thing",
                "url": "https://thing.dev", "score": 120, "time": 1_700_000_000, "by": "pg"
            })))
            .mount(&server)
            .await;
        Mock::given(path("/item/2.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 2, "type": "story", "title": "Ask HN: no link"
            })))
            .mount(&server)
            .await;
        Mock::given(path("/item/3.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 3, "type": "comment"
            })))
            .mount(&server)
            .await;
        Mock::given(path("/item/4.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let list = adapter(&server)
            .await
            .fetch_list(&ListOptions::new(), true)
            .await
            .unwrap();

        assert_eq!(list.items.len(), 2);
        assert_eq!(list.from_cache, Some(false));

        let first = &list.items[0];
        assert_eq!(first.id, "1");
        assert_eq!(first.canonical_url, "https://thing.dev");
        assert_eq!(first.popularity, Some(Popularity::Count(120)));
        assert_eq!(first.timestamp_millis, Some(1_700_000_000_000));
        assert_eq!(first.author.as_deref(), Some("pg"));

        assert_eq!(
            list.items[1].canonical_url,
            "https://news.ycombinator.com/item?id=2"
        );
    }

    #[tokio::test]
    async fn test_out_of_range_time_falls_back_to_now() {
        let server = MockServer::start().await;
        Mock::given(path("/topstories.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([7])))
            .mount(&server)
            .await;
        Mock::given(path("/item/7.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 7, "type": "story", "title": "Far future", "time": i64::MAX
            })))
            .mount(&server)
            .await;

        let before = Utc::now().timestamp_millis();
        let list = adapter(&server)
            .await
            .fetch_list(&ListOptions::new(), false)
            .await
            .unwrap();

        let ts = list.items[0].timestamp_millis.unwrap();
        assert!(ts >= before && ts <= Utc::now().timestamp_millis());
    }

    #[tokio::test]
    async fn test_index_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(path("/topstories.json"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .await
            .fetch_list(&ListOptions::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Fetch(_)));
    }
}
