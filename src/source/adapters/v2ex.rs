use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::http::{HttpClient, RequestOptions};
use crate::source::{
    ListOptions, NormalizedItem, ParamChoices, Popularity, Source, SourceDescriptor, SourceError,
    SourceList,
};

const API_BASE: &str = "https://www.v2ex.com";
const CATEGORY: &str = "Topics";
const KINDS: &[(&str, &str)] = &[("hot", "Hottest topics"), ("latest", "Latest topics")];

#[derive(Debug, Serialize, Deserialize)]
struct Member {
    username: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Topic {
    id: u64,
    title: String,
    url: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    replies: Option<i64>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    member: Option<Member>,
}

/// V2EX topic lists. Reads `type`: `hot` (default) or `latest`.
pub struct V2ex {
    client: Arc<HttpClient>,
    base_url: String,
}

impl V2ex {
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
        SourceDescriptor::new("v2ex", "V2EX", CATEGORY).homepage("https://www.v2ex.com/")
    }
}

#[async_trait]
impl Source for V2ex {
    async fn fetch_list(
        &self,
        options: &ListOptions,
        no_cache: bool,
    ) -> Result<SourceList, SourceError> {
        let kind = options.kind().unwrap_or("hot");
        if !KINDS.iter().any(|(k, _)| *k == kind) {
            return Err(SourceError::InvalidOption {
                name: "type".into(),
                message: format!("expected one of hot, latest; got '{kind}'"),
            });
        }

        // The list kind is part of the path, so each kind has its own cache entry.
        let url = format!("{}/api/topics/{kind}.json", self.base_url);
        let resp = self
            .client
            .get::<Vec<Topic>>(RequestOptions::new(url).no_cache(no_cache))
            .await?;

        let items = resp
            .data
            .into_iter()
            .map(|topic| {
                let mut item = NormalizedItem::new(topic.id.to_string(), topic.title, topic.url);
                item.description = topic.content.filter(|c| !c.is_empty());
                item.author = topic.member.map(|m| m.username);
                item.popularity = topic.replies.map(Popularity::Count);
                item.timestamp_millis = topic.created.and_then(|secs| secs.checked_mul(1000));
                item
            })
            .collect();

        let mut params = BTreeMap::new();
        params.insert("type".to_string(), ParamChoices::new("List", KINDS.iter().copied()));

        Ok(SourceList {
            items,
            category: Some(CATEGORY.to_string()),
            from_cache: Some(resp.from_cache),
            params,
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

    async fn adapter(server: &MockServer) -> V2ex {
        let cache = CacheStore::in_memory(64, Duration::from_secs(60)).await;
        let client = HttpClient::new(reqwest::Client::new(), cache, Duration::from_secs(5), 0);
        V2ex::with_base_url(Arc::new(client), server.uri())
    }

    fn topics() -> serde_json::Value {
        json!([{
            "id": 101,
            "title": "Rust or Go?",
            "url": "https://www.v2ex.com/t/101",
            "content": "discuss",
            "replies": 88,
            "created": 1_700_000_000,
            "member": {"username": "alice"}
        }])
    }

    #[tokio::test]
    async fn test_latest_kind_hits_its_own_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/topics/latest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(topics()))
            .expect(1)
            .mount(&server)
            .await;

        let list = adapter(&server)
            .await
            .fetch_list(&ListOptions::new().with("type", "latest"), false)
            .await
            .unwrap();

        assert_eq!(list.items.len(), 1);
        let item = &list.items[0];
        assert_eq!(item.id, "101");
        assert_eq!(item.author.as_deref(), Some("alice"));
        assert_eq!(item.popularity, Some(Popularity::Count(88)));
        assert_eq!(item.mobile_url, item.canonical_url);
        assert!(list.params["type"].values.contains_key("hot"));
    }

    #[tokio::test]
    async fn test_defaults_to_hot() {
        let server = MockServer::start().await;
        Mock::given(path("/api/topics/hot.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(topics()))
            .expect(1)
            .mount(&server)
            .await;

        let list = adapter(&server)
            .await
            .fetch_list(&ListOptions::new(), false)
            .await
            .unwrap();
        assert_eq!(list.category.as_deref(), Some(CATEGORY));
    }

    #[tokio::test]
    async fn test_out_of_range_created_is_dropped() {
        let server = MockServer::start().await;
        Mock::given(path("/api/topics/hot.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": 5, "title": "Hostile", "url": "https://www.v2ex.com/t/5",
                "created": i64::MAX
            }])))
            .mount(&server)
            .await;

        let list = adapter(&server)
            .await
            .fetch_list(&ListOptions::new(), false)
            .await
            .unwrap();
        assert_eq!(list.items[0].timestamp_millis, None);
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = adapter(&server)
            .await
            .fetch_list(&ListOptions::new().with("type", "weekly"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::InvalidOption { .. }));
    }
}
