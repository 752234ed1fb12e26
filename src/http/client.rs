use crate::cache::CacheStore;
use crate::config::Config;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Browser-like agents sent when the caller does not set `User-Agent`.
/// Only meant to get past trivial bot filters.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

/// Errors that can occur during an outbound request.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The per-request deadline expired.
    #[error("Request to {url} timed out")]
    Timeout { url: String },
    /// No response: DNS, connection, TLS, or a broken body stream.
    #[error("Network error for {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    /// The remote answered with a non-2xx status.
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("Response from {url} exceeds {MAX_RESPONSE_SIZE} bytes")]
    ResponseTooLarge { url: String },
    #[error("Invalid URL: {url}")]
    InvalidUrl { url: String },
    #[error("Failed to encode request body for {url}: {message}")]
    Encode { url: String, message: String },
    #[error("Failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    /// Transient failures worth another immediate attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Network { .. } => true,
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            FetchError::ResponseTooLarge { .. }
            | FetchError::InvalidUrl { .. }
            | FetchError::Encode { .. }
            | FetchError::Decode { .. } => false,
        }
    }

    /// Remote status code, for [`FetchError::Status`].
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A payload plus where it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse<T> {
    pub data: T,
    pub from_cache: bool,
    /// When the payload was fetched from the network (the original time on cache hits).
    pub fetched_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct CacheEntry<T> {
    payload: T,
    cached_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct CacheEntryRef<'a, T> {
    payload: &'a T,
    cached_at: DateTime<Utc>,
}

/// Cache key for a request target.
///
/// Query parameters passed through [`RequestOptions::query`] are not part of
/// the key: two requests to one base URL with different parameters share an
/// entry. Adapters that need distinct entries fold the parameters into `url`.
pub fn cache_key(url: &str) -> String {
    format!("http:{url}")
}

/// Per-request options. Unset fields fall back to the client defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Evict any cached entry and always go to the network.
    pub no_cache: bool,
    pub ttl_secs: Option<u64>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl RequestOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    pub fn ttl_secs(mut self, ttl: u64) -> Self {
        self.ttl_secs = Some(ttl);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Caching HTTP client shared by every source adapter.
pub struct HttpClient {
    client: reqwest::Client,
    cache: CacheStore,
    timeout: Duration,
    retries: u32,
    agent_cursor: AtomicUsize,
}

impl HttpClient {
    pub fn new(client: reqwest::Client, cache: CacheStore, timeout: Duration, retries: u32) -> Self {
        Self {
            client,
            cache,
            timeout,
            retries,
            agent_cursor: AtomicUsize::new(0),
        }
    }

    /// Build a client with the timeout and retry defaults from `config`.
    pub fn from_config(config: &Config, cache: CacheStore) -> Result<Self, reqwest::Error> {
        let timeout = Duration::from_millis(config.request_timeout_ms.max(1));
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self::new(client, cache, timeout, config.request_retries))
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// GET and decode a JSON payload.
    pub async fn get<T>(&self, options: RequestOptions) -> Result<FetchResponse<T>, FetchError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.request(Method::GET, options, decode_json).await
    }

    /// GET a text payload (HTML, XML) without decoding.
    pub async fn get_text(
        &self,
        options: RequestOptions,
    ) -> Result<FetchResponse<String>, FetchError> {
        self.request(Method::GET, options, |_, body| Ok(body)).await
    }

    /// POST `options.body` as JSON and decode a JSON payload.
    pub async fn post<T>(&self, options: RequestOptions) -> Result<FetchResponse<T>, FetchError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.request(Method::POST, options, decode_json).await
    }

    async fn request<T, D>(
        &self,
        method: Method,
        options: RequestOptions,
        decode: D,
    ) -> Result<FetchResponse<T>, FetchError>
    where
        T: Serialize + DeserializeOwned,
        D: Fn(&str, String) -> Result<T, FetchError>,
    {
        let key = cache_key(&options.url);

        if options.no_cache {
            tracing::debug!(key = %key, "Cache bypass requested, evicting entry");
            self.cache.delete(&key).await;
        } else if let Some(entry) = self.cache.get::<CacheEntry<T>>(&key).await {
            tracing::debug!(key = %key, "Serving cached response");
            return Ok(FetchResponse {
                data: entry.payload,
                from_cache: true,
                fetched_at: entry.cached_at,
            });
        }

        let body = match self.send_with_retries(&method, &options).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(url = %options.url, method = %method, error = %e, "Request failed");
                return Err(e);
            }
        };
        let data = decode(&options.url, body)?;
        let fetched_at = Utc::now();

        self.cache
            .set(
                &key,
                &CacheEntryRef {
                    payload: &data,
                    cached_at: fetched_at,
                },
                options.ttl_secs,
            )
            .await;
        tracing::debug!(url = %options.url, method = %method, "Fetched fresh data");

        Ok(FetchResponse {
            data,
            from_cache: false,
            fetched_at,
        })
    }

    /// Simple retry loop: transient failures are retried immediately up to
    /// `retries` times. Job-level backoff belongs to the scheduler.
    async fn send_with_retries(
        &self,
        method: &Method,
        options: &RequestOptions,
    ) -> Result<String, FetchError> {
        let retries = options.retries.unwrap_or(self.retries);
        let mut attempt = 0u32;

        loop {
            match self.send_once(method, options).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() && attempt < retries => {
                    attempt += 1;
                    tracing::debug!(
                        url = %options.url,
                        error = %e,
                        retry = attempt,
                        "Retrying request after transient error"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        options: &RequestOptions,
    ) -> Result<String, FetchError> {
        let target = options.url.as_str();
        let url = build_url(target, &options.query)?;

        let mut request = self.client.request(method.clone(), url);
        let mut has_agent = false;
        for (name, value) in &options.headers {
            if name.eq_ignore_ascii_case("user-agent") {
                has_agent = true;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        if !has_agent {
            request = request.header(USER_AGENT, self.next_user_agent());
        }
        if let Some(body) = &options.body {
            let bytes = serde_json::to_vec(body).map_err(|e| FetchError::Encode {
                url: target.to_string(),
                message: e.to_string(),
            })?;
            request = request.header(CONTENT_TYPE, "application/json").body(bytes);
        }

        let timeout = options.timeout.unwrap_or(self.timeout);
        let attempt = async {
            let response = request.send().await.map_err(|e| classify(target, e))?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: target.to_string(),
                    status: status.as_u16(),
                });
            }
            read_limited_text(target, response, MAX_RESPONSE_SIZE).await
        };

        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| FetchError::Timeout {
                url: target.to_string(),
            })?
    }

    fn next_user_agent(&self) -> &'static str {
        let i = self.agent_cursor.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[i % USER_AGENTS.len()]
    }
}

fn decode_json<T: DeserializeOwned>(url: &str, body: String) -> Result<T, FetchError> {
    serde_json::from_str(&body).map_err(|e| FetchError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}

fn build_url(target: &str, query: &[(String, String)]) -> Result<url::Url, FetchError> {
    let parsed = if query.is_empty() {
        url::Url::parse(target)
    } else {
        url::Url::parse_with_params(target, query)
    };
    parsed.map_err(|_| FetchError::InvalidUrl {
        url: target.to_string(),
    })
}

fn classify(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Network {
            url: url.to_string(),
            source: err,
        }
    }
}

async fn read_limited_text(
    url: &str,
    response: reqwest::Response,
    limit: usize,
) -> Result<String, FetchError> {
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge {
                url: url.to_string(),
            });
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| classify(url, e))?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge {
                url: url.to_string(),
            });
        }
        bytes.extend_from_slice(&chunk);
    }

    String::from_utf8(bytes).map_err(|e| FetchError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_client() -> HttpClient {
        let cache = CacheStore::in_memory(64, Duration::from_secs(60)).await;
        HttpClient::new(reqwest::Client::new(), cache, Duration::from_secs(5), 2)
    }

    #[tokio::test]
    async fn test_second_get_is_served_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2, 3])))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client().await;
        let url = format!("{}/list", server.uri());

        let first: FetchResponse<Vec<u32>> = client.get(RequestOptions::new(&url)).await.unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.data, vec![1, 2, 3]);

        let second: FetchResponse<Vec<u32>> = client.get(RequestOptions::new(&url)).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.data, vec![1, 2, 3]);
        assert_eq!(second.fetched_at, first.fetched_at);
    }

    #[tokio::test]
    async fn test_no_cache_evicts_and_hits_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": 1})))
            .expect(2)
            .mount(&server)
            .await;

        let client = test_client().await;
        let url = format!("{}/item", server.uri());

        let _: FetchResponse<serde_json::Value> =
            client.get(RequestOptions::new(&url)).await.unwrap();
        let fresh: FetchResponse<serde_json::Value> = client
            .get(RequestOptions::new(&url).no_cache(true))
            .await
            .unwrap();
        assert!(!fresh.from_cache);
    }

    #[tokio::test]
    async fn test_no_cache_evicts_before_failing_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = test_client().await;
        let url = format!("{}/gone", server.uri());
        let key = cache_key(&url);
        client
            .cache()
            .set(&key, &json!({"payload": [1], "cached_at": Utc::now()}), None)
            .await;

        let result: Result<FetchResponse<Vec<u32>>, _> = client
            .get(RequestOptions::new(&url).no_cache(true))
            .await;
        assert!(result.is_err());
        assert!(client.cache().get::<serde_json::Value>(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_404_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client().await;
        let err = client
            .get::<serde_json::Value>(RequestOptions::new(server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_500_retries_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3) // Initial request + 2 retries
            .mount(&server)
            .await;

        let client = test_client().await;
        let err = client
            .get::<serde_json::Value>(RequestOptions::new(server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_503_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!("ok")))
            .mount(&server)
            .await;

        let client = test_client().await;
        let resp: FetchResponse<String> = client.get(RequestOptions::new(server.uri())).await.unwrap();
        assert_eq!(resp.data, "ok");
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!("late"))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client = test_client().await;
        let err = client
            .get::<String>(
                RequestOptions::new(server.uri())
                    .timeout(Duration::from_millis(100))
                    .retries(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_invalid_json_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client().await;
        let err = client
            .get::<Vec<u32>>(RequestOptions::new(server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_default_user_agent_attached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists("user-agent"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client().await;
        let resp = client.get_text(RequestOptions::new(server.uri())).await.unwrap();
        assert_eq!(resp.data, "hello");
    }

    #[tokio::test]
    async fn test_caller_user_agent_preserved() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("user-agent", "hotlist-test/1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client().await;
        client
            .get_text(RequestOptions::new(server.uri()).header("User-Agent", "hotlist-test/1.0"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_post_sends_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({"page": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client().await;
        let resp: FetchResponse<serde_json::Value> = client
            .post(RequestOptions::new(server.uri()).body(json!({"page": 1})))
            .await
            .unwrap();
        assert_eq!(resp.data["ok"], json!(true));
    }

    #[tokio::test]
    async fn test_query_params_share_one_cache_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!("first")))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client().await;
        let base = format!("{}/topics", server.uri());
        let a: FetchResponse<String> = client
            .get(RequestOptions::new(&base).query("type", "hot"))
            .await
            .unwrap();
        let b: FetchResponse<String> = client
            .get(RequestOptions::new(&base).query("type", "latest"))
            .await
            .unwrap();
        assert!(!a.from_cache);
        assert!(b.from_cache);
        assert_eq!(b.data, "first");
    }

    #[test]
    fn test_retryable_classification() {
        let status = |status| FetchError::Status {
            url: "u".into(),
            status,
        };
        assert!(status(500).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(FetchError::Timeout { url: "u".into() }.is_retryable());
        assert!(!FetchError::InvalidUrl { url: "u".into() }.is_retryable());
    }

    #[test]
    fn test_user_agent_rotates() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let client = rt.block_on(test_client());
        let first = client.next_user_agent();
        let second = client.next_user_agent();
        assert_ne!(first, second);
    }
}
