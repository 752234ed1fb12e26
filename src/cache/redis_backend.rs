use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use secrecy::{ExposeSecret, SecretString};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{CacheBackend, CacheError};
use crate::config::RedisConfig;

/// Keys deleted per DEL command during a prefix sweep.
const DELETE_CHUNK: usize = 500;

/// Redis-backed cache over a lazily opened multiplexed connection.
///
/// The connection is opened on first use and dropped when a ping fails, so
/// a later ping (and with it [`super::CacheStore::reprobe`]) reconnects.
/// Every command is bounded by `op_timeout_ms`; a server that accepts
/// connections but never answers yields [`CacheError::Unavailable`].
pub struct RedisBackend {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    address: String,
    connect_timeout: Duration,
    op_timeout: Duration,
}

impl RedisBackend {
    /// Prepare a backend for `config`. No I/O happens until the first command.
    pub fn new(config: &RedisConfig) -> Result<Self, CacheError> {
        let password = config.password.clone().map(SecretString::from);
        let url = connection_url(&config.host, config.port, config.db, password.as_ref())?;
        let client = redis::Client::open(url.as_str())?;

        Ok(Self {
            client,
            conn: Mutex::new(None),
            address: format!("{}:{}", config.host, config.port),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms.max(1)),
            op_timeout: Duration::from_millis(config.op_timeout_ms.max(1)),
        })
    }

    /// The open connection, connecting first when there is none.
    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            CacheError::Unavailable(format!(
                "connect to {} timed out after {}ms",
                self.address,
                self.connect_timeout.as_millis()
            ))
        })??;

        tracing::debug!(address = %self.address, "Opened Redis connection");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        self.conn.lock().await.take();
    }

    /// Run one command under the operation deadline.
    async fn bounded<T, F>(&self, command: &str, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CacheError::Unavailable(format!(
                "{command} on {} timed out after {}ms",
                self.address,
                self.op_timeout.as_millis()
            ))),
        }
    }
}

fn connection_url(
    host: &str,
    port: u16,
    db: i64,
    password: Option<&SecretString>,
) -> Result<url::Url, CacheError> {
    let mut url = url::Url::parse(&format!("redis://{host}:{port}/{db}"))
        .map_err(|e| CacheError::Unavailable(format!("invalid redis address: {e}")))?;
    if let Some(password) = password {
        url.set_password(Some(password.expose_secret()))
            .map_err(|_| CacheError::Unavailable("cannot set redis password".into()))?;
    }
    Ok(url)
}

/// Escape glob metacharacters so a prefix matches literally in SCAN MATCH.
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = self.bounded("GET", conn.get(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        // SET key value EX ttl replaces the whole value in one command.
        let _: () = self
            .bounded("SETEX", conn.set_ex(key, value, ttl.as_secs().max(1)))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let _: () = self.bounded("DEL", conn.del(key)).await?;
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut scan_conn = self.connection().await?;
        let pattern = escape_glob(prefix);
        let keys: Vec<String> = self
            .bounded("SCAN", async move {
                let mut iter: redis::AsyncIter<'_, String> = scan_conn.scan_match(pattern).await?;
                let mut keys = Vec::new();
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                Ok::<_, redis::RedisError>(keys)
            })
            .await?;

        let mut conn = self.connection().await?;
        let mut removed = 0u64;
        for chunk in keys.chunks(DELETE_CHUNK) {
            let n: u64 = self.bounded("DEL", conn.del(chunk.to_vec())).await?;
            removed += n;
        }
        Ok(removed)
    }

    async fn ping(&self) -> bool {
        let reply: Result<String, CacheError> = match self.connection().await {
            Ok(mut conn) => {
                self.bounded("PING", redis::cmd("PING").query_async(&mut conn))
                    .await
            }
            Err(e) => Err(e),
        };
        match reply {
            Ok(pong) if pong == "PONG" => true,
            Ok(other) => {
                tracing::warn!(reply = %other, "Unexpected Redis ping reply");
                self.reset().await;
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis ping failed");
                self.reset().await;
                false
            }
        }
    }
}
