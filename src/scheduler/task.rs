use serde::Serialize;
use std::time::{Duration, Instant};

use crate::source::{AggregationService, ListOptions, ListResult, ServiceError};
use crate::storage::Database;

/// Job-level retry: bounded attempts with exponential backoff between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Delay after the given 1-based failed attempt: base, 2x base, 4x base...
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor)
    }
}

/// How one source fared in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    /// Fetched and persisted; `saved` counts genuinely new items.
    Saved { fetched: usize, saved: usize },
    /// Fetched, persistence skipped because the source is ignored.
    NotPersisted { fetched: usize },
    /// The source answered with no items.
    Empty,
    /// Every attempt produced a degraded result.
    Degraded { message: String },
    /// The unit could not run at all.
    Failed { error: String },
}

impl SourceOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            SourceOutcome::Saved { .. } | SourceOutcome::NotPersisted { .. } | SourceOutcome::Empty
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReport {
    pub source: String,
    pub attempts: u32,
    #[serde(flatten)]
    pub outcome: SourceOutcome,
}

/// Fetch with retry, then persist, then record the fetch time.
///
/// Only the fetch step is retried. A degraded result counts as a failed
/// attempt; persistence failures are left for the next run.
pub(crate) async fn run_source(
    service: &AggregationService,
    db: &Database,
    source: &str,
    persist: bool,
    policy: RetryPolicy,
) -> SourceReport {
    let start = Instant::now();
    let max_attempts = policy.max_attempts.max(1);

    let mut attempt = 0;
    let list = loop {
        attempt += 1;
        match fetch(service, source).await {
            Ok(list) => break list,
            Err(Fetch::Missing(error)) => {
                tracing::error!(source = %source, error = %error, "Source not registered");
                return SourceReport {
                    source: source.to_string(),
                    attempts: attempt,
                    outcome: SourceOutcome::Failed { error },
                };
            }
            Err(Fetch::Degraded(message)) if attempt < max_attempts => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    source = %source,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    message = %message,
                    "Fetch degraded, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(Fetch::Degraded(message)) => {
                tracing::warn!(source = %source, attempts = attempt, message = %message, "Fetch failed after retries");
                return SourceReport {
                    source: source.to_string(),
                    attempts: attempt,
                    outcome: SourceOutcome::Degraded { message },
                };
            }
        }
    };

    let fetched = list.items.len();
    let outcome = if fetched == 0 {
        tracing::warn!(source = %source, "No data received");
        SourceOutcome::Empty
    } else if !persist {
        tracing::info!(source = %source, fetched, "Fetched ignored source, not persisting");
        SourceOutcome::NotPersisted { fetched }
    } else {
        let saved = db.save_items(&list.items, source).await;
        if let Err(e) = db.touch_last_fetch(source).await {
            tracing::warn!(source = %source, error = %e, "Failed to record fetch time");
        }
        SourceOutcome::Saved { fetched, saved }
    };

    tracing::info!(
        source = %source,
        attempts = attempt,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Source run finished"
    );
    SourceReport {
        source: source.to_string(),
        attempts: attempt,
        outcome,
    }
}

enum Fetch {
    Missing(String),
    Degraded(String),
}

async fn fetch(service: &AggregationService, source: &str) -> Result<ListResult, Fetch> {
    // Scheduled runs exist to refresh state, so they always bypass the cache.
    match service.get_list(source, &ListOptions::new(), true).await {
        Ok(list) => match list.message {
            Some(message) => Err(Fetch::Degraded(message)),
            None => Ok(list),
        },
        Err(e @ ServiceError::NotFound(_)) => Err(Fetch::Missing(e.to_string())),
    }
}
