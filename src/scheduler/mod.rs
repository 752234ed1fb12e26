//! Periodic fetch-and-persist over every enabled source.
//!
//! The [`Scheduler`] owns one cron timer. Each tick lists the enabled run
//! configs, drops ignored sources, and processes the rest in fixed-size
//! concurrent windows with a pause between windows. A tick that arrives
//! while a batch is still running is skipped, never queued.
//!
//! States: stopped (no timer) -> armed (timer registered) -> running (batch
//! in flight) -> armed. `stop` only prevents future ticks; a batch already
//! running completes.

mod task;

pub use task::{RetryPolicy, SourceOutcome, SourceReport};

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::source::AggregationService;
use crate::storage::{Database, DatabaseError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },
    #[error("Timer error: {0}")]
    Timer(String),
    #[error("Source '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] DatabaseError),
}

/// Snapshot for the operator surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub enabled: bool,
    pub timer_registered: bool,
    pub cron_expression: String,
    pub ignored_sources: Vec<String>,
}

/// Aggregate result of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub succeeded: usize,
    pub degraded: usize,
    pub failed: usize,
    /// New items persisted across all sources
    pub saved: usize,
    pub sources: Vec<SourceReport>,
}

impl BatchReport {
    fn record(&mut self, report: SourceReport) {
        match &report.outcome {
            SourceOutcome::Saved { saved, .. } => {
                self.succeeded += 1;
                self.saved += saved;
            }
            SourceOutcome::NotPersisted { .. } | SourceOutcome::Empty => self.succeeded += 1,
            SourceOutcome::Degraded { .. } => self.degraded += 1,
            SourceOutcome::Failed { .. } => self.failed += 1,
        }
        self.sources.push(report);
    }
}

/// Batch shape derived from [`SchedulerConfig`].
#[derive(Debug, Clone, Copy)]
struct BatchSettings {
    window_size: usize,
    window_delay: Duration,
    retry: RetryPolicy,
}

struct Timer {
    jobs: JobScheduler,
    id: Uuid,
}

struct Inner {
    service: AggregationService,
    db: Database,
    settings: BatchSettings,
    enabled: AtomicBool,
    running: AtomicBool,
    cron: RwLock<String>,
    ignored: RwLock<BTreeSet<String>>,
    timer: Mutex<Option<Timer>>,
}

/// Resets the running flag when the batch ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Cloneable handle; every clone drives the same timer and flags.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// A stopped scheduler. Call [`Scheduler::start`] to arm the timer.
    pub fn new(service: AggregationService, db: Database, config: &SchedulerConfig) -> Self {
        let settings = BatchSettings {
            window_size: config.window_size.max(1),
            window_delay: Duration::from_millis(config.window_delay_ms),
            retry: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                backoff_base: Duration::from_millis(config.backoff_base_ms),
            },
        };
        let ignored: BTreeSet<String> = config.ignored_sources.iter().cloned().collect();
        if !ignored.is_empty() {
            tracing::info!(sources = ?ignored, "Ignoring sources for saving");
        }

        Self {
            inner: Arc::new(Inner {
                service,
                db,
                settings,
                enabled: AtomicBool::new(false),
                running: AtomicBool::new(false),
                cron: RwLock::new(config.cron_expression.trim().to_string()),
                ignored: RwLock::new(ignored),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Create run configs for every registered source that lacks one.
    pub async fn initialize_configs(&self, default_interval_minutes: i64) -> Result<usize, SchedulerError> {
        let names = self.inner.service.registry().list_names();
        Ok(self
            .inner
            .db
            .initialize_configs(&names, default_interval_minutes)
            .await?)
    }

    // ========================================================================
    // Timer lifecycle
    // ========================================================================

    /// Enable ticks and register the timer.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.inner.enabled.store(true, Ordering::Release);
        self.arm().await?;
        tracing::info!("Scheduler enabled");
        Ok(())
    }

    /// Disable ticks and remove the timer. A running batch is not interrupted.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        self.inner.enabled.store(false, Ordering::Release);
        self.disarm().await?;
        tracing::info!("Scheduler disabled");
        Ok(())
    }

    /// Replace the cron expression (when given) and re-register the timer.
    ///
    /// The enabled flag is unchanged; a stopped scheduler only records the
    /// new expression.
    pub async fn reconfigure(&self, expression: Option<&str>) -> Result<(), SchedulerError> {
        if let Some(expression) = expression {
            normalize_cron(expression)?;
            *self.inner.cron.write().await = expression.trim().to_string();
        }
        if self.inner.enabled.load(Ordering::Acquire) {
            self.arm().await?;
        }
        tracing::info!(cron = %self.inner.cron.read().await, "Scheduler reconfigured");
        Ok(())
    }

    pub async fn set_ignored_sources(&self, sources: impl IntoIterator<Item = String>) {
        *self.inner.ignored.write().await = sources.into_iter().collect();
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.inner.running.load(Ordering::Acquire),
            enabled: self.inner.enabled.load(Ordering::Acquire),
            timer_registered: self.inner.timer.lock().await.is_some(),
            cron_expression: self.inner.cron.read().await.clone(),
            ignored_sources: self.inner.ignored.read().await.iter().cloned().collect(),
        }
    }

    /// Tear down any existing timer and register a fresh one.
    async fn arm(&self) -> Result<(), SchedulerError> {
        let expression = self.inner.cron.read().await.clone();
        let schedule = normalize_cron(&expression)?;

        let mut slot = self.inner.timer.lock().await;
        if let Some(old) = slot.take() {
            shutdown(old).await;
        }

        let jobs = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Timer(e.to_string()))?;
        // The job lives inside `Inner`, so it must not keep `Inner` alive.
        let weak = Arc::downgrade(&self.inner);
        let job = Job::new_async(schedule.as_str(), move |_uuid, _jobs| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    Scheduler { inner }.handle_cron().await;
                }
            })
        })
        .map_err(|e| SchedulerError::InvalidCron {
            expression: expression.clone(),
            message: e.to_string(),
        })?;
        let id = jobs
            .add(job)
            .await
            .map_err(|e| SchedulerError::Timer(e.to_string()))?;
        jobs.start()
            .await
            .map_err(|e| SchedulerError::Timer(e.to_string()))?;

        *slot = Some(Timer { jobs, id });
        tracing::info!(cron = %expression, "Timer registered");
        Ok(())
    }

    async fn disarm(&self) -> Result<(), SchedulerError> {
        if let Some(timer) = self.inner.timer.lock().await.take() {
            shutdown(timer).await;
            tracing::info!("Timer removed");
        }
        Ok(())
    }

    // ========================================================================
    // Batches
    // ========================================================================

    /// Timer callback. Returns `None` when the tick was skipped.
    pub async fn handle_cron(&self) -> Option<BatchReport> {
        if !self.inner.enabled.load(Ordering::Acquire) {
            tracing::debug!("Scheduler disabled, ignoring tick");
            return None;
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Previous batch still running, skipping tick");
            return None;
        }
        let _guard = RunningGuard(&self.inner.running);

        let configs = match self.inner.db.enabled_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load enabled sources");
                return Some(BatchReport::default());
            }
        };

        let ignored = self.inner.ignored.read().await.clone();
        let units: Vec<(String, bool)> = configs
            .into_iter()
            .filter(|c| {
                let skip = ignored.contains(&c.source);
                if skip {
                    tracing::debug!(source = %c.source, "Skipping ignored source");
                }
                !skip
            })
            .map(|c| (c.source, true))
            .collect();

        Some(self.run_batch(units).await)
    }

    /// Operator refresh outside the timer.
    ///
    /// With no source, runs every enabled, non-ignored source. A named
    /// source is fetched even when ignored, but an ignored source is never
    /// persisted.
    pub async fn trigger(&self, source: Option<&str>) -> Result<BatchReport, SchedulerError> {
        let ignored = self.inner.ignored.read().await.clone();
        let units = match source {
            Some(name) => {
                if !self.inner.service.registry().contains(name) {
                    return Err(SchedulerError::NotFound(name.to_string()));
                }
                vec![(name.to_string(), !ignored.contains(name))]
            }
            None => self
                .inner
                .db
                .enabled_configs()
                .await?
                .into_iter()
                .filter(|c| !ignored.contains(&c.source))
                .map(|c| (c.source, true))
                .collect(),
        };
        Ok(self.run_batch(units).await)
    }

    /// Process `units` (source, persist) window by window.
    async fn run_batch(&self, units: Vec<(String, bool)>) -> BatchReport {
        let settings = self.inner.settings;
        let mut report = BatchReport::default();
        tracing::info!(sources = units.len(), window = settings.window_size, "Batch started");

        for (index, window) in units.chunks(settings.window_size).enumerate() {
            if index > 0 && !settings.window_delay.is_zero() {
                tokio::time::sleep(settings.window_delay).await;
            }

            // Each unit runs in its own task so a panicking adapter only
            // takes down its own unit.
            let handles = window.iter().map(|(name, persist)| {
                let service = self.inner.service.clone();
                let db = self.inner.db.clone();
                let name = name.clone();
                let persist = *persist;
                tokio::spawn(async move {
                    task::run_source(&service, &db, &name, persist, settings.retry).await
                })
            });

            for (result, (name, _)) in join_all(handles).await.into_iter().zip(window) {
                let source_report = result.unwrap_or_else(|e| {
                    tracing::error!(source = %name, error = %e, "Source task aborted");
                    SourceReport {
                        source: name.clone(),
                        attempts: 0,
                        outcome: SourceOutcome::Failed {
                            error: format!("task aborted: {e}"),
                        },
                    }
                });
                report.record(source_report);
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            degraded = report.degraded,
            failed = report.failed,
            saved = report.saved,
            "Batch finished"
        );
        report
    }
}

async fn shutdown(mut timer: Timer) {
    if let Err(e) = timer.jobs.remove(&timer.id).await {
        tracing::warn!(error = %e, "Failed to remove timer job");
    }
    if let Err(e) = timer.jobs.shutdown().await {
        tracing::warn!(error = %e, "Failed to shut down timer");
    }
}

/// Validate `expression` and return it in the six-field form the timer
/// expects. Five-field expressions get a leading `0` seconds field.
pub fn normalize_cron(expression: &str) -> Result<String, SchedulerError> {
    let expression = expression.trim();
    let invalid = |message: String| SchedulerError::InvalidCron {
        expression: expression.to_string(),
        message,
    };

    let schedule = match expression.split_whitespace().count() {
        5 => format!("0 {expression}"),
        6 => expression.to_string(),
        n => return Err(invalid(format!("expected 5 or 6 fields, got {n}"))),
    };

    Job::new_async(schedule.as_str(), |_uuid, _jobs| Box::pin(async {}))
        .map_err(|e| invalid(e.to_string()))?;
    Ok(schedule)
}
