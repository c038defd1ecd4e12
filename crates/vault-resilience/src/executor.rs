//! Graceful-degradation executor
//!
//! The single choke point for calls to external services. Composes the
//! health monitor and the offline queue: an unavailable service never
//! surfaces as a hard failure, the action falls back or is deferred instead.

use serde::Serialize;
use std::future::{Future, Ready};
use tracing::{error, info, warn};
use vault_core::fail_open::fail_open;
use vault_core::{Result, VaultConfig, VaultLayout};

use crate::health::HealthMonitor;
use crate::offline_queue::{OfflineQueue, OfflineQueueItem};

/// What happened to an action passed through the executor
#[derive(Debug)]
pub enum Execution<T> {
    /// The primary action succeeded
    Primary(T),
    /// The primary was skipped or failed; the fallback produced this
    Fallback(T),
    /// Deferred to the offline queue under this id
    Queued(String),
    /// Nothing ran to completion and there was no payload to queue
    Dropped {
        /// Primary error, if the primary was attempted
        error: Option<String>,
    },
}

impl<T> Execution<T> {
    /// The action's value, if primary or fallback produced one
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Primary(val) | Self::Fallback(val) => Some(val),
            Self::Queued(_) | Self::Dropped { .. } => None,
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Self::Primary(_))
    }
}

/// Result of one offline-queue sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub service: String,
    /// The service was unavailable, nothing was attempted
    pub skipped: bool,
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    /// The sweep stopped at a failing item
    pub stopped_early: bool,
}

type NoFallback<T> = fn() -> Ready<Result<T>>;

pub struct GracefulExecutor {
    health: HealthMonitor,
    queue: OfflineQueue,
}

impl GracefulExecutor {
    pub fn new(health: HealthMonitor, queue: OfflineQueue) -> Self {
        Self { health, queue }
    }

    pub fn open(layout: &VaultLayout, config: &VaultConfig) -> Self {
        Self::new(
            HealthMonitor::open(layout, &config.health),
            OfflineQueue::open(layout, &config.offline_queue),
        )
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Run `primary` against `service`, deferring to the offline queue when
    /// the service is unavailable or the call fails.
    ///
    /// Only persistence failures of the queue itself are returned as errors.
    pub async fn execute<T, P, PF>(
        &self,
        service: &str,
        action_kind: &str,
        payload: Option<serde_json::Value>,
        primary: P,
    ) -> Result<Execution<T>>
    where
        P: FnOnce() -> PF,
        PF: Future<Output = Result<T>>,
    {
        self.run(service, action_kind, payload, primary, None::<NoFallback<T>>)
            .await
    }

    /// Like [`GracefulExecutor::execute`], trying `fallback` before the queue
    pub async fn execute_with_fallback<T, P, PF, B, BF>(
        &self,
        service: &str,
        action_kind: &str,
        payload: Option<serde_json::Value>,
        primary: P,
        fallback: B,
    ) -> Result<Execution<T>>
    where
        P: FnOnce() -> PF,
        PF: Future<Output = Result<T>>,
        B: FnOnce() -> BF,
        BF: Future<Output = Result<T>>,
    {
        self.run(service, action_kind, payload, primary, Some(fallback))
            .await
    }

    async fn run<T, P, PF, B, BF>(
        &self,
        service: &str,
        action_kind: &str,
        payload: Option<serde_json::Value>,
        primary: P,
        fallback: Option<B>,
    ) -> Result<Execution<T>>
    where
        P: FnOnce() -> PF,
        PF: Future<Output = Result<T>>,
        B: FnOnce() -> BF,
        BF: Future<Output = Result<T>>,
    {
        let primary_error = if self.health.is_available(service).await {
            match primary().await {
                Ok(val) => {
                    fail_open("health.record_success", || self.health.record_success(service))
                        .await;
                    return Ok(Execution::Primary(val));
                }
                Err(e) => {
                    let message = e.to_string();
                    fail_open("health.record_failure", || {
                        self.health.record_failure(service, &message)
                    })
                    .await;
                    Some(message)
                }
            }
        } else {
            warn!(service, "Service unavailable, using fallback/queue");
            None
        };

        if let Some(fallback) = fallback {
            info!(service, "Trying fallback for {}", action_kind);
            match fallback().await {
                Ok(val) => return Ok(Execution::Fallback(val)),
                Err(e) => error!(service, "Fallback also failed: {}", e),
            }
        }

        match payload {
            Some(payload) => {
                let id = self
                    .queue
                    .enqueue(action_kind, service, payload, None)
                    .await?;
                Ok(Execution::Queued(id))
            }
            None => Ok(Execution::Dropped {
                error: primary_error,
            }),
        }
    }

    /// Replay queued actions for `service`.
    ///
    /// Runs only while the service is available and stops at the first
    /// processor error, so a struggling service is not hammered. A processor
    /// returning `Ok(false)` leaves the item pending for a later sweep.
    pub async fn process_pending<F, Fut>(&self, service: &str, mut processor: F) -> Result<SweepReport>
    where
        F: FnMut(OfflineQueueItem) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let mut report = SweepReport {
            service: service.to_string(),
            ..SweepReport::default()
        };

        if !self.health.is_available(service).await {
            info!(service, "Service still unavailable, skipping queue processing");
            report.skipped = true;
            return Ok(report);
        }

        let pending = self.queue.pending(Some(service)).await?;
        if pending.is_empty() {
            return Ok(report);
        }
        info!(service, "Processing {} queued items", pending.len());

        let max_attempts = self.queue.max_attempts();
        for item in pending {
            let id = item.id.clone();
            let Some(attempts) = self.queue.increment_attempt(&id).await? else {
                continue;
            };
            report.attempted += 1;

            match processor(item).await {
                Ok(true) => {
                    self.queue.mark_completed(&id).await?;
                    fail_open("health.record_success", || self.health.record_success(service))
                        .await;
                    report.completed += 1;
                    info!(service, "Processed queued item {}", id);
                }
                Ok(false) => {
                    if attempts >= max_attempts {
                        self.queue.mark_failed(&id, "Max attempts reached").await?;
                        report.failed += 1;
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    fail_open("health.record_failure", || {
                        self.health.record_failure(service, &message)
                    })
                    .await;
                    if attempts >= max_attempts {
                        self.queue.mark_failed(&id, &message).await?;
                        report.failed += 1;
                    }
                    report.stopped_early = true;
                    break;
                }
            }
        }

        Ok(report)
    }
}
