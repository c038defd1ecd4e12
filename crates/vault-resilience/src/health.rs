//! Per-service health monitor
//!
//! Implements the circuit breaker pattern over a single shared record per
//! service, persisted in `State/service_health.json` so every agent process
//! sees the same view of a flaky downstream integration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use vault_core::config::HealthConfig;
use vault_core::{Result, VaultLayout};
use vault_store::{update_map, JsonMapFile, MapRepository};

pub const HEALTH_FILE: &str = "service_health.json";

/// Service health states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Last call succeeded
    Healthy,
    /// Failing, but below the threshold - calls still allowed
    Degraded,
    /// Too many consecutive failures - calls refused until the recovery window passes
    Unavailable,
    /// Never called
    #[default]
    Unknown,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealthRecord {
    pub service_name: String,
    pub status: ServiceStatus,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
}

impl ServiceHealthRecord {
    fn new(service: &str) -> Self {
        Self {
            service_name: service.to_string(),
            status: ServiceStatus::Unknown,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            last_error: None,
            last_check: None,
        }
    }
}

/// Circuit breaker shared by every agent through the vault
///
/// # States
///
/// - **Healthy / Unknown / Degraded**: calls allowed
/// - **Unavailable**: calls refused until `recovery_window` has passed since
///   the last check, then one retry is allowed (half-open)
///
/// # Example
///
/// ```no_run
/// use vault_core::VaultLayout;
/// use vault_core::config::HealthConfig;
/// use vault_resilience::HealthMonitor;
///
/// # async fn example() -> vault_core::Result<()> {
/// let monitor = HealthMonitor::open(&VaultLayout::new("vault"), &HealthConfig::default());
///
/// monitor.record_failure("gmail", "connection reset").await?;
/// if monitor.is_available("gmail").await {
///     // still degraded, calls allowed
/// }
/// # Ok(())
/// # }
/// ```
pub struct HealthMonitor<R = JsonMapFile<ServiceHealthRecord>> {
    repo: R,
    failure_threshold: u32,
    recovery_window: Duration,
}

impl HealthMonitor {
    pub fn open(layout: &VaultLayout, config: &HealthConfig) -> Self {
        Self::with_repository(
            JsonMapFile::new(layout.state_dir().join(HEALTH_FILE)),
            config.failure_threshold,
            Duration::from_secs(config.recovery_window_secs),
        )
    }
}

impl<R: MapRepository<ServiceHealthRecord>> HealthMonitor<R> {
    /// # Arguments
    ///
    /// * `failure_threshold` - Consecutive failures before a service is unavailable
    /// * `recovery_window` - Wait before an unavailable service may be retried
    pub fn with_repository(repo: R, failure_threshold: u32, recovery_window: Duration) -> Self {
        Self {
            repo,
            failure_threshold: failure_threshold.max(1),
            recovery_window,
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Record a successful call (resets the failure count)
    pub async fn record_success(&self, service: &str) -> Result<ServiceHealthRecord> {
        let record = update_map(&self.repo, |map| {
            let now = Utc::now();
            let record = map
                .entry(service.to_string())
                .or_insert_with(|| ServiceHealthRecord::new(service));
            record.status = ServiceStatus::Healthy;
            record.consecutive_failures = 0;
            record.last_success = Some(now);
            record.last_check = Some(now);
            record.clone()
        })
        .await?;

        debug!(service, "Service healthy");
        Ok(record)
    }

    /// Record a failed call
    pub async fn record_failure(&self, service: &str, error: &str) -> Result<ServiceHealthRecord> {
        let threshold = self.failure_threshold;
        let record = update_map(&self.repo, |map| {
            let now = Utc::now();
            let record = map
                .entry(service.to_string())
                .or_insert_with(|| ServiceHealthRecord::new(service));
            record.consecutive_failures += 1;
            record.status = if record.consecutive_failures >= threshold {
                ServiceStatus::Unavailable
            } else {
                ServiceStatus::Degraded
            };
            record.last_failure = Some(now);
            record.last_error = Some(error.to_string());
            record.last_check = Some(now);
            record.clone()
        })
        .await?;

        warn!(
            service,
            status = %record.status,
            "Service failure #{}: {}",
            record.consecutive_failures,
            error
        );
        Ok(record)
    }

    pub async fn record(&self, service: &str) -> Result<Option<ServiceHealthRecord>> {
        Ok(self.repo.load().await?.entries.remove(service))
    }

    pub async fn status(&self, service: &str) -> Result<ServiceStatus> {
        Ok(self
            .record(service)
            .await?
            .map(|r| r.status)
            .unwrap_or_default())
    }

    /// Whether a call to `service` may be attempted now.
    ///
    /// An unreadable health file counts as available.
    pub async fn is_available(&self, service: &str) -> bool {
        let record = match self.record(service).await {
            Ok(record) => record,
            Err(e) => {
                warn!(service, "Health lookup failed, assuming available: {}", e);
                return true;
            }
        };

        let Some(record) = record else {
            return true;
        };

        match record.status {
            ServiceStatus::Healthy | ServiceStatus::Degraded | ServiceStatus::Unknown => true,
            ServiceStatus::Unavailable => {
                let recovered = record
                    .last_check
                    .and_then(|at| (Utc::now() - at).to_std().ok())
                    .map(|elapsed| elapsed > self.recovery_window)
                    .unwrap_or(false);
                if recovered {
                    info!(service, "Recovery window elapsed, allowing a retry");
                }
                recovered
            }
        }
    }

    /// Every tracked service and its record
    pub async fn all_status(&self) -> Result<BTreeMap<String, ServiceHealthRecord>> {
        Ok(self.repo.load().await?.entries)
    }
}
