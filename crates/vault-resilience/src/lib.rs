//! # vault-resilience
//!
//! Failure isolation for calls to downstream integrations.
//!
//! - [`HealthMonitor`]: per-service circuit breaker shared through the vault
//! - [`with_retry`]: bounded exponential backoff over retryable error kinds
//! - [`OfflineQueue`]: durable, priority-ordered backlog of deferred actions
//! - [`GracefulExecutor`]: primary, then fallback, then offline queue

pub mod executor;
pub mod health;
pub mod offline_queue;
pub mod retry;

pub use executor::{Execution, GracefulExecutor, SweepReport};
pub use health::{HealthMonitor, ServiceHealthRecord, ServiceStatus};
pub use offline_queue::{OfflineQueue, OfflineQueueItem, QueueStatus};
pub use retry::{with_retry, RetryPolicy};
