//! Fail-open utilities for infrastructure side effects
//!
//! Use these for operations whose failure must never abort an agent cycle:
//! audit log appends, dashboard refreshes, lock re-assertion.
//!
//! DO NOT use fail-open for:
//! - Claims and state transitions (correctness)
//! - Signature registry writes (deduplication)
//! - Channel processor calls (use the graceful-degradation executor)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// # Usage
///
/// ```no_run
/// use vault_core::fail_open::fail_open;
/// use vault_core::Result;
///
/// async fn append_audit_line() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let result = fail_open("audit_log", || append_audit_line()).await;
///     // result is None if the append failed
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}
