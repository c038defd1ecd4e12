//! Periodic task scheduling for agent loops

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info};
use vault_core::Result;

/// Runs an agent cycle repeatedly
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run `task` every `interval` until the scheduler decides to stop.
    ///
    /// A failing cycle is logged and the loop continues. Returns the number
    /// of cycles run.
    async fn run_periodically<F, Fut>(&self, interval: Duration, task: F) -> Result<usize>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send;
}

/// Sleep-between-cycles scheduler that stops on Ctrl-C or after
/// `max_cycles` cycles
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalScheduler {
    max_cycles: Option<usize>,
}

impl IntervalScheduler {
    /// Run until interrupted
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one cycle and return
    pub fn once() -> Self {
        Self::with_max_cycles(1)
    }

    pub fn with_max_cycles(max_cycles: usize) -> Self {
        Self {
            max_cycles: Some(max_cycles),
        }
    }
}

#[async_trait]
impl Scheduler for IntervalScheduler {
    async fn run_periodically<F, Fut>(&self, interval: Duration, mut task: F) -> Result<usize>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
    {
        let mut cycles = 0;
        loop {
            if let Err(e) = task().await {
                error!("Cycle {} failed: {}", cycles + 1, e);
            }
            cycles += 1;

            if self.max_cycles.is_some_and(|max| cycles >= max) {
                return Ok(cycles);
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, stopping after {} cycles", cycles);
                    return Ok(cycles);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vault_core::VaultError;

    #[tokio::test(start_paused = true)]
    async fn test_runs_budgeted_cycles() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let scheduler = IntervalScheduler::with_max_cycles(3);

        let cycles = scheduler
            .run_periodically(Duration::from_secs(30), || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(cycles, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_cycle_does_not_stop_loop() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let scheduler = IntervalScheduler::with_max_cycles(2);

        let cycles = scheduler
            .run_periodically(Duration::from_secs(1), || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(VaultError::Other("boom".into()))
            })
            .await
            .unwrap();

        assert_eq!(cycles, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
