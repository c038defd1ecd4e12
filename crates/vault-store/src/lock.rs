//! Single-writer gate for shared aggregate artifacts.
//!
//! Only the agent whose identity is recorded in `State/dashboard_writer.lock`
//! may regenerate the dashboard. The lock is advisory: it keeps cooperating
//! agents from clobbering each other, it does not stop a hostile writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use vault_core::{Result, VaultLayout};

use crate::repository::atomic_write;

pub const LOCK_FILE: &str = "dashboard_writer.lock";

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardLock {
    pub owner: String,
    pub set_at: DateTime<Utc>,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct SingleWriterLock {
    path: PathBuf,
}

impl SingleWriterLock {
    pub fn new(layout: &VaultLayout) -> Self {
        Self::at(layout.state_dir().join(LOCK_FILE))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `identity` as the single writer, replacing any previous owner
    pub async fn assert_owner(&self, identity: &str) -> Result<DashboardLock> {
        let lock = DashboardLock {
            owner: identity.to_string(),
            set_at: Utc::now(),
            note: format!("Single-writer rule: only {} updates the dashboard", identity),
        };
        atomic_write(&self.path, &serde_json::to_vec_pretty(&lock)?).await?;
        debug!("Dashboard writer lock asserted by {}", identity);
        Ok(lock)
    }

    /// Current lock holder. A missing or unreadable lock reads as `None`.
    pub async fn current(&self) -> Option<DashboardLock> {
        let data = tokio::fs::read(&self.path).await.ok()?;
        match serde_json::from_slice(&data) {
            Ok(lock) => Some(lock),
            Err(e) => {
                warn!("Ignoring unreadable lock {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Whether `identity` may write: it owns the lock, or nobody does
    pub async fn may_write(&self, identity: &str) -> bool {
        match self.current().await {
            Some(lock) => lock.owner == identity,
            None => true,
        }
    }

    /// Regenerate `artifact` with `render()` if `identity` may write.
    ///
    /// Returns whether the artifact was written. A caller that is not the
    /// owner gets `Ok(false)` and the artifact is left untouched.
    pub async fn write_if_owner<F>(&self, identity: &str, artifact: &Path, render: F) -> Result<bool>
    where
        F: FnOnce() -> String,
    {
        if !self.may_write(identity).await {
            info!(
                "{} is not the dashboard writer, skipping {}",
                identity,
                artifact.display()
            );
            return Ok(false);
        }

        atomic_write(artifact, render().as_bytes()).await?;
        debug!("{} regenerated {}", identity, artifact.display());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_no_lock_allows_write() {
        let dir = TempDir::new().unwrap();
        let lock = SingleWriterLock::new(&VaultLayout::new(dir.path()));
        assert!(lock.current().await.is_none());
        assert!(lock.may_write("cloud").await);
    }

    #[tokio::test]
    async fn test_owner_writes_others_do_not() {
        let dir = TempDir::new().unwrap();
        let layout = VaultLayout::new(dir.path());
        let lock = SingleWriterLock::new(&layout);
        lock.assert_owner("local").await.unwrap();
        assert_eq!(lock.current().await.unwrap().owner, "local");

        let artifact = layout.dashboard_path();
        std::fs::write(&artifact, "original").unwrap();

        let wrote = lock
            .write_if_owner("cloud", &artifact, || "from cloud".to_string())
            .await
            .unwrap();
        assert!(!wrote);
        assert_eq!(std::fs::read(&artifact).unwrap(), b"original");

        let wrote = lock
            .write_if_owner("local", &artifact, || "from local".to_string())
            .await
            .unwrap();
        assert!(wrote);
        assert_eq!(std::fs::read_to_string(&artifact).unwrap(), "from local");
    }
}
