//! Durable backlog of actions deferred while a service was unavailable.
//!
//! Pending work is one persisted map in `State/offline_queue.json`, keyed by
//! item id. Completed and failed items are moved out into their own maps, so
//! the map that every sweep rewrites only ever holds live work.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vault_core::config::OfflineQueueConfig;
use vault_core::{Result, VaultLayout};
use vault_store::{update_map, JsonMapFile, MapRepository};

pub const QUEUE_FILE: &str = "offline_queue.json";
pub const COMPLETED_FILE: &str = "offline_queue_completed.json";
pub const FAILED_FILE: &str = "offline_queue_failed.json";

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueueItem {
    pub id: String,
    pub action_kind: String,
    pub service: String,
    pub payload: serde_json::Value,
    /// 1 = highest, 10 = lowest
    pub priority: u8,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    pub status: QueueStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct OfflineQueue<R = JsonMapFile<OfflineQueueItem>> {
    pending: R,
    completed: R,
    failed: R,
    max_attempts: u32,
    default_priority: u8,
}

impl OfflineQueue {
    pub fn open(layout: &VaultLayout, config: &OfflineQueueConfig) -> Self {
        let state = layout.state_dir();
        Self::with_repositories(
            JsonMapFile::new(state.join(QUEUE_FILE)),
            JsonMapFile::new(state.join(COMPLETED_FILE)),
            JsonMapFile::new(state.join(FAILED_FILE)),
            config,
        )
    }
}

impl<R: MapRepository<OfflineQueueItem>> OfflineQueue<R> {
    pub fn with_repositories(
        pending: R,
        completed: R,
        failed: R,
        config: &OfflineQueueConfig,
    ) -> Self {
        Self {
            pending,
            completed,
            failed,
            max_attempts: config.max_attempts.max(1),
            default_priority: clamp_priority(config.default_priority),
        }
    }

    /// Attempts after which a pending item is given up on
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Add an action to the backlog, returning its id
    pub async fn enqueue(
        &self,
        action_kind: &str,
        service: &str,
        payload: serde_json::Value,
        priority: Option<u8>,
    ) -> Result<String> {
        let id = format!(
            "{}_{}_{}_{}",
            service,
            action_kind,
            Local::now().format("%Y%m%d_%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let item = OfflineQueueItem {
            id: id.clone(),
            action_kind: action_kind.to_string(),
            service: service.to_string(),
            payload,
            priority: clamp_priority(priority.unwrap_or(self.default_priority)),
            queued_at: Utc::now(),
            attempts: 0,
            last_attempt: None,
            status: QueueStatus::Pending,
            error: None,
            completed_at: None,
        };

        update_map(&self.pending, |map| {
            map.insert(item.id.clone(), item.clone());
        })
        .await?;

        info!(service, priority = item.priority, "Queued offline action {}", id);
        Ok(id)
    }

    /// Pending items, optionally for one service, highest priority first
    /// and oldest first within a priority
    pub async fn pending(&self, service: Option<&str>) -> Result<Vec<OfflineQueueItem>> {
        let mut items: Vec<_> = self
            .pending
            .load()
            .await?
            .entries
            .into_values()
            .filter(|item| item.status == QueueStatus::Pending)
            .filter(|item| service.map_or(true, |s| item.service == s))
            .collect();

        items.sort_by(|a, b| {
            (a.priority, a.queued_at, &a.id).cmp(&(b.priority, b.queued_at, &b.id))
        });
        Ok(items)
    }

    /// Look an item up in the pending map, then among retired items
    pub async fn get(&self, id: &str) -> Result<Option<OfflineQueueItem>> {
        for repo in [&self.pending, &self.completed, &self.failed] {
            if let Some(item) = repo.load().await?.entries.remove(id) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Every item regardless of status
    pub async fn all(&self) -> Result<Vec<OfflineQueueItem>> {
        let mut items = Vec::new();
        for repo in [&self.pending, &self.completed, &self.failed] {
            items.extend(repo.load().await?.entries.into_values());
        }
        Ok(items)
    }

    /// Returns false if `id` is not pending
    pub async fn mark_completed(&self, id: &str) -> Result<bool> {
        let found = self
            .retire(id, |item| {
                item.status = QueueStatus::Completed;
                item.completed_at = Some(Utc::now());
            })
            .await?;

        if found {
            debug!("Offline action {} completed", id);
        }
        Ok(found)
    }

    /// Returns false if `id` is not pending
    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<bool> {
        let found = self
            .retire(id, |item| {
                item.status = QueueStatus::Failed;
                item.error = Some(reason.to_string());
            })
            .await?;

        if found {
            warn!("Offline action {} failed permanently: {}", id, reason);
        }
        Ok(found)
    }

    /// Take `id` out of the pending map and file it under its final status.
    ///
    /// The removal is saved first: a crash in between loses the history
    /// entry, never re-runs a finished action.
    async fn retire<F>(&self, id: &str, finish: F) -> Result<bool>
    where
        F: FnOnce(&mut OfflineQueueItem),
    {
        let Some(mut item) = update_map(&self.pending, |map| map.remove(id)).await? else {
            return Ok(false);
        };
        finish(&mut item);

        let archive = match item.status {
            QueueStatus::Completed => &self.completed,
            QueueStatus::Pending | QueueStatus::Failed => &self.failed,
        };
        update_map(archive, |map| {
            map.insert(item.id.clone(), item.clone());
        })
        .await?;
        Ok(true)
    }

    /// Count an attempt, returning the new attempt count
    pub async fn increment_attempt(&self, id: &str) -> Result<Option<u32>> {
        update_map(&self.pending, |map| {
            map.get_mut(id).map(|item| {
                item.attempts += 1;
                item.last_attempt = Some(Utc::now());
                item.attempts
            })
        })
        .await
    }
}

fn clamp_priority(priority: u8) -> u8 {
    priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn queue(dir: &TempDir) -> OfflineQueue {
        OfflineQueue::open(&VaultLayout::new(dir.path()), &OfflineQueueConfig::default())
    }

    #[tokio::test]
    async fn test_pending_ordered_by_priority() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir);

        for priority in [7, 1, 5] {
            queue
                .enqueue("email_send", "gmail", json!({ "p": priority }), Some(priority))
                .await
                .unwrap();
        }

        let priorities: Vec<u8> = queue
            .pending(None)
            .await
            .unwrap()
            .iter()
            .map(|item| item.priority)
            .collect();
        assert_eq!(priorities, vec![1, 5, 7]);
    }

    #[tokio::test]
    async fn test_enqueue_defaults_and_clamps() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir);

        let id = queue
            .enqueue("invoice", "odoo", json!({}), None)
            .await
            .unwrap();
        assert!(id.starts_with("odoo_invoice_"));
        assert_eq!(queue.get(&id).await.unwrap().unwrap().priority, 5);

        let id = queue
            .enqueue("invoice", "odoo", json!({}), Some(0))
            .await
            .unwrap();
        assert_eq!(queue.get(&id).await.unwrap().unwrap().priority, 1);

        let id = queue
            .enqueue("invoice", "odoo", json!({}), Some(42))
            .await
            .unwrap();
        assert_eq!(queue.get(&id).await.unwrap().unwrap().priority, 10);
    }

    #[tokio::test]
    async fn test_service_filter_and_lifecycle() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir);

        let gmail = queue
            .enqueue("email_send", "gmail", json!({}), None)
            .await
            .unwrap();
        let odoo = queue
            .enqueue("invoice", "odoo", json!({}), None)
            .await
            .unwrap();

        assert_eq!(queue.pending(Some("gmail")).await.unwrap().len(), 1);
        assert_eq!(queue.increment_attempt(&gmail).await.unwrap(), Some(1));
        assert_eq!(queue.increment_attempt(&gmail).await.unwrap(), Some(2));

        assert!(queue.mark_completed(&gmail).await.unwrap());
        assert!(queue.mark_failed(&odoo, "rejected by ERP").await.unwrap());
        assert!(queue.pending(None).await.unwrap().is_empty());

        let failed = queue.get(&odoo).await.unwrap().unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("rejected by ERP"));

        let done = queue.get(&gmail).await.unwrap().unwrap();
        assert_eq!(done.attempts, 2);
        assert!(done.completed_at.is_some());

        assert!(!queue.mark_completed("missing").await.unwrap());
        assert!(!queue.mark_completed(&gmail).await.unwrap());
        assert_eq!(queue.increment_attempt("missing").await.unwrap(), None);
        assert_eq!(queue.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retired_items_leave_pending_map() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir);
        let state = VaultLayout::new(dir.path()).state_dir();
        let pending_map: JsonMapFile<OfflineQueueItem> = JsonMapFile::new(state.join(QUEUE_FILE));

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(queue.enqueue("post", "twitter", json!({}), None).await.unwrap());
        }
        assert_eq!(pending_map.load().await.unwrap().entries.len(), 3);

        queue.mark_completed(&ids[0]).await.unwrap();
        queue.mark_failed(&ids[1], "Max attempts reached").await.unwrap();

        let remaining = pending_map.load().await.unwrap().entries;
        assert_eq!(remaining.keys().collect::<Vec<_>>(), vec![&ids[2]]);

        let completed: JsonMapFile<OfflineQueueItem> = JsonMapFile::new(state.join(COMPLETED_FILE));
        let failed: JsonMapFile<OfflineQueueItem> = JsonMapFile::new(state.join(FAILED_FILE));
        assert!(completed.load().await.unwrap().entries.contains_key(&ids[0]));
        assert!(failed.load().await.unwrap().entries.contains_key(&ids[1]));
    }
}
