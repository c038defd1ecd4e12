//! Cloud integration worker
//!
//! Draft-only integration agent. Claims items in `Needs_Action/cloud` that
//! match the configured patterns and runs them through processors that are
//! not local-only. When the downstream service is unavailable the item is
//! serialized into the offline queue and replayed on a later cycle.

use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};
use vault_core::{derive_kind, Result, VaultConfig, VaultError, VaultLayout, VaultState, WorkItem};
use vault_resilience::{Execution, GracefulExecutor, OfflineQueueItem, SweepReport};
use vault_store::work_item::{archive, create, list_any, move_item, sorted_by_name, with_timestamp_suffix};
use vault_store::{ClaimCoordinator, ClaimedItem, MoveOutcome};

use crate::audit::AuditLog;
use crate::cloud_draft::IDENTITY;
use crate::file_name;
use crate::processor::{ChannelProcessor, ProcessOutcome, ProcessorRegistry};
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrationReport {
    pub processed: Vec<ProcessOutcome>,
    /// Offline queue ids of deferred items
    pub queued: Vec<String>,
    pub invalid: Vec<String>,
    /// Items put back into `Needs_Action/cloud`
    pub returned: Vec<String>,
    pub sweeps: Vec<SweepReport>,
}

pub struct CloudIntegrationWorker {
    layout: VaultLayout,
    registry: ProcessorRegistry,
    executor: GracefulExecutor,
    claims: ClaimCoordinator,
    audit: AuditLog,
    patterns: Vec<String>,
}

impl CloudIntegrationWorker {
    pub fn new(layout: VaultLayout, config: &VaultConfig, registry: ProcessorRegistry) -> Self {
        Self {
            executor: GracefulExecutor::open(&layout, config),
            claims: ClaimCoordinator::new(&layout, IDENTITY),
            audit: AuditLog::new(&layout, "cloud_integration"),
            patterns: config.cloud_integration.patterns.clone(),
            registry,
            layout,
        }
    }

    pub fn from_config(layout: VaultLayout, config: &VaultConfig) -> Result<Self> {
        let registry = ProcessorRegistry::from_config(config)?;
        Ok(Self::new(layout, config, registry))
    }

    pub fn executor(&self) -> &GracefulExecutor {
        &self.executor
    }

    pub async fn start(&self) -> Result<()> {
        self.layout.ensure_dirs(&[IDENTITY]).await?;
        info!(
            "Cloud integration worker started on {} (patterns: {})",
            self.layout.root().display(),
            self.patterns.join(", ")
        );
        Ok(())
    }

    /// Processor for `kind` that a draft-only agent may run
    fn processor_for(&self, kind: &str) -> Option<Arc<dyn ChannelProcessor>> {
        self.registry.get(kind).filter(|p| !p.local_only())
    }

    /// Replay the offline backlog, then claim and process new items
    pub async fn cycle(&self) -> Result<IntegrationReport> {
        let mut report = IntegrationReport::default();

        let services: BTreeSet<String> = self
            .registry
            .processors()
            .iter()
            .filter(|p| !p.local_only())
            .map(|p| p.service().to_string())
            .collect();
        for service in services {
            let sweep = self
                .executor
                .process_pending(&service, |queued| self.replay(queued))
                .await?;
            if sweep.attempted > 0 {
                info!(
                    service = %service,
                    "Replayed {} queued items, {} completed",
                    sweep.attempted,
                    sweep.completed
                );
            }
            report.sweeps.push(sweep);
        }

        let cloud_dir = self.layout.dir(&VaultState::NeedsActionCloud);
        for path in sorted_by_name(list_any(&cloud_dir, &self.patterns).await?) {
            let kind = derive_kind(&file_name(&path));
            let Some(processor) = self.processor_for(&kind) else {
                debug!("No draft-only processor for {}, leaving it", path.display());
                continue;
            };
            let Some(claimed) = self.claims.claim(&path).await.into_claimed() else {
                continue;
            };
            if let Err(e) = self
                .handle(&claimed, &kind, processor.as_ref(), &mut report)
                .await
            {
                warn!("Processing {} failed: {}", claimed.path.display(), e);
                match self.claims.release(&claimed).await {
                    Ok(MoveOutcome::Moved(_)) => report.returned.push(file_name(&path)),
                    Ok(MoveOutcome::Vanished) => {}
                    Err(e) => warn!("Failed to release {}: {}", claimed.path.display(), e),
                }
            }
        }

        self.audit
            .record(
                "cloud_integration_cycle",
                json!({
                    "processed": report.processed.len(),
                    "queued": report.queued,
                    "invalid": report.invalid,
                    "returned": report.returned,
                }),
            )
            .await;
        Ok(report)
    }

    async fn handle(
        &self,
        claimed: &ClaimedItem,
        kind: &str,
        processor: &dyn ChannelProcessor,
        report: &mut IntegrationReport,
    ) -> Result<()> {
        let item = claimed.read().await?;
        let done_dir = self.layout.dir(&VaultState::Done);

        let required: Vec<&str> = processor
            .required_metadata()
            .iter()
            .map(String::as_str)
            .collect();
        let missing = item.missing_fields(&required);
        if !missing.is_empty() {
            warn!(
                "{}",
                VaultError::malformed(
                    &item.name,
                    format!("missing required metadata: {}", missing.join(", "))
                )
            );
            archive(&claimed.path, &done_dir, Some("INVALID")).await?;
            report.invalid.push(item.name);
            return Ok(());
        }

        let payload = serde_json::to_value(&item)?;
        let name = item.name.clone();
        let batch = [item];
        let execution = self
            .executor
            .execute(processor.service(), kind, Some(payload), || {
                processor.process(&batch)
            })
            .await?;

        match execution {
            Execution::Primary(outcomes) | Execution::Fallback(outcomes) => {
                let mut outcome = outcomes.into_iter().next().unwrap_or_else(|| {
                    ProcessOutcome::error(&name, processor.name(), "Processor returned no outcome")
                });
                let marker = if outcome.is_success() {
                    "DRAFT_PROCESSED"
                } else {
                    "FAILED"
                };
                if let MoveOutcome::Moved(target) =
                    archive(&claimed.path, &done_dir, Some(marker)).await?
                {
                    outcome.archived_as = Some(file_name(&target));
                }
                report.processed.push(outcome);
            }
            Execution::Queued(id) => {
                info!("{} deferred to the offline queue as {}", name, id);
                archive(&claimed.path, &done_dir, Some("QUEUED")).await?;
                report.queued.push(id);
            }
            Execution::Dropped { .. } => {
                let cloud_dir = self.layout.dir(&VaultState::NeedsActionCloud);
                move_item(&claimed.path, &cloud_dir).await?;
                report.returned.push(name);
            }
        }
        Ok(())
    }

    /// Re-run one queued item. `Ok(false)` leaves it queued.
    async fn replay(&self, queued: OfflineQueueItem) -> Result<bool> {
        let Some(processor) = self.processor_for(&queued.action_kind) else {
            warn!("No processor for queued {} ({})", queued.id, queued.action_kind);
            return Ok(false);
        };
        let mut item: WorkItem = match serde_json::from_value(queued.payload) {
            Ok(item) => item,
            Err(e) => {
                warn!("Queued {} has an unreadable payload: {}", queued.id, e);
                return Ok(false);
            }
        };

        // Processors read the item from disk, so restage it
        let staging = self.claims.in_progress_dir();
        let path = match create(staging, &item.name, &item.metadata, &item.body).await {
            Err(VaultError::AlreadyExists(_)) => {
                create(staging, &with_timestamp_suffix(&item.name), &item.metadata, &item.body)
                    .await?
            }
            other => other?,
        };
        item.path = path.clone();

        let result = processor.process(std::slice::from_ref(&item)).await;
        match result {
            Ok(outcomes) if outcomes.first().is_some_and(ProcessOutcome::is_success) => {
                let done_dir = self.layout.dir(&VaultState::Done);
                archive(&path, &done_dir, Some("DRAFT_PROCESSED")).await?;
                Ok(true)
            }
            other => {
                if let Err(e) = fs::remove_file(&path).await {
                    debug!("Failed to remove staged {}: {}", path.display(), e);
                }
                other.map(|_| false)
            }
        }
    }

    pub async fn run<S: Scheduler>(&self, scheduler: &S, interval: Duration) -> Result<usize> {
        self.start().await?;
        scheduler
            .run_periodically(interval, || async move {
                self.cycle().await?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use vault_core::Metadata;
    use vault_resilience::QueueStatus;

    struct InvoiceDrafts {
        down: AtomicBool,
        reject: AtomicBool,
        calls: AtomicUsize,
        required: Vec<String>,
    }

    #[async_trait]
    impl ChannelProcessor for InvoiceDrafts {
        fn name(&self) -> &str {
            "odoo_drafts"
        }

        fn service(&self) -> &str {
            "odoo"
        }

        fn required_metadata(&self) -> &[String] {
            &self.required
        }

        fn local_only(&self) -> bool {
            false
        }

        async fn process(&self, items: &[WorkItem]) -> Result<Vec<ProcessOutcome>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(VaultError::Transient("connection refused".into()));
            }
            self.calls.fetch_add(items.len(), Ordering::SeqCst);
            assert!(items.iter().all(|i| i.path.exists()));
            if self.reject.load(Ordering::SeqCst) {
                return Ok(items
                    .iter()
                    .map(|i| ProcessOutcome::error(&i.name, "odoo_drafts", "partner archived"))
                    .collect());
            }
            Ok(items
                .iter()
                .map(|i| ProcessOutcome::success(&i.name, "odoo_drafts", Some("INV/1".into())))
                .collect())
        }
    }

    fn worker(dir: &tempfile::TempDir, processor: Arc<InvoiceDrafts>) -> CloudIntegrationWorker {
        let mut registry = ProcessorRegistry::new();
        registry.register(&["odoo-draft-invoice"], processor);
        CloudIntegrationWorker::new(VaultLayout::new(dir.path()), &VaultConfig::default(), registry)
    }

    fn drafts(down: bool) -> Arc<InvoiceDrafts> {
        Arc::new(InvoiceDrafts {
            down: AtomicBool::new(down),
            reject: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            required: vec!["partner_id".to_string()],
        })
    }

    async fn submit(dir: &tempfile::TempDir, name: &str, meta: Metadata) {
        let cloud_dir = VaultLayout::new(dir.path()).dir(&VaultState::NeedsActionCloud);
        create(&cloud_dir, name, &meta, "| 1 | 2 | 10.0 |").await.unwrap();
    }

    #[tokio::test]
    async fn test_processes_matching_items() {
        let dir = tempfile::TempDir::new().unwrap();
        let processor = drafts(false);
        let worker = worker(&dir, processor.clone());
        submit(&dir, "ODOO_DRAFT_INVOICE_1.md", Metadata::new().with("partner_id", "7")).await;
        submit(&dir, "DRAFT_EMAIL_1.md", Metadata::new()).await;

        let report = worker.cycle().await.unwrap();

        assert_eq!(report.processed.len(), 1);
        assert_eq!(
            report.processed[0].archived_as.as_deref(),
            Some("DRAFT_PROCESSED_ODOO_DRAFT_INVOICE_1.md")
        );
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        // Not matching the patterns, left for the local executive
        assert!(dir.path().join("Needs_Action/cloud/DRAFT_EMAIL_1.md").exists());
    }

    #[tokio::test]
    async fn test_missing_metadata_is_invalid() {
        let dir = tempfile::TempDir::new().unwrap();
        let processor = drafts(false);
        let worker = worker(&dir, processor.clone());
        submit(&dir, "ODOO_DRAFT_INVOICE_2.md", Metadata::new()).await;

        let report = worker.cycle().await.unwrap();

        assert_eq!(report.invalid, vec!["ODOO_DRAFT_INVOICE_2.md"]);
        assert!(dir.path().join("Done/INVALID_ODOO_DRAFT_INVOICE_2.md").exists());
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejected_outcome_archived_failed() {
        let dir = tempfile::TempDir::new().unwrap();
        let processor = drafts(false);
        processor.reject.store(true, Ordering::SeqCst);
        let worker = worker(&dir, processor.clone());
        submit(&dir, "ODOO_DRAFT_INVOICE_4.md", Metadata::new().with("partner_id", "7")).await;

        let report = worker.cycle().await.unwrap();

        assert!(report.invalid.is_empty());
        assert_eq!(
            report.processed[0].archived_as.as_deref(),
            Some("FAILED_ODOO_DRAFT_INVOICE_4.md")
        );
        assert!(!dir.path().join("Done/INVALID_ODOO_DRAFT_INVOICE_4.md").exists());
    }

    #[tokio::test]
    async fn test_unarchivable_item_returns_to_queue() {
        let dir = tempfile::TempDir::new().unwrap();
        let processor = drafts(false);
        let worker = worker(&dir, processor.clone());
        submit(&dir, "ODOO_DRAFT_INVOICE_5.md", Metadata::new()).await;
        std::fs::write(dir.path().join("Done"), "").unwrap();

        let report = worker.cycle().await.unwrap();

        assert_eq!(report.returned, vec!["ODOO_DRAFT_INVOICE_5.md"]);
        assert!(dir
            .path()
            .join("Needs_Action/cloud/ODOO_DRAFT_INVOICE_5.md")
            .exists());
        assert!(vault_store::work_item::list(&dir.path().join("In_Progress/cloud"), "*.md")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_outage_queues_then_replays() {
        let dir = tempfile::TempDir::new().unwrap();
        let processor = drafts(true);
        let worker = worker(&dir, processor.clone());
        submit(&dir, "ODOO_DRAFT_INVOICE_3.md", Metadata::new().with("partner_id", "7")).await;

        let report = worker.cycle().await.unwrap();
        assert_eq!(report.queued.len(), 1);
        assert!(dir.path().join("Done/QUEUED_ODOO_DRAFT_INVOICE_3.md").exists());
        let id = report.queued[0].clone();

        processor.down.store(false, Ordering::SeqCst);
        let report = worker.cycle().await.unwrap();

        assert_eq!(report.sweeps[0].completed, 1);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        let queued = worker.executor().queue().get(&id).await.unwrap().unwrap();
        assert_eq!(queued.status, QueueStatus::Completed);
        assert!(dir
            .path()
            .join("Done/DRAFT_PROCESSED_ODOO_DRAFT_INVOICE_3.md")
            .exists());
    }
}
