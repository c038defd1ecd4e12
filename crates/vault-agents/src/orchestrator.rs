//! Orchestrator for the approval queue
//!
//! Dispatches `Approved` items to channel processors exactly once per
//! content signature and archives `Rejected` items.

use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use vault_core::{AgentRole, Result, VaultConfig, VaultError, VaultLayout, VaultState, WorkItem};
use vault_resilience::{Execution, GracefulExecutor};
use vault_store::work_item::{archive, list, load_items};
use vault_store::{
    signature_of_file, ClaimCoordinator, ClaimedItem, DedupDecision, MoveOutcome,
    SignatureRegistry, MARKDOWN,
};

use crate::audit::AuditLog;
use crate::file_name;
use crate::processor::{ChannelProcessor, ProcessOutcome, ProcessorRegistry};
use crate::scheduler::Scheduler;

/// Claims of approved items are staged in `In_Progress/orchestrator`
pub const IDENTITY: &str = "orchestrator";

/// Number of `*.md` items per queue state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub inbox: usize,
    pub needs_action: usize,
    pub needs_action_cloud: usize,
    pub pending_approval: usize,
    pub approved: usize,
    pub rejected: usize,
    pub done: usize,
}

/// Result of one `process_approved` run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApprovedSummary {
    /// Processor name -> outcomes
    pub results: BTreeMap<String, Vec<ProcessOutcome>>,
    pub duplicates: Vec<ProcessOutcome>,
    /// Items whose kind has no processor; left in `Approved`
    pub unhandled: Vec<String>,
}

impl ApprovedSummary {
    fn push(&mut self, processor: &str, outcome: ProcessOutcome) {
        self.results
            .entry(processor.to_string())
            .or_default()
            .push(outcome);
    }

    /// Outcomes across all processors
    pub fn outcomes(&self) -> impl Iterator<Item = &ProcessOutcome> {
        self.results.values().flatten()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes().filter(|o| o.is_success()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedMove {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RejectedSummary {
    pub moved_count: usize,
    pub files: Vec<RejectedMove>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AllSummary {
    pub approved: ApprovedSummary,
    pub rejected: RejectedSummary,
}

/// An item admitted to a processor batch
struct Admitted {
    signature: String,
    claimed: ClaimedItem,
}

pub struct Orchestrator {
    layout: VaultLayout,
    config: VaultConfig,
    registry: ProcessorRegistry,
    executor: GracefulExecutor,
    claims: ClaimCoordinator,
    audit: AuditLog,
}

impl Orchestrator {
    pub fn new(layout: VaultLayout, config: VaultConfig, registry: ProcessorRegistry) -> Self {
        let executor = GracefulExecutor::open(&layout, &config);
        let claims = ClaimCoordinator::new(&layout, IDENTITY);
        let audit = AuditLog::new(&layout, IDENTITY);
        Self {
            layout,
            config,
            registry,
            executor,
            claims,
            audit,
        }
    }

    /// Build an orchestrator with the processors named in `config`
    pub fn from_config(layout: VaultLayout, config: VaultConfig) -> Result<Self> {
        let registry = ProcessorRegistry::from_config(&config)?;
        Ok(Self::new(layout, config, registry))
    }

    pub fn layout(&self) -> &VaultLayout {
        &self.layout
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &GracefulExecutor {
        &self.executor
    }

    async fn count(&self, state: VaultState) -> Result<usize> {
        Ok(list(&self.layout.dir(&state), MARKDOWN).await?.len())
    }

    /// Item counts per queue directory
    pub async fn status(&self) -> Result<QueueCounts> {
        Ok(QueueCounts {
            inbox: self.count(VaultState::Inbox).await?,
            needs_action: self.count(VaultState::NeedsAction).await?,
            needs_action_cloud: self.count(VaultState::NeedsActionCloud).await?,
            pending_approval: self.count(VaultState::PendingApproval).await?,
            approved: self.count(VaultState::Approved).await?,
            rejected: self.count(VaultState::Rejected).await?,
            done: self.count(VaultState::Done).await?,
        })
    }

    /// Dispatch every approved item to the processor for its kind.
    ///
    /// Each item is claimed into `In_Progress/orchestrator` before it is
    /// checked or sent, so concurrent orchestrators never dispatch the same
    /// file twice. Failures of one item or one batch are reported in the
    /// summary and never abort the run. The signature registry is saved once
    /// at the end.
    pub async fn process_approved(&self) -> Result<ApprovedSummary> {
        let approved_dir = self.layout.dir(&VaultState::Approved);
        let mut items = load_items(&approved_dir, MARKDOWN).await?;
        items.sort_by(|a, b| a.name.cmp(&b.name));

        let mut summary = ApprovedSummary::default();
        if items.is_empty() {
            debug!("No approved items");
            return Ok(summary);
        }

        let mut batches: BTreeMap<String, Vec<WorkItem>> = BTreeMap::new();
        for item in items {
            batches.entry(item.kind.clone()).or_default().push(item);
        }

        let mut signatures = SignatureRegistry::open(&self.layout).await?;
        for (kind, batch) in batches {
            let Some(processor) = self.registry.get(&kind) else {
                debug!("No processor for kind {}, leaving {} items", kind, batch.len());
                summary
                    .unhandled
                    .extend(batch.into_iter().map(|item| item.name));
                continue;
            };

            let name = processor.name().to_string();
            if self.config.role == AgentRole::Cloud && processor.local_only() {
                info!(processor = %name, "Cloud role may not run {}, leaving {} items", name, batch.len());
                for item in &batch {
                    summary.push(
                        &name,
                        ProcessOutcome::skipped(&item.name, &name, "Processor is local-only"),
                    );
                }
                continue;
            }

            if let Err(e) = self
                .process_batch(&kind, processor.as_ref(), batch, &mut signatures, &mut summary)
                .await
            {
                error!(processor = %name, "Batch for {} failed: {}", kind, e);
            }
        }

        signatures.flush().await?;

        info!(
            "Approved run: {} succeeded, {} duplicates, {} unhandled",
            summary.succeeded(),
            summary.duplicates.len(),
            summary.unhandled.len()
        );
        self.audit
            .record(
                "approved_processed",
                json!({
                    "succeeded": summary.succeeded(),
                    "duplicates": summary.duplicates.len(),
                    "unhandled": summary.unhandled,
                }),
            )
            .await;

        Ok(summary)
    }

    async fn process_batch(
        &self,
        kind: &str,
        processor: &dyn ChannelProcessor,
        batch: Vec<WorkItem>,
        signatures: &mut SignatureRegistry,
        summary: &mut ApprovedSummary,
    ) -> Result<()> {
        let name = processor.name().to_string();
        let required: Vec<&str> = processor
            .required_metadata()
            .iter()
            .map(String::as_str)
            .collect();

        let mut valid = Vec::new();
        let mut admitted: HashMap<String, Admitted> = HashMap::new();
        let mut seen_in_batch: HashMap<String, String> = HashMap::new();

        for mut item in batch {
            let Some(claimed) = self.claims.claim(&item.path).await.into_claimed() else {
                continue;
            };
            item.path = claimed.path.clone();

            let signature =
                match signature_of_file(&claimed.path, self.config.signature_prefix_bytes).await {
                    Ok(signature) => signature,
                    Err(e) => {
                        debug!("Skipping {}: {}", item.name, e);
                        self.release(&claimed).await;
                        continue;
                    }
                };

            if let DedupDecision::Duplicate(record) = signatures.check(&signature) {
                let archived_as = self.settle(&claimed, Some("DUPLICATE")).await;
                info!(
                    processor = %name,
                    "{} duplicates {}, archived",
                    item.name,
                    record.source_name
                );
                let outcome =
                    ProcessOutcome::duplicate(&item.name, &name, &record.source_name, archived_as);
                summary.duplicates.push(outcome.clone());
                summary.push(&name, outcome);
                continue;
            }

            if let Some(first) = seen_in_batch.get(&signature) {
                self.release(&claimed).await;
                summary.push(
                    &name,
                    ProcessOutcome::skipped(
                        &item.name,
                        &name,
                        format!("Same content as {} in this run", first),
                    ),
                );
                continue;
            }

            let missing = item.missing_fields(&required);
            if !missing.is_empty() {
                let err = VaultError::malformed(
                    &item.name,
                    format!("missing required metadata: {}", missing.join(", ")),
                );
                warn!(processor = %name, "{}", err);
                let mut outcome = ProcessOutcome::error(&item.name, &name, err.to_string());
                outcome.archived_as = self.settle(&claimed, Some("INVALID")).await;
                summary.push(&name, outcome);
                continue;
            }

            seen_in_batch.insert(signature.clone(), item.name.clone());
            admitted.insert(item.name.clone(), Admitted { signature, claimed });
            valid.push(item);
        }

        if valid.is_empty() {
            return Ok(());
        }

        let execution = match self
            .executor
            .execute(processor.service(), kind, None, || processor.process(&valid))
            .await
        {
            Ok(execution) => execution,
            Err(e) => {
                for entry in admitted.values() {
                    self.release(&entry.claimed).await;
                }
                return Err(e);
            }
        };

        let outcomes = match execution {
            Execution::Primary(outcomes) | Execution::Fallback(outcomes) => outcomes,
            Execution::Dropped { error: Some(message) } => valid
                .iter()
                .map(|item| ProcessOutcome::error(&item.name, &name, message.clone()))
                .collect(),
            Execution::Dropped { error: None } => {
                let message = format!("Service {} unavailable, left in Approved", processor.service());
                valid
                    .iter()
                    .map(|item| ProcessOutcome::skipped(&item.name, &name, message.clone()))
                    .collect()
            }
            Execution::Queued(id) => valid
                .iter()
                .map(|item| ProcessOutcome::skipped(&item.name, &name, format!("Queued as {}", id)))
                .collect(),
        };

        for mut outcome in outcomes {
            let Some(entry) = admitted.remove(&outcome.file) else {
                summary.push(&name, outcome);
                continue;
            };

            let present = tokio::fs::try_exists(&entry.claimed.path)
                .await
                .unwrap_or(true);
            if outcome.is_success() || !present {
                signatures.record(
                    entry.signature.clone(),
                    outcome.file.clone(),
                    name.clone(),
                    outcome.result_reference.clone(),
                );
            }
            if !present {
                debug!("{} was moved by {}", outcome.file, name);
            } else if outcome.is_success() {
                outcome.archived_as = self.settle(&entry.claimed, None).await;
            } else {
                self.release(&entry.claimed).await;
            }
            summary.push(&name, outcome);
        }

        // Items the processor gave no outcome for go back to Approved
        for entry in admitted.into_values() {
            self.release(&entry.claimed).await;
        }

        Ok(())
    }

    /// Archive a claimed item into `Done`. If that fails the item is
    /// released back to `Approved` rather than left in `In_Progress`.
    async fn settle(&self, claimed: &ClaimedItem, marker: Option<&str>) -> Option<String> {
        let done_dir = self.layout.dir(&VaultState::Done);
        match archive(&claimed.path, &done_dir, marker).await {
            Ok(MoveOutcome::Moved(target)) => Some(file_name(&target)),
            Ok(MoveOutcome::Vanished) => None,
            Err(e) => {
                warn!("Archive of {} failed: {}", claimed.path.display(), e);
                self.release(claimed).await;
                None
            }
        }
    }

    async fn release(&self, claimed: &ClaimedItem) {
        if let Err(e) = self.claims.release(claimed).await {
            error!("Failed to release {}: {}", claimed.path.display(), e);
        }
    }

    /// Archive every rejected item into `Done` with a `REJECTED_` prefix
    pub async fn process_rejected(&self) -> Result<RejectedSummary> {
        let rejected_dir = self.layout.dir(&VaultState::Rejected);
        let done_dir = self.layout.dir(&VaultState::Done);
        let mut paths = list(&rejected_dir, MARKDOWN).await?;
        paths.sort();

        let mut summary = RejectedSummary::default();
        for path in paths {
            let from = file_name(&path);
            match archive(&path, &done_dir, Some("REJECTED")).await {
                Ok(MoveOutcome::Moved(target)) => {
                    summary.files.push(RejectedMove {
                        from,
                        to: file_name(&target),
                    });
                }
                Ok(MoveOutcome::Vanished) => {}
                Err(e) => warn!("Failed to archive rejected {}: {}", from, e),
            }
        }
        summary.moved_count = summary.files.len();

        if summary.moved_count > 0 {
            info!("Archived {} rejected items", summary.moved_count);
            self.audit
                .record("rejected_processed", json!({ "moved_count": summary.moved_count }))
                .await;
        }
        Ok(summary)
    }

    pub async fn process_all(&self) -> Result<AllSummary> {
        let approved = self.process_approved().await?;
        let rejected = self.process_rejected().await?;
        Ok(AllSummary { approved, rejected })
    }

    /// Run `process_all` every `interval` until the scheduler stops
    pub async fn run<S: Scheduler>(&self, scheduler: &S, interval: Duration) -> Result<usize> {
        info!(
            "Orchestrator watching {} every {}s",
            self.layout.root().display(),
            interval.as_secs()
        );
        scheduler
            .run_periodically(interval, || async move {
                self.process_all().await?;
                Ok(())
            })
            .await
    }
}
