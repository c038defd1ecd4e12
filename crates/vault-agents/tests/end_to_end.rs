//! End-to-end flows across the whole vault: hand-off, approval, dispatch,
//! duplicate detection and the single-writer dashboard.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use vault_agents::{
    ChannelProcessor, CloudDraftWorker, DashboardWriter, LocalExecutive, Orchestrator,
    OutcomeStatus, ProcessOutcome, ProcessorRegistry, QueryBridge, QueueCounts,
};
use vault_core::{Metadata, Result, VaultConfig, VaultLayout, VaultState, WorkItem};
use vault_store::work_item::create;
use vault_store::SignatureRegistry;

/// Mail processor that counts invocations
#[derive(Default)]
struct CountingMailer {
    calls: AtomicUsize,
    required: Vec<String>,
}

#[async_trait]
impl ChannelProcessor for CountingMailer {
    fn name(&self) -> &str {
        "email"
    }

    fn service(&self) -> &str {
        "gmail"
    }

    fn required_metadata(&self) -> &[String] {
        &self.required
    }

    async fn process(&self, items: &[WorkItem]) -> Result<Vec<ProcessOutcome>> {
        self.calls.fetch_add(items.len(), Ordering::SeqCst);
        Ok(items
            .iter()
            .map(|item| ProcessOutcome::success(&item.name, "email", Some(format!("msg-{}", item.id))))
            .collect())
    }
}

fn setup() -> (TempDir, VaultLayout, Arc<CountingMailer>, Orchestrator) {
    let dir = TempDir::new().unwrap();
    let layout = VaultLayout::new(dir.path());
    let mailer = Arc::new(CountingMailer {
        required: vec!["to".to_string(), "subject".to_string()],
        ..CountingMailer::default()
    });
    let mut registry = ProcessorRegistry::new();
    registry.register(&["email-send"], mailer.clone());
    let orchestrator = Orchestrator::new(layout.clone(), VaultConfig::default(), registry);
    (dir, layout, mailer, orchestrator)
}

fn email_meta() -> Metadata {
    Metadata::new()
        .with("type", "email_send")
        .with("to", "client@example.com")
        .with("subject", "Quarterly report")
        .with("created", "2025-01-01T00:00:00Z")
}

#[tokio::test]
async fn test_approved_email_is_sent_once() {
    let (_dir, layout, mailer, orchestrator) = setup();
    let approved = layout.dir(&VaultState::Approved);
    let name = "EMAIL_SEND_20250101_000000.md";
    create(&approved, name, &email_meta(), "Please find the report attached.")
        .await
        .unwrap();

    let summary = orchestrator.process_approved().await.unwrap();

    assert_eq!(mailer.calls.load(Ordering::SeqCst), 1);
    let outcome = &summary.results["email"][0];
    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(outcome.result_reference.as_deref(), Some("msg-EMAIL_SEND_20250101_000000"));
    assert!(!approved.join(name).exists());
    assert!(layout.dir(&VaultState::Done).join(name).exists());

    let registry = SignatureRegistry::open(&layout).await.unwrap();
    assert_eq!(registry.len(), 1);

    // An identical copy re-inserted later is a duplicate
    create(&approved, name, &email_meta(), "Please find the report attached.")
        .await
        .unwrap();
    let summary = orchestrator.process_approved().await.unwrap();

    assert_eq!(mailer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(summary.duplicates.len(), 1);
    assert_eq!(summary.duplicates[0].status, OutcomeStatus::SkippedDuplicate);
    assert_eq!(summary.duplicates[0].original_file.as_deref(), Some(name));
    assert!(layout
        .dir(&VaultState::Done)
        .join(format!("DUPLICATE_{}", name))
        .exists());
    assert!(!approved.join(name).exists());
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let (_dir, layout, mailer, orchestrator) = setup();
    create(
        &layout.dir(&VaultState::Approved),
        "EMAIL_SEND_20250102_000000.md",
        &email_meta(),
        "body",
    )
    .await
    .unwrap();

    orchestrator.process_approved().await.unwrap();
    let summary = orchestrator.process_approved().await.unwrap();

    assert_eq!(mailer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(summary.outcomes().count(), 0);
}

#[tokio::test]
async fn test_task_to_done_through_every_agent() {
    let (_dir, layout, mailer, orchestrator) = setup();
    let executive = LocalExecutive::new(orchestrator).unwrap();
    executive.start().await.unwrap();
    let drafts = CloudDraftWorker::new(layout.clone());

    create(
        &layout.dir(&VaultState::NeedsAction),
        "EMAIL_20250103_090000.md",
        &Metadata::new().with("type", "email").with("subject", "Meeting"),
        "Can we meet on Friday?",
    )
    .await
    .unwrap();

    // Cloud drafts the reply, local turns the draft into a review item
    let drafted = drafts.cycle().await.unwrap();
    assert_eq!(drafted.len(), 1);
    let report = executive.cycle().await.unwrap();
    assert_eq!(report.handed_off.len(), 1);

    let bridge = QueryBridge::new(layout.clone());
    let pending = bridge.list(&VaultState::PendingApproval).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, report.handed_off[0].review.trim_end_matches(".md"));

    // A human approves; the review kind has no processor so it waits in Approved
    assert!(bridge.approve(&pending[0].id).await.is_success());
    let report = executive.cycle().await.unwrap();
    assert_eq!(report.actions.approved.unhandled.len(), 1);
    assert_eq!(mailer.calls.load(Ordering::SeqCst), 0);

    let counts = executive.orchestrator().status().await.unwrap();
    assert_eq!(
        counts,
        QueueCounts {
            approved: 1,
            done: 2,
            ..QueueCounts::default()
        }
    );
}

#[tokio::test]
async fn test_dashboard_only_written_by_owner() {
    let (_dir, layout, _mailer, orchestrator) = setup();
    let executive = LocalExecutive::new(orchestrator).unwrap();
    executive.start().await.unwrap();

    std::fs::write(layout.dashboard_path(), "operator notes").unwrap();
    let before = std::fs::read(layout.dashboard_path()).unwrap();

    let writer = DashboardWriter::new(&layout);
    let wrote = writer
        .regenerate("cloud", &QueueCounts::default())
        .await
        .unwrap();

    assert!(!wrote);
    assert_eq!(std::fs::read(layout.dashboard_path()).unwrap(), before);
}
