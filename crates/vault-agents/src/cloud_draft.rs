//! Cloud draft worker
//!
//! Draft-only producer. Claims raw tasks from the top level of
//! `Needs_Action`, writes a draft for each into `Needs_Action/cloud` for the
//! local executive to review, and never performs a side effect itself.

use chrono::Local;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};
use vault_core::{excerpt, Metadata, Result, VaultError, VaultLayout, VaultState, WorkItem};
use vault_store::work_item::{archive, create, list, sorted_by_name};
use vault_store::{ClaimCoordinator, ClaimedItem, MARKDOWN};

use crate::audit::AuditLog;
use crate::file_name;
use crate::scheduler::Scheduler;

/// Identity of the cloud agents
pub const IDENTITY: &str = "cloud";

/// Characters of the original task quoted in a draft
pub const ORIGINAL_EXCERPT_CHARS: usize = 1200;

const SOCIAL_TYPES: [&str; 5] = ["twitter", "facebook", "instagram", "linkedin", "social"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DraftCreated {
    pub task: String,
    pub draft: String,
}

fn draft_block(task_type: &str, item: &WorkItem) -> String {
    if task_type.contains("email") {
        format!(
            "## Draft Reply (Cloud Draft-Only)\n\n\
             Subject: Re: {}\n\n\
             Hello,\n\n\
             Thanks for your message. I reviewed your request and prepared a draft response. \
             Please confirm any details you want me to include before sending.\n\n\
             Best regards,\n\
             Assistant (Draft)\n",
            item.get("subject").unwrap_or("Your request")
        )
    } else if SOCIAL_TYPES.iter().any(|social| task_type.contains(social)) {
        "## Draft Social Response/Post (Cloud Draft-Only)\n\n\
         Draft caption/reply:\n\
         \"Thanks for reaching out. Happy to help. Please share a bit more detail and \
         we will follow up shortly.\"\n\n\
         Suggested hashtags: #Support #Business #Update\n"
            .to_string()
    } else {
        "## Draft Action Plan (Cloud Draft-Only)\n\n\
         1. Confirm scope and expected output\n\
         2. Validate required data and deadlines\n\
         3. Prepare final response for Local approval\n"
            .to_string()
    }
}

/// Metadata and body of the draft for `item`
pub fn build_draft(item: &WorkItem) -> (Metadata, String) {
    let task_type = item.get("type").unwrap_or("task").to_lowercase();
    let metadata = Metadata::new()
        .with("type", "cloud_draft")
        .with("source", item.get("source").unwrap_or("cloud_worker"))
        .with("priority", item.get("priority").unwrap_or("P3"))
        .with("created", Local::now().to_rfc3339())
        .with("status", "pending")
        .with("agent", IDENTITY)
        .with("original_task", item.name.as_str());

    let original = if item.body.trim().is_empty() {
        "_No body found._"
    } else {
        excerpt(&item.body, ORIGINAL_EXCERPT_CHARS)
    };
    let body = format!(
        "## Context\n\nOriginal task file: `{}`\n\n{}\n## Original Excerpt\n\n{}\n",
        item.name,
        draft_block(&task_type, item),
        original
    );
    (metadata, body)
}

pub struct CloudDraftWorker {
    layout: VaultLayout,
    claims: ClaimCoordinator,
    audit: AuditLog,
}

impl CloudDraftWorker {
    pub fn new(layout: VaultLayout) -> Self {
        Self {
            claims: ClaimCoordinator::new(&layout, IDENTITY),
            audit: AuditLog::new(&layout, "cloud_draft_worker"),
            layout,
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.layout.ensure_dirs(&[IDENTITY]).await?;
        info!("Cloud draft worker started on {}", self.layout.root().display());
        Ok(())
    }

    /// Claim every raw task and draft it
    pub async fn cycle(&self) -> Result<Vec<DraftCreated>> {
        let needs_action = self.layout.dir(&VaultState::NeedsAction);
        let mut drafted = Vec::new();

        for path in sorted_by_name(list(&needs_action, MARKDOWN).await?) {
            if file_name(&path).starts_with("DRAFT_") {
                continue;
            }
            let Some(claimed) = self.claims.claim(&path).await.into_claimed() else {
                continue;
            };
            match self.draft(&claimed).await {
                Ok(created) => {
                    info!("Drafted {} from {}", created.draft, created.task);
                    drafted.push(created);
                }
                Err(e) => {
                    warn!("Drafting {} failed: {}", claimed.path.display(), e);
                    if let Err(e) = self.claims.release(&claimed).await {
                        warn!("Failed to release {}: {}", claimed.path.display(), e);
                    }
                }
            }
        }

        if !drafted.is_empty() {
            self.audit
                .record("drafts_created", json!({ "drafts": drafted }))
                .await;
        }
        Ok(drafted)
    }

    async fn draft(&self, claimed: &ClaimedItem) -> Result<DraftCreated> {
        let item = claimed.read().await?;
        let (metadata, body) = build_draft(&item);

        let cloud_dir = self.layout.dir(&VaultState::NeedsActionCloud);
        let draft_name = format!("DRAFT_{}.md", item.id);
        let draft = match create(&cloud_dir, &draft_name, &metadata, &body).await {
            Err(VaultError::AlreadyExists(_)) => {
                let retry_name =
                    format!("DRAFT_{}_{}.md", item.id, Local::now().format("%H%M%S"));
                create(&cloud_dir, &retry_name, &metadata, &body).await?
            }
            other => other?,
        };

        let done_dir = self.layout.dir(&VaultState::Done);
        if let Err(e) = archive(&claimed.path, &done_dir, Some("DRAFTED")).await {
            // The task goes back to Needs_Action, so drop its draft
            if let Err(e) = fs::remove_file(&draft).await {
                warn!("Failed to remove draft {}: {}", draft.display(), e);
            }
            return Err(e);
        }

        Ok(DraftCreated {
            task: item.name,
            draft: file_name(&draft),
        })
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
    use tempfile::TempDir;

    fn task(meta: Metadata, body: &str) -> WorkItem {
        WorkItem::parse(
            "/vault/Needs_Action/EMAIL_20250101_000000.md",
            &vault_core::render_work_item(&meta, body),
        )
    }

    #[test]
    fn test_email_draft() {
        let item = task(
            Metadata::new()
                .with("type", "email")
                .with("subject", "Invoice question")
                .with("priority", "P1"),
            "Where is my invoice?",
        );
        let (meta, body) = build_draft(&item);

        assert_eq!(meta.get("type"), Some("cloud_draft"));
        assert_eq!(meta.get("priority"), Some("P1"));
        assert_eq!(meta.get("source"), Some("cloud_worker"));
        assert_eq!(meta.get("original_task"), Some("EMAIL_20250101_000000.md"));
        assert!(body.contains("Subject: Re: Invoice question"));
        assert!(body.contains("Where is my invoice?"));
    }

    #[test]
    fn test_social_and_generic_drafts() {
        let (_, body) = build_draft(&task(Metadata::new().with("type", "LinkedIn_Post"), "hi"));
        assert!(body.contains("Draft Social Response/Post"));

        let (meta, body) = build_draft(&task(Metadata::new(), ""));
        assert_eq!(meta.get("priority"), Some("P3"));
        assert!(body.contains("Draft Action Plan"));
        assert!(body.contains("_No body found._"));
    }

    #[tokio::test]
    async fn test_cycle_claims_and_drafts() {
        let dir = TempDir::new().unwrap();
        let layout = VaultLayout::new(dir.path());
        let worker = CloudDraftWorker::new(layout.clone());
        worker.start().await.unwrap();

        let needs_action = layout.dir(&VaultState::NeedsAction);
        create(&needs_action, "EMAIL_1.md", &Metadata::new().with("type", "email"), "hello")
            .await
            .unwrap();
        create(&needs_action, "DRAFT_OLD.md", &Metadata::new(), "skip me")
            .await
            .unwrap();

        let drafted = worker.cycle().await.unwrap();

        assert_eq!(
            drafted,
            vec![DraftCreated {
                task: "EMAIL_1.md".into(),
                draft: "DRAFT_EMAIL_1.md".into()
            }]
        );
        assert!(layout
            .dir(&VaultState::NeedsActionCloud)
            .join("DRAFT_EMAIL_1.md")
            .exists());
        assert!(layout.dir(&VaultState::Done).join("DRAFTED_EMAIL_1.md").exists());
        assert!(needs_action.join("DRAFT_OLD.md").exists());
        assert!(!needs_action.join("EMAIL_1.md").exists());
    }

    #[tokio::test]
    async fn test_failed_draft_returns_task() {
        let dir = TempDir::new().unwrap();
        let layout = VaultLayout::new(dir.path());
        let worker = CloudDraftWorker::new(layout.clone());

        let needs_action = layout.dir(&VaultState::NeedsAction);
        create(&needs_action, "EMAIL_2.md", &Metadata::new().with("type", "email"), "hi")
            .await
            .unwrap();
        // Drafts cannot be written when Needs_Action/cloud is a plain file
        std::fs::write(layout.dir(&VaultState::NeedsActionCloud), "").unwrap();

        let drafted = worker.cycle().await.unwrap();

        assert!(drafted.is_empty());
        assert!(needs_action.join("EMAIL_2.md").exists());
        assert!(list(&layout.dir(&VaultState::InProgress(IDENTITY.into())), MARKDOWN)
            .await
            .unwrap()
            .is_empty());
    }
}
