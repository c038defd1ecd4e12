//! Local executive agent
//!
//! The full-trust agent. Each cycle it
//!
//! 1. re-asserts ownership of the dashboard lock
//! 2. claims cloud drafts from `Needs_Action/cloud` and turns each into a
//!    review item in `Pending_Approval`
//! 3. merges `Updates/` into `Logs/merged_updates.md`
//! 4. regenerates `Dashboard.md`
//! 5. runs the orchestrator over `Approved` and `Rejected`

use chrono::Local;
use glob::Pattern;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use vault_core::{excerpt, AgentRole, Metadata, Result, VaultError, VaultLayout, VaultState};
use vault_store::work_item::{archive, create, list, sorted_by_name, with_timestamp_suffix};
use vault_store::{ClaimCoordinator, ClaimedItem, MoveOutcome, MARKDOWN};

use crate::audit::AuditLog;
use crate::dashboard::{DashboardWriter, MERGED_UPDATES_FILE};
use crate::file_name;
use crate::orchestrator::{AllSummary, Orchestrator};
use crate::scheduler::Scheduler;

/// Identity the local executive asserts on the dashboard lock
pub const IDENTITY: &str = "local";

/// Characters of the cloud draft copied into a review item
pub const REVIEW_EXCERPT_CHARS: usize = 4000;

/// Characters of each update copied into the merged log
pub const UPDATE_EXCERPT_CHARS: usize = 1200;

/// One cloud draft turned into a review item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandOff {
    pub draft: String,
    pub review: String,
    pub archived_as: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LocalCycleReport {
    pub handed_off: Vec<HandOff>,
    pub merged_updates: usize,
    pub dashboard_written: bool,
    pub actions: AllSummary,
}

pub struct LocalExecutive {
    orchestrator: Orchestrator,
    claims: ClaimCoordinator,
    dashboard: DashboardWriter,
    audit: AuditLog,
    integration_patterns: Vec<Pattern>,
}

impl LocalExecutive {
    pub fn new(orchestrator: Orchestrator) -> Result<Self> {
        if orchestrator.config().role != AgentRole::Local {
            return Err(VaultError::Config(
                "The local executive must run with the local role".to_string(),
            ));
        }

        let integration_patterns = orchestrator
            .config()
            .cloud_integration
            .patterns
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map_err(|e| VaultError::Config(format!("Invalid pattern {:?}: {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let layout = orchestrator.layout();
        Ok(Self {
            claims: ClaimCoordinator::new(layout, IDENTITY),
            dashboard: DashboardWriter::new(layout),
            audit: AuditLog::new(layout, "local_executive"),
            integration_patterns,
            orchestrator,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    fn layout(&self) -> &VaultLayout {
        self.orchestrator.layout()
    }

    /// Create the vault directories and take the dashboard lock
    pub async fn start(&self) -> Result<()> {
        self.layout().ensure_dirs(&[IDENTITY]).await?;
        self.dashboard.lock().assert_owner(IDENTITY).await?;
        info!(
            "Local executive started on {} (single writer)",
            self.layout().root().display()
        );
        Ok(())
    }

    /// Items the cloud integration worker owns stay where they are
    fn is_integration_item(&self, name: &str) -> bool {
        self.integration_patterns.iter().any(|p| p.matches(name))
    }

    /// Claim cloud drafts and queue a local review for each
    pub async fn hand_off(&self) -> Result<Vec<HandOff>> {
        let cloud_dir = self.layout().dir(&VaultState::NeedsActionCloud);
        let mut handed_off = Vec::new();

        for path in sorted_by_name(list(&cloud_dir, MARKDOWN).await?) {
            if self.is_integration_item(&file_name(&path)) {
                continue;
            }
            let Some(claimed) = self.claims.claim(&path).await.into_claimed() else {
                continue;
            };
            match self.review(&claimed).await {
                Ok(handoff) => {
                    info!("Handed off {} as {}", handoff.draft, handoff.review);
                    handed_off.push(handoff);
                }
                Err(e) => {
                    warn!("Hand-off of {} failed: {}", claimed.path.display(), e);
                    if let Err(e) = self.claims.release(&claimed).await {
                        warn!("Failed to release {}: {}", claimed.path.display(), e);
                    }
                }
            }
        }

        Ok(handed_off)
    }

    async fn review(&self, claimed: &ClaimedItem) -> Result<HandOff> {
        let bytes = fs::read(&claimed.path).await?;
        let raw = String::from_utf8_lossy(&bytes);
        let draft_name = file_name(&claimed.path);
        let stem = draft_name.strip_suffix(".md").unwrap_or(&draft_name);

        let now = Local::now();
        let review_name = format!("LOCAL_REVIEW_{}_{}.md", stem, now.format("%H%M%S"));
        let metadata = Metadata::new()
            .with("type", "local_review_approval")
            .with("source", "local_executive_agent")
            .with("created", now.to_rfc3339())
            .with("status", "pending")
            .with("owner", IDENTITY)
            .with("original_file", draft_name.as_str());
        let body = format!(
            "## Local Executive Review Required\n\n\
             This item originated from `Needs_Action/cloud/` and was claimed by the local executive.\n\n\
             ### Action\n\
             - Review this draft\n\
             - Move to `Approved/` if execution should proceed\n\
             - Move to `Rejected/` if declined\n\n\
             ## Original Cloud Draft\n\n{}\n",
            excerpt(&raw, REVIEW_EXCERPT_CHARS)
        );

        let pending_dir = self.layout().dir(&VaultState::PendingApproval);
        let review = match create(&pending_dir, &review_name, &metadata, &body).await {
            Err(VaultError::AlreadyExists(_)) => {
                create(&pending_dir, &with_timestamp_suffix(&review_name), &metadata, &body).await?
            }
            other => other?,
        };

        let done_dir = self.layout().dir(&VaultState::Done);
        let archived = match archive(&claimed.path, &done_dir, Some("CLOUD_CLAIMED")).await {
            Ok(archived) => archived,
            Err(e) => {
                // The draft goes back to the cloud queue, so drop its review
                if let Err(e) = fs::remove_file(&review).await {
                    warn!("Failed to remove review {}: {}", review.display(), e);
                }
                return Err(e);
            }
        };

        Ok(HandOff {
            draft: draft_name.clone(),
            review: file_name(&review),
            archived_as: archived.path().map(file_name),
        })
    }

    /// Append every file in `Updates/` to the merged log and archive it
    pub async fn merge_updates(&self) -> Result<usize> {
        let updates = sorted_by_name(list(&self.layout().updates_dir(), "*").await?);
        if updates.is_empty() {
            return Ok(0);
        }

        let done_dir = self.layout().dir(&VaultState::Done);
        let now = Local::now();
        let mut lines = String::new();
        let mut merged = 0;

        for path in updates {
            let payload = match fs::read(&path).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    debug!("Skipping update {}: {}", path.display(), e);
                    continue;
                }
            };
            let name = file_name(&path);
            match archive(&path, &done_dir, Some("MERGED_UPDATE")).await {
                Ok(MoveOutcome::Moved(_)) => {}
                Ok(MoveOutcome::Vanished) => continue,
                Err(e) => {
                    warn!("Failed to archive update {}: {}", name, e);
                    continue;
                }
            }

            lines.push_str(&format!(
                "- **{}** `{}`\n\n{}\n\n",
                now.format("%Y-%m-%d %H:%M"),
                name,
                excerpt(&payload, UPDATE_EXCERPT_CHARS)
            ));
            merged += 1;
        }

        if merged == 0 {
            return Ok(0);
        }

        fs::create_dir_all(self.layout().logs_dir()).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(merged_updates_path(self.layout()))
            .await?;
        file.write_all(format!("## Batch {}\n\n{}\n", now.to_rfc3339(), lines).as_bytes())
            .await?;

        info!("Merged {} updates", merged);
        Ok(merged)
    }

    /// One full local cycle
    pub async fn cycle(&self) -> Result<LocalCycleReport> {
        self.dashboard.lock().assert_owner(IDENTITY).await?;

        let handed_off = self.hand_off().await?;
        let merged_updates = self.merge_updates().await?;
        let counts = self.orchestrator.status().await?;
        let dashboard_written = self.dashboard.regenerate(IDENTITY, &counts).await?;
        let actions = self.orchestrator.process_all().await?;

        self.audit
            .record(
                "local_cycle",
                json!({
                    "handed_off": handed_off.len(),
                    "merged_updates": merged_updates,
                    "pending_approval": counts.pending_approval,
                    "cloud_queue": counts.needs_action_cloud,
                    "approved_succeeded": actions.approved.succeeded(),
                }),
            )
            .await;

        Ok(LocalCycleReport {
            handed_off,
            merged_updates,
            dashboard_written,
            actions,
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

fn merged_updates_path(layout: &VaultLayout) -> PathBuf {
    layout.logs_dir().join(MERGED_UPDATES_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorRegistry;
    use tempfile::TempDir;
    use vault_core::{VaultConfig, WorkItem};

    fn executive(dir: &TempDir) -> LocalExecutive {
        let orchestrator = Orchestrator::new(
            VaultLayout::new(dir.path()),
            VaultConfig::default(),
            ProcessorRegistry::new(),
        );
        LocalExecutive::new(orchestrator).unwrap()
    }

    #[tokio::test]
    async fn test_hand_off_creates_review() {
        let dir = TempDir::new().unwrap();
        let exec = executive(&dir);
        let layout = VaultLayout::new(dir.path());
        let cloud_dir = layout.dir(&VaultState::NeedsActionCloud);
        create(
            &cloud_dir,
            "DRAFT_EMAIL_1.md",
            &Metadata::new().with("type", "cloud_draft"),
            "Draft reply",
        )
        .await
        .unwrap();
        create(&cloud_dir, "ODOO_DRAFT_INVOICE_1.md", &Metadata::new(), "invoice")
            .await
            .unwrap();

        let handed_off = exec.hand_off().await.unwrap();

        assert_eq!(handed_off.len(), 1);
        assert_eq!(handed_off[0].draft, "DRAFT_EMAIL_1.md");
        assert!(handed_off[0].review.starts_with("LOCAL_REVIEW_DRAFT_EMAIL_1_"));
        assert_eq!(
            handed_off[0].archived_as.as_deref(),
            Some("CLOUD_CLAIMED_DRAFT_EMAIL_1.md")
        );
        // Integration items are left for the cloud integration worker
        assert!(cloud_dir.join("ODOO_DRAFT_INVOICE_1.md").exists());

        let review = WorkItem::read(
            &layout
                .dir(&VaultState::PendingApproval)
                .join(&handed_off[0].review),
        )
        .await
        .unwrap();
        assert_eq!(review.get("type"), Some("local_review_approval"));
        assert_eq!(review.get("owner"), Some("local"));
        assert_eq!(review.get("original_file"), Some("DRAFT_EMAIL_1.md"));
        assert!(review.body.contains("Draft reply"));
    }

    #[tokio::test]
    async fn test_failed_hand_off_returns_draft() {
        let dir = TempDir::new().unwrap();
        let exec = executive(&dir);
        let layout = VaultLayout::new(dir.path());
        let cloud_dir = layout.dir(&VaultState::NeedsActionCloud);
        create(&cloud_dir, "DRAFT_EMAIL_2.md", &Metadata::new(), "Draft reply")
            .await
            .unwrap();
        std::fs::write(layout.dir(&VaultState::Done), "").unwrap();

        let handed_off = exec.hand_off().await.unwrap();

        assert!(handed_off.is_empty());
        assert!(cloud_dir.join("DRAFT_EMAIL_2.md").exists());
        assert!(list(&layout.dir(&VaultState::InProgress(IDENTITY.into())), MARKDOWN)
            .await
            .unwrap()
            .is_empty());
        assert!(list(&layout.dir(&VaultState::PendingApproval), MARKDOWN)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_merge_updates() {
        let dir = TempDir::new().unwrap();
        let exec = executive(&dir);
        let layout = VaultLayout::new(dir.path());
        std::fs::create_dir_all(layout.updates_dir()).unwrap();
        std::fs::write(layout.updates_dir().join("status_a.md"), "cloud ok").unwrap();
        std::fs::write(layout.updates_dir().join("status_b.txt"), "x".repeat(2000)).unwrap();

        assert_eq!(exec.merge_updates().await.unwrap(), 2);
        assert_eq!(exec.merge_updates().await.unwrap(), 0);

        let merged = std::fs::read_to_string(merged_updates_path(&layout)).unwrap();
        assert!(merged.starts_with("## Batch "));
        assert!(merged.contains("`status_a.md`"));
        assert!(merged.contains("cloud ok"));
        assert!(!merged.contains(&"x".repeat(1201)));
        assert!(layout
            .dir(&VaultState::Done)
            .join("MERGED_UPDATE_status_a.md")
            .exists());
    }

    #[tokio::test]
    async fn test_cycle_owns_dashboard() {
        let dir = TempDir::new().unwrap();
        let exec = executive(&dir);
        exec.start().await.unwrap();

        let report = exec.cycle().await.unwrap();

        assert!(report.dashboard_written);
        let layout = VaultLayout::new(dir.path());
        assert!(layout.dashboard_path().exists());
        let lock = vault_store::SingleWriterLock::new(&layout);
        assert_eq!(lock.current().await.unwrap().owner, "local");
    }

    #[test]
    fn test_cloud_role_rejected() {
        let dir = TempDir::new().unwrap();
        let config = VaultConfig {
            role: AgentRole::Cloud,
            ..VaultConfig::default()
        };
        let orchestrator =
            Orchestrator::new(VaultLayout::new(dir.path()), config, ProcessorRegistry::new());
        assert!(matches!(
            LocalExecutive::new(orchestrator),
            Err(VaultError::Config(_))
        ));
    }
}
