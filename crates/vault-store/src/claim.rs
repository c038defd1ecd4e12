//! Claim-by-move coordinator.
//!
//! Claiming an item means moving it into `In_Progress/<agent>`. Only one
//! unlink of a source path can succeed, so when several agents race for the
//! same item exactly one move wins and every other caller sees the source
//! vanish. All cooperating directories must live on one filesystem for this
//! to hold.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use vault_core::{Result, VaultLayout, VaultState, WorkItem};

use crate::work_item::{file_name, move_item, move_to, MoveOutcome};

/// An item this agent now exclusively owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedItem {
    /// Where the item lives now, inside `In_Progress/<agent>`
    pub path: PathBuf,
    /// Where it was claimed from
    pub claimed_from: PathBuf,
    pub agent: String,
}

impl ClaimedItem {
    pub async fn read(&self) -> Result<WorkItem> {
        WorkItem::read(&self.path).await
    }
}

/// Outcome of a claim attempt. Losing a race is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    Claimed(ClaimedItem),
    NotClaimed,
}

impl ClaimResult {
    pub fn into_claimed(self) -> Option<ClaimedItem> {
        match self {
            Self::Claimed(item) => Some(item),
            Self::NotClaimed => None,
        }
    }

    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed(_))
    }
}

/// Single-winner claim primitive for one agent
#[derive(Debug, Clone)]
pub struct ClaimCoordinator {
    agent: String,
    in_progress: PathBuf,
}

impl ClaimCoordinator {
    pub fn new(layout: &VaultLayout, agent: impl Into<String>) -> Self {
        let agent = agent.into();
        let in_progress = layout.dir(&VaultState::InProgress(agent.clone()));
        Self { agent, in_progress }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Staging directory for this agent's claims
    pub fn in_progress_dir(&self) -> &Path {
        &self.in_progress
    }

    /// Try to take exclusive ownership of the item at `path`.
    ///
    /// A vanished source means another agent won; other failures
    /// (permissions, cross-device) are logged and also count as not claimed
    /// for this cycle.
    pub async fn claim(&self, path: &Path) -> ClaimResult {
        match move_item(path, &self.in_progress).await {
            Ok(MoveOutcome::Moved(target)) => {
                info!(
                    agent = %self.agent,
                    "Claimed {} -> {}",
                    path.display(),
                    target.display()
                );
                ClaimResult::Claimed(ClaimedItem {
                    path: target,
                    claimed_from: path.to_path_buf(),
                    agent: self.agent.clone(),
                })
            }
            Ok(MoveOutcome::Vanished) => {
                debug!(agent = %self.agent, "{} already claimed elsewhere", path.display());
                ClaimResult::NotClaimed
            }
            Err(e) => {
                warn!(agent = %self.agent, "Claim of {} failed: {}", path.display(), e);
                ClaimResult::NotClaimed
            }
        }
    }

    /// Give a claimed item back to the directory it was claimed from, under
    /// its original name when that is still free.
    pub async fn release(&self, claimed: &ClaimedItem) -> Result<MoveOutcome> {
        let name = file_name(&claimed.claimed_from)?;
        let origin = claimed
            .claimed_from
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let outcome = move_to(&claimed.path, &origin, &name).await?;
        if let MoveOutcome::Moved(target) = &outcome {
            info!(agent = %self.agent, "Released {}", target.display());
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_item::create;
    use tempfile::TempDir;
    use vault_core::Metadata;

    #[tokio::test]
    async fn test_claim_moves_into_in_progress() {
        let temp_dir = TempDir::new().unwrap();
        let layout = VaultLayout::new(temp_dir.path());
        let source = create(
            &layout.dir(&VaultState::NeedsAction),
            "TASK_1.md",
            &Metadata::new().with("type", "email"),
            "body",
        )
        .await
        .unwrap();

        let coordinator = ClaimCoordinator::new(&layout, "cloud");
        let claimed = coordinator.claim(&source).await.into_claimed().unwrap();

        assert_eq!(
            claimed.path,
            layout
                .dir(&VaultState::InProgress("cloud".into()))
                .join("TASK_1.md")
        );
        assert_eq!(claimed.claimed_from, source);
        assert!(!source.exists());
        assert_eq!(claimed.read().await.unwrap().get("type"), Some("email"));
    }

    #[tokio::test]
    async fn test_release_returns_item() {
        let temp_dir = TempDir::new().unwrap();
        let layout = VaultLayout::new(temp_dir.path());
        let source = create(
            &layout.dir(&VaultState::Approved),
            "EMAIL_SEND_1.md",
            &Metadata::new(),
            "body",
        )
        .await
        .unwrap();

        let coordinator = ClaimCoordinator::new(&layout, "orchestrator");
        let claimed = coordinator.claim(&source).await.into_claimed().unwrap();
        assert!(!source.exists());

        let outcome = coordinator.release(&claimed).await.unwrap();
        assert_eq!(outcome, MoveOutcome::Moved(source.clone()));
        assert!(!claimed.path.exists());
        assert!(coordinator.claim(&source).await.is_claimed());
    }

    #[tokio::test]
    async fn test_second_claim_is_not_claimed() {
        let temp_dir = TempDir::new().unwrap();
        let layout = VaultLayout::new(temp_dir.path());
        let source = create(
            &layout.dir(&VaultState::NeedsActionCloud),
            "DRAFT_1.md",
            &Metadata::new(),
            "body",
        )
        .await
        .unwrap();

        let local = ClaimCoordinator::new(&layout, "local");
        let cloud = ClaimCoordinator::new(&layout, "cloud");

        assert!(local.claim(&source).await.is_claimed());
        assert_eq!(cloud.claim(&source).await, ClaimResult::NotClaimed);
    }
}
