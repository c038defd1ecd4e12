//! Read/approve bridge for external front ends
//!
//! Answers list queries over queue directories with normalized summaries and
//! moves pending approvals to `Approved` or `Rejected`. Queries never fail:
//! missing or unreadable data yields empty results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use vault_core::{VaultLayout, VaultState, WorkItem};
use vault_store::work_item::{list, load_items, move_item};
use vault_store::{MoveOutcome, MARKDOWN};

use crate::file_name;

/// Characters of body text shown in a summary
pub const EXCERPT_CHARS: usize = 180;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub priority: String,
    pub status: String,
    pub excerpt: String,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: ActionStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PathBuf>,
}

impl ActionResult {
    fn error(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Error,
            message: message.into(),
            from: None,
            to: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// Map free-form priorities onto low / medium / high
pub fn normalize_priority(value: Option<&str>) -> &'static str {
    match value.unwrap_or("medium").trim().to_lowercase().as_str() {
        "low" | "p3" | "minor" => "low",
        "high" | "p1" | "urgent" | "critical" => "high",
        _ => "medium",
    }
}

/// Map free-form statuses onto pending / in_progress / approved / done
pub fn normalize_status(value: Option<&str>) -> &'static str {
    match value.unwrap_or("pending").trim().to_lowercase().as_str() {
        "in_progress" | "in progress" | "processing" => "in_progress",
        "approved" => "approved",
        "done" | "complete" | "completed" | "success" => "done",
        _ => "pending",
    }
}

/// First line of body text that is not a heading or checklist entry
fn body_excerpt(body: &str) -> String {
    body.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("- ["))
        .map(|line| {
            let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
            vault_core::excerpt(&collapsed, EXCERPT_CHARS).to_string()
        })
        .unwrap_or_else(|| "No details available.".to_string())
}

/// Query bridge over one vault
#[derive(Debug, Clone)]
pub struct QueryBridge {
    layout: VaultLayout,
}

impl QueryBridge {
    pub fn new(layout: VaultLayout) -> Self {
        Self { layout }
    }

    async fn summarize(item: WorkItem, state: &VaultState) -> ItemSummary {
        let modified = match tokio::fs::metadata(&item.path).await {
            Ok(meta) => meta.modified().ok().map(DateTime::<Utc>::from),
            Err(_) => None,
        };

        // The directory is authoritative where it implies a status
        let status = match state {
            VaultState::Approved => "approved",
            VaultState::Done => "done",
            VaultState::InProgress(_) => "in_progress",
            _ => normalize_status(item.get("status")),
        };

        let title = item
            .get("subject")
            .or_else(|| item.get("title"))
            .map(str::to_string)
            .unwrap_or_else(|| item.id.replace('_', " "));

        ItemSummary {
            created: item.created_at(),
            priority: normalize_priority(item.get("priority")).to_string(),
            status: status.to_string(),
            excerpt: body_excerpt(&item.body),
            title,
            kind: item.kind,
            id: item.id,
            modified,
        }
    }

    /// Summaries of every item in `state`, newest first
    pub async fn list(&self, state: &VaultState) -> Vec<ItemSummary> {
        let items = match load_items(&self.layout.dir(state), MARKDOWN).await {
            Ok(items) => items,
            Err(e) => {
                warn!("Listing {} failed: {}", state, e);
                return Vec::new();
            }
        };

        let mut summaries = Vec::with_capacity(items.len());
        for item in items {
            summaries.push(Self::summarize(item, state).await);
        }
        summaries.sort_by(|a, b| {
            b.created
                .or(b.modified)
                .cmp(&a.created.or(a.modified))
                .then_with(|| b.id.cmp(&a.id))
        });
        summaries
    }

    /// Locate a pending approval by id (file stem)
    async fn resolve(&self, id: &str) -> Option<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return None;
        }
        let pending = self.layout.dir(&VaultState::PendingApproval);
        let candidate = pending.join(format!("{}.md", id));
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return Some(candidate);
        }

        list(&pending, MARKDOWN)
            .await
            .ok()?
            .into_iter()
            .find(|path| path.file_stem().is_some_and(|stem| stem == id))
    }

    async fn decide(&self, id: &str, destination: VaultState) -> ActionResult {
        let Some(source) = self.resolve(id).await else {
            return ActionResult::error(format!("Approval '{}' not found", id));
        };
        let destination_dir = self.layout.dir(&destination);

        match move_item(&source, &destination_dir).await {
            Ok(MoveOutcome::Moved(target)) => {
                info!("Moved {} -> {}", source.display(), target.display());
                ActionResult {
                    status: ActionStatus::Success,
                    message: format!("Moved {} to {}", file_name(&source), file_name(&destination_dir)),
                    from: Some(source),
                    to: Some(target),
                }
            }
            Ok(MoveOutcome::Vanished) => {
                debug!("{} vanished before the move", source.display());
                ActionResult::error(format!("Approval '{}' not found", id))
            }
            Err(e) => ActionResult {
                from: Some(source),
                ..ActionResult::error(e.to_string())
            },
        }
    }

    pub async fn approve(&self, id: &str) -> ActionResult {
        self.decide(id, VaultState::Approved).await
    }

    pub async fn reject(&self, id: &str) -> ActionResult {
        self.decide(id, VaultState::Rejected).await
    }
}
