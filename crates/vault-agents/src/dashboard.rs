//! Dashboard artifact
//!
//! `Dashboard.md` summarizes queue depths for the human operator. It is an
//! aggregate of the whole vault, so only the single-writer lock owner
//! regenerates it.

use chrono::{DateTime, Local};
use std::fmt;
use std::path::PathBuf;
use tokio::fs;
use vault_core::{tail, Result, VaultLayout};
use vault_store::SingleWriterLock;

use crate::orchestrator::QueueCounts;

/// Heading of the merged cloud updates section
pub const CLOUD_UPDATES_HEADING: &str = "## Cloud Updates (Merged by Local Executive)";

/// Characters of merged updates shown on the dashboard
pub const MERGED_EXCERPT_CHARS: usize = 5000;

/// Log file that accumulates merged `Updates/` batches
pub const MERGED_UPDATES_FILE: &str = "merged_updates.md";

fn indicator(count: usize) -> &'static str {
    match count {
        0 => "✅ Clear",
        1..=5 => "⚠️ Needs Attention",
        _ => "🔴 Action Required",
    }
}

/// Dashboard contents for one moment in time
pub struct Dashboard<'a> {
    pub counts: &'a QueueCounts,
    /// The full merged-updates log; only its tail is shown
    pub merged_updates: Option<&'a str>,
    pub now: DateTime<Local>,
}

impl fmt::Display for Dashboard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = self.counts;
        let stamp = self.now.format("%Y-%m-%d %H:%M");

        writeln!(f, "---")?;
        writeln!(f, "last_updated: {}", self.now.to_rfc3339())?;
        writeln!(f, "status: active")?;
        writeln!(f, "---")?;
        writeln!(f)?;
        writeln!(f, "# Vault Dashboard")?;
        writeln!(f)?;
        writeln!(f, "## Quick Status")?;
        writeln!(f, "| Category | Count | Status |")?;
        writeln!(f, "|----------|-------|--------|")?;
        writeln!(f, "| Inbox | {} | {} |", counts.inbox, indicator(counts.inbox))?;
        writeln!(
            f,
            "| Needs Action | {} | {} |",
            counts.needs_action,
            indicator(counts.needs_action)
        )?;
        writeln!(f, "| Done | {} | - |", counts.done)?;
        writeln!(
            f,
            "| Pending Approval | {} | {} |",
            counts.pending_approval,
            indicator(counts.pending_approval)
        )?;
        writeln!(f)?;
        writeln!(f, "## Recent Activity")?;
        writeln!(f, "- [{}] Dashboard regenerated by local executive", stamp)?;
        writeln!(f)?;
        writeln!(f, "## Alerts")?;

        if counts.needs_action > 10 {
            writeln!(
                f,
                "- 🔴 High volume: {} items in Needs_Action",
                counts.needs_action
            )?;
        }
        if counts.pending_approval > 0 {
            writeln!(f, "- ⚠️ {} items awaiting approval", counts.pending_approval)?;
        }
        if counts.inbox > 0 {
            writeln!(f, "- 📥 {} new items in Inbox", counts.inbox)?;
        }
        if counts.needs_action == 0 && counts.pending_approval == 0 && counts.inbox == 0 {
            writeln!(f, "- ✅ All clear!")?;
        }

        if let Some(merged) = self.merged_updates.filter(|m| !m.trim().is_empty()) {
            writeln!(f)?;
            writeln!(f, "{}", CLOUD_UPDATES_HEADING)?;
            writeln!(f)?;
            writeln!(f, "{}", tail(merged, MERGED_EXCERPT_CHARS).trim_end())?;
        }

        writeln!(f)?;
        writeln!(f, "---")?;
        writeln!(f, "*Last regenerated: {}*", stamp)
    }
}

/// Render the dashboard.
///
/// `merged_updates` is the full merged-updates log; only its tail is shown.
pub fn render_dashboard(
    counts: &QueueCounts,
    merged_updates: Option<&str>,
    now: DateTime<Local>,
) -> String {
    Dashboard {
        counts,
        merged_updates,
        now,
    }
    .to_string()
}

/// Regenerates `Dashboard.md` through the single-writer lock
pub struct DashboardWriter {
    lock: SingleWriterLock,
    dashboard: PathBuf,
    merged_updates: PathBuf,
}

impl DashboardWriter {
    pub fn new(layout: &VaultLayout) -> Self {
        Self {
            lock: SingleWriterLock::new(layout),
            dashboard: layout.dashboard_path(),
            merged_updates: layout.logs_dir().join(MERGED_UPDATES_FILE),
        }
    }

    pub fn lock(&self) -> &SingleWriterLock {
        &self.lock
    }

    /// Write the dashboard if `identity` owns the lock; returns whether it wrote
    pub async fn regenerate(&self, identity: &str, counts: &QueueCounts) -> Result<bool> {
        let merged = match fs::read_to_string(&self.merged_updates).await {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        self.lock
            .write_if_owner(identity, &self.dashboard, || {
                render_dashboard(counts, merged.as_deref(), Local::now())
            })
            .await
    }
}
