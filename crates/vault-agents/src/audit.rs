//! Audit log - one JSON object per line in `Logs/<YYYY-MM-DD>.jsonl`
//!
//! Records agent cycle outcomes for humans reviewing what the agents did.
//! Every write is fail-open: a full disk or read-only vault must never stop
//! an agent cycle.

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use vault_core::fail_open::fail_open;
use vault_core::{Result, VaultLayout};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action_type: String,
    pub component: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Append-only audit log for one component
#[derive(Debug, Clone)]
pub struct AuditLog {
    logs_dir: PathBuf,
    component: String,
}

impl AuditLog {
    pub fn new(layout: &VaultLayout, component: impl Into<String>) -> Self {
        Self {
            logs_dir: layout.logs_dir(),
            component: component.into(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    fn day_file(&self, day: NaiveDate) -> PathBuf {
        self.logs_dir.join(format!("{}.jsonl", day.format("%Y-%m-%d")))
    }

    /// Append an entry to today's log.
    ///
    /// This operation is fail-open - logging failures won't stop the agent
    pub async fn record(&self, action_type: &str, details: serde_json::Value) {
        fail_open("audit_log::record", || async {
            let entry = AuditEntry {
                timestamp: Utc::now(),
                action_type: action_type.to_string(),
                component: self.component.clone(),
                details,
            };
            let line = serde_json::to_string(&entry)?;

            fs::create_dir_all(&self.logs_dir).await?;
            let path = self.day_file(Local::now().date_naive());
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(format!("{}\n", line).as_bytes()).await?;

            debug!("Audit {} -> {}", action_type, path.display());
            Ok(())
        })
        .await;
    }

    /// Entries recorded on `day`; unparseable lines are skipped
    pub async fn entries_for(&self, day: NaiveDate) -> Result<Vec<AuditEntry>> {
        let path = self.day_file(day);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!("Failed to parse audit line: {}", e);
                    None
                }
            })
            .collect())
    }
}
