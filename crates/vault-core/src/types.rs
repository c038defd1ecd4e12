//! Core type definitions for the vault work queue
//!
//! A work item is a markdown file. Its state is the directory holding it;
//! the `status` metadata key is advisory only.

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::Result;

/// Metadata block delimiter line
pub const DELIMITER: &str = "---";

/// Queue states, each backed by one directory under the vault root
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultState {
    Inbox,
    NeedsAction,
    /// Hand-off sub-queue from the restricted cloud producer to the local consumer
    NeedsActionCloud,
    PendingApproval,
    Approved,
    Rejected,
    /// Per-agent staging area used while an item is claimed
    InProgress(String),
    Done,
}

impl VaultState {
    /// Directory path relative to the vault root
    pub fn relative_dir(&self) -> PathBuf {
        match self {
            Self::Inbox => PathBuf::from("Inbox"),
            Self::NeedsAction => PathBuf::from("Needs_Action"),
            Self::NeedsActionCloud => PathBuf::from("Needs_Action").join("cloud"),
            Self::PendingApproval => PathBuf::from("Pending_Approval"),
            Self::Approved => PathBuf::from("Approved"),
            Self::Rejected => PathBuf::from("Rejected"),
            Self::InProgress(agent) => PathBuf::from("In_Progress").join(agent),
            Self::Done => PathBuf::from("Done"),
        }
    }

    /// Whether items in this state are archived permanently
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for VaultState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbox => write!(f, "inbox"),
            Self::NeedsAction => write!(f, "needs_action"),
            Self::NeedsActionCloud => write!(f, "needs_action_cloud"),
            Self::PendingApproval => write!(f, "pending_approval"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::InProgress(agent) => write!(f, "in_progress/{}", agent),
            Self::Done => write!(f, "done"),
        }
    }
}

impl std::str::FromStr for VaultState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        if let Some(agent) = normalized.strip_prefix("in_progress/") {
            return Ok(Self::InProgress(agent.to_string()));
        }
        match normalized.as_str() {
            "inbox" => Ok(Self::Inbox),
            "needs_action" => Ok(Self::NeedsAction),
            "needs_action_cloud" | "needs_action/cloud" | "cloud" => Ok(Self::NeedsActionCloud),
            "pending_approval" | "pending" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid state: {}", s)),
        }
    }
}

/// Resolves every directory of a vault
#[derive(Debug, Clone)]
pub struct VaultLayout {
    root: PathBuf,
}

impl VaultLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for a queue state
    pub fn dir(&self, state: &VaultState) -> PathBuf {
        self.root.join(state.relative_dir())
    }

    /// Directory holding persisted registries
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("State")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("Logs")
    }

    /// Drop box for status updates produced by cloud agents
    pub fn updates_dir(&self) -> PathBuf {
        self.root.join("Updates")
    }

    /// The shared aggregate artifact
    pub fn dashboard_path(&self) -> PathBuf {
        self.root.join("Dashboard.md")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join(".vault")
    }

    /// Create all standard directories.
    ///
    /// Permission errors are logged and tolerated so a read-only vault can
    /// still answer status queries.
    pub async fn ensure_dirs(&self, agents: &[&str]) -> Result<()> {
        let mut dirs = vec![
            self.dir(&VaultState::Inbox),
            self.dir(&VaultState::NeedsAction),
            self.dir(&VaultState::NeedsActionCloud),
            self.dir(&VaultState::PendingApproval),
            self.dir(&VaultState::Approved),
            self.dir(&VaultState::Rejected),
            self.dir(&VaultState::Done),
            self.state_dir(),
            self.logs_dir(),
            self.updates_dir(),
        ];
        dirs.extend(
            agents
                .iter()
                .map(|agent| self.dir(&VaultState::InProgress(agent.to_string()))),
        );

        for dir in dirs {
            match tokio::fs::create_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    warn!("Cannot create {} (read-only vault?): {}", dir.display(), e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Ordered key/value metadata block of a work item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(Vec<(String, String)>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace a key, keeping the original position on replace
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Split a work-item file into its metadata block and body.
///
/// Text that does not open with a delimiter line has no metadata; the whole
/// text is the body.
pub fn parse_frontmatter(text: &str) -> (Metadata, String) {
    let mut lines = text.lines();
    if lines.next().map(str::trim) != Some(DELIMITER) {
        return (Metadata::new(), text.to_string());
    }

    let mut metadata = Metadata::new();
    let mut body_lines = Vec::new();
    let mut in_block = true;

    for line in lines {
        if in_block {
            if line.trim() == DELIMITER {
                in_block = false;
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                metadata.insert(key.trim(), value.trim());
            }
        } else {
            body_lines.push(line);
        }
    }

    (metadata, body_lines.join("\n").trim_start_matches('\n').to_string())
}

/// Render metadata and body in the work-item file format
pub fn render_work_item(metadata: &Metadata, body: &str) -> String {
    let mut out = String::from(DELIMITER);
    out.push('\n');
    for (key, value) in metadata.iter() {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out.push_str(DELIMITER);
    out.push_str("\n\n");
    out.push_str(body);
    if !body.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Derive the kind tag from a file name.
///
/// Takes the underscore-separated words before the first all-digit segment,
/// lower-cases them and joins them with `-`:
/// `EMAIL_SEND_20250101_000000.md` becomes `email-send`.
pub fn derive_kind(name: &str) -> String {
    let stem = name.strip_suffix(".md").unwrap_or(name);
    let words: Vec<String> = stem
        .split('_')
        .take_while(|seg| !seg.is_empty() && !seg.chars().all(|c| c.is_ascii_digit()))
        .map(|seg| seg.to_lowercase())
        .collect();

    if words.is_empty() {
        "unknown".to_string()
    } else {
        words.join("-")
    }
}

/// The first `max_chars` characters of `text`
pub fn excerpt(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// The last `max_chars` characters of `text`
pub fn tail(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Second-granularity local timestamp used to disambiguate file names
pub fn timestamp_suffix() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Parse a metadata timestamp (RFC 3339, or ISO 8601 without offset)
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// A single file-backed unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// File stem
    pub id: String,
    /// File name including extension
    pub name: String,
    /// Type tag derived from the file name
    pub kind: String,
    pub metadata: Metadata,
    pub body: String,
    /// Where the item lived when it was read
    pub path: PathBuf,
}

impl WorkItem {
    /// Build a work item from its path and raw text
    pub fn parse(path: impl Into<PathBuf>, text: &str) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (metadata, body) = parse_frontmatter(text);

        Self {
            kind: derive_kind(&name),
            id,
            name,
            metadata,
            body,
            path,
        }
    }

    /// Read and parse a work item from disk
    pub async fn read(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::parse(path, &String::from_utf8_lossy(&bytes)))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).filter(|v| !v.is_empty())
    }

    /// Required metadata keys that are absent or empty
    pub fn missing_fields(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|key| self.get(key).is_none())
            .map(|key| key.to_string())
            .collect()
    }

    /// Creation time from metadata, if present and parseable
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        ["created", "received", "timestamp", "requested_at"]
            .iter()
            .find_map(|key| self.get(key).and_then(parse_timestamp))
    }

    /// Serialize back to the file format
    pub fn render(&self) -> String {
        render_work_item(&self.metadata, &self.body)
    }
}
