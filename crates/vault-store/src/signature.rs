//! Content-addressed deduplication registry.
//!
//! Before any channel processor runs on an approved item, its content
//! signature is checked here. A recorded signature permanently marks that
//! content as processed, whatever the file is called and wherever it lives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use vault_core::{Result, VaultError, VaultLayout};

use crate::repository::{JsonMapFile, MapRepository, Snapshot, MAX_UPDATE_ATTEMPTS};

/// Registry file name under `State/`
pub const REGISTRY_FILE: &str = "processed_approvals.json";

/// One processed approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub signature: String,
    /// File name the content was first processed under
    pub source_name: String,
    pub processor: String,
    pub processed_at: DateTime<Utc>,
    /// Downstream identifier (message id, invoice id, ...)
    #[serde(default)]
    pub result_reference: Option<String>,
}

/// Whether approved content may be dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    Fresh,
    /// Already processed; carries the original record
    Duplicate(SignatureRecord),
}

/// Hex SHA-256 over the first `prefix_len` bytes of `content`
pub fn signature_of(content: &[u8], prefix_len: usize) -> String {
    let end = content.len().min(prefix_len);
    hex::encode(Sha256::digest(&content[..end]))
}

/// Signature of the file at `path`, reading at most `prefix_len` bytes
pub async fn signature_of_file(path: &Path, prefix_len: usize) -> Result<String> {
    let file = tokio::fs::File::open(path).await?;
    let mut buf = Vec::new();
    file.take(prefix_len as u64).read_to_end(&mut buf).await?;
    Ok(signature_of(&buf, prefix_len))
}

/// Signature registry backed by a persisted map.
///
/// Loaded once per agent cycle; new records are buffered and written by
/// [`SignatureRegistry::flush`]. Records are only ever added, so a flush that
/// loses an optimistic-concurrency race reloads and merges instead of
/// overwriting the other writer.
pub struct SignatureRegistry<R = JsonMapFile<SignatureRecord>> {
    repo: R,
    snapshot: Snapshot<SignatureRecord>,
    unsaved: BTreeMap<String, SignatureRecord>,
}

impl SignatureRegistry {
    /// Open the registry at `State/processed_approvals.json`
    pub async fn open(layout: &VaultLayout) -> Result<Self> {
        Self::with_repository(JsonMapFile::new(layout.state_dir().join(REGISTRY_FILE))).await
    }
}

impl<R: MapRepository<SignatureRecord>> SignatureRegistry<R> {
    pub async fn with_repository(repo: R) -> Result<Self> {
        let snapshot = repo.load().await?;
        debug!("Signature registry holds {} records", snapshot.entries.len());
        Ok(Self {
            repo,
            snapshot,
            unsaved: BTreeMap::new(),
        })
    }

    pub fn is_duplicate(&self, signature: &str) -> bool {
        self.get(signature).is_some()
    }

    pub fn check(&self, signature: &str) -> DedupDecision {
        match self.get(signature) {
            Some(record) => DedupDecision::Duplicate(record.clone()),
            None => DedupDecision::Fresh,
        }
    }

    pub fn get(&self, signature: &str) -> Option<&SignatureRecord> {
        self.unsaved
            .get(signature)
            .or_else(|| self.snapshot.entries.get(signature))
    }

    /// Mark `signature` as processed. Call only after the processor succeeded.
    pub fn record(
        &mut self,
        signature: impl Into<String>,
        source_name: impl Into<String>,
        processor: impl Into<String>,
        result_reference: Option<String>,
    ) -> &SignatureRecord {
        let signature = signature.into();
        let record = SignatureRecord {
            signature: signature.clone(),
            source_name: source_name.into(),
            processor: processor.into(),
            processed_at: Utc::now(),
            result_reference,
        };
        info!(
            processor = %record.processor,
            "Recorded signature {} for {}",
            signature.get(..12).unwrap_or(&signature),
            record.source_name
        );
        self.unsaved.entry(signature).or_insert(record)
    }

    pub fn len(&self) -> usize {
        self.snapshot.entries.len()
            + self
                .unsaved
                .keys()
                .filter(|k| !self.snapshot.entries.contains_key(*k))
                .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist buffered records
    pub async fn flush(&mut self) -> Result<()> {
        if self.unsaved.is_empty() {
            return Ok(());
        }

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let mut merged = self.snapshot.clone();
            for (sig, record) in &self.unsaved {
                merged
                    .entries
                    .entry(sig.clone())
                    .or_insert_with(|| record.clone());
            }

            match self.repo.save(&merged).await {
                Ok(version) => {
                    merged.version = version;
                    self.snapshot = merged;
                    self.unsaved.clear();
                    return Ok(());
                }
                Err(VaultError::StaleWrite(path)) => {
                    debug!(
                        "Signature registry {} changed underneath us (attempt {}/{})",
                        path, attempt, MAX_UPDATE_ATTEMPTS
                    );
                    self.snapshot = self.repo.load().await?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(VaultError::StaleWrite(
            "signature registry: too many concurrent writers".to_string(),
        ))
    }
}
