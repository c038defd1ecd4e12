//! Persisted map repository.
//!
//! Every shared registry (signatures, service health, offline queue) is a
//! single JSON document loaded fully into memory and rewritten fully on each
//! mutation. The document carries a version counter; a save is refused with
//! [`VaultError::StaleWrite`] when another writer bumped the version since the
//! snapshot was loaded, so concurrent read-modify-write cycles cannot silently
//! drop each other's entries.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use vault_core::{timestamp_suffix, Result, VaultError};

/// Attempts made by [`update_map`] before a stale write is surfaced
pub const MAX_UPDATE_ATTEMPTS: usize = 5;

/// In-memory copy of a persisted map plus the version it was read at
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "V: Serialize",
    deserialize = "V: DeserializeOwned"
))]
pub struct Snapshot<V> {
    #[serde(default)]
    pub version: u64,
    #[serde(default = "BTreeMap::new")]
    pub entries: BTreeMap<String, V>,
}

impl<V> Default for Snapshot<V> {
    fn default() -> Self {
        Self {
            version: 0,
            entries: BTreeMap::new(),
        }
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a, V> {
    version: u64,
    entries: &'a BTreeMap<String, V>,
}

/// Storage seam for a single persisted map.
///
/// Implementations can swap in an embedded key-value store or a
/// transactional writer without changing the registries built on top.
#[async_trait]
pub trait MapRepository<V>: Send + Sync
where
    V: Send + Sync,
{
    /// Load the whole map. A missing store loads as empty at version 0.
    async fn load(&self) -> Result<Snapshot<V>>;

    /// Persist the whole map, returning the new version.
    ///
    /// Fails with [`VaultError::StaleWrite`] if the stored version no longer
    /// equals `snapshot.version`.
    async fn save(&self, snapshot: &Snapshot<V>) -> Result<u64>;
}

/// Write `bytes` to `path` via a sibling temp file and an atomic rename
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    fs::write(&tmp, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// A map persisted as one pretty-printed JSON file
#[derive(Debug)]
pub struct JsonMapFile<V> {
    path: PathBuf,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for JsonMapFile<V> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> JsonMapFile<V> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<V: DeserializeOwned> JsonMapFile<V> {
    async fn read_snapshot(&self) -> Result<Snapshot<V>> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Snapshot::default());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&data) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                warn!("Registry {} is unreadable: {}", self.path.display(), e);
                self.quarantine().await?;
                Ok(Snapshot::default())
            }
        }
    }

    /// Move an unreadable file aside as `<name>.corrupt-<ts>` so the next
    /// save starts a fresh map instead of overwriting the evidence.
    async fn quarantine(&self) -> Result<()> {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = self
            .path
            .with_file_name(format!("{}.corrupt-{}", file_name, timestamp_suffix()));

        match fs::rename(&self.path, &target).await {
            Ok(()) => {
                warn!("Moved corrupt registry aside to {}", target.display());
                Ok(())
            }
            // Another reader quarantined it first
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<V> MapRepository<V> for JsonMapFile<V>
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    async fn load(&self) -> Result<Snapshot<V>> {
        let snapshot = self.read_snapshot().await?;
        debug!(
            "Loaded {} entries from {} (version {})",
            snapshot.entries.len(),
            self.path.display(),
            snapshot.version
        );
        Ok(snapshot)
    }

    async fn save(&self, snapshot: &Snapshot<V>) -> Result<u64> {
        let current: Snapshot<serde_json::Value> = JsonMapFile::new(&self.path)
            .read_snapshot()
            .await?;
        if current.version != snapshot.version {
            return Err(VaultError::StaleWrite(self.path.display().to_string()));
        }

        let next = SnapshotRef {
            version: snapshot.version + 1,
            entries: &snapshot.entries,
        };
        let data = serde_json::to_vec_pretty(&next)?;
        atomic_write(&self.path, &data).await?;

        debug!(
            "Saved {} entries to {} (version {})",
            snapshot.entries.len(),
            self.path.display(),
            next.version
        );
        Ok(next.version)
    }
}

/// Read-modify-write a persisted map, retrying on stale writes.
///
/// `mutate` may run more than once, each time against a freshly loaded map,
/// so it must be a pure function of the map it is given.
pub async fn update_map<V, R, F, T>(repo: &R, mut mutate: F) -> Result<T>
where
    V: Send + Sync,
    R: MapRepository<V> + ?Sized,
    F: FnMut(&mut BTreeMap<String, V>) -> T + Send,
    T: Send,
{
    let mut last_err = None;
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let mut snapshot = repo.load().await?;
        let out = mutate(&mut snapshot.entries);
        match repo.save(&snapshot).await {
            Ok(_) => return Ok(out),
            Err(e @ VaultError::StaleWrite(_)) => {
                debug!("Stale write (attempt {}/{}), reloading", attempt, MAX_UPDATE_ATTEMPTS);
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| VaultError::Other("update_map made no attempts".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let repo: JsonMapFile<u32> = JsonMapFile::new(dir.path().join("State/none.json"));
        let snapshot = repo.load().await.unwrap();
        assert_eq!(snapshot.version, 0);
        assert!(snapshot.entries.is_empty());
    }

    #[tokio::test]
    async fn test_save_bumps_version() {
        let dir = TempDir::new().unwrap();
        let repo: JsonMapFile<u32> = JsonMapFile::new(dir.path().join("State/map.json"));

        let mut snapshot = repo.load().await.unwrap();
        snapshot.entries.insert("a".into(), 1);
        assert_eq!(repo.save(&snapshot).await.unwrap(), 1);

        let reloaded = repo.load().await.unwrap();
        assert_eq!(reloaded.version, 1);
        assert_eq!(reloaded.entries.get("a"), Some(&1));
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_refused() {
        let dir = TempDir::new().unwrap();
        let repo: JsonMapFile<u32> = JsonMapFile::new(dir.path().join("map.json"));

        let mut first = repo.load().await.unwrap();
        let mut second = repo.load().await.unwrap();

        first.entries.insert("a".into(), 1);
        repo.save(&first).await.unwrap();

        second.entries.insert("b".into(), 2);
        let err = repo.save(&second).await.unwrap_err();
        assert!(matches!(err, VaultError::StaleWrite(_)));

        // The first writer's entry survived
        assert_eq!(repo.load().await.unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn test_update_map_merges_writers() {
        let dir = TempDir::new().unwrap();
        let repo: JsonMapFile<u32> = JsonMapFile::new(dir.path().join("map.json"));

        update_map(&repo, |m| m.insert("a".into(), 1)).await.unwrap();
        update_map(&repo, |m| m.insert("b".into(), 2)).await.unwrap();

        let snapshot = repo.load().await.unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.json");
        std::fs::write(&path, "{not json").unwrap();

        let repo: JsonMapFile<u32> = JsonMapFile::new(&path);
        let mut snapshot = repo.load().await.unwrap();
        assert!(snapshot.entries.is_empty());

        // The corrupt document is kept aside, not overwritten
        assert!(!path.exists());
        let aside: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with("map.json.corrupt-")
            })
            .collect();
        assert_eq!(aside.len(), 1);
        assert_eq!(std::fs::read_to_string(&aside[0]).unwrap(), "{not json");

        snapshot.entries.insert("a".into(), 1);
        assert_eq!(repo.save(&snapshot).await.unwrap(), 1);
        assert_eq!(std::fs::read_to_string(&aside[0]).unwrap(), "{not json");
    }
}
