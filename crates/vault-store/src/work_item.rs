//! Work-item directory state machine.
//!
//! A work item's state is the directory it lives in, and the only transition
//! primitive is a no-replace move (hard link, then unlink of the source).
//! Nothing here edits an item in place after the one-time write that creates
//! it.

use glob::Pattern;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use vault_core::{render_work_item, timestamp_suffix, Metadata, Result, VaultError, WorkItem};

/// Default listing pattern
pub const MARKDOWN: &str = "*.md";

/// Result of a move-based transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The item now lives at this path
    Moved(PathBuf),
    /// The source disappeared first; someone else already transitioned it
    Vanished,
}

impl MoveOutcome {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Moved(path) => Some(path),
            Self::Vanished => None,
        }
    }
}

fn compile(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern)
        .map_err(|e| VaultError::Config(format!("Invalid pattern {:?}: {}", pattern, e)))
}

/// List files in `directory` (top level only) whose names match `pattern`.
///
/// Order is unspecified; callers sort when they care. A missing directory
/// yields an empty list.
pub async fn list(directory: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let matcher = compile(pattern)?;

    let mut entries = match fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Directory {} does not exist, nothing to list", directory.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_type = match entry.file_type().await {
            Ok(file_type) => file_type,
            // Raced with another agent's move
            Err(_) => continue,
        };
        if !file_type.is_file() {
            continue;
        }

        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || !matcher.matches(&name) {
            continue;
        }
        paths.push(entry.path());
    }

    Ok(paths)
}

/// List files matching any of several patterns, without duplicates
pub async fn list_any(directory: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        for path in list(directory, pattern).await? {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    Ok(paths)
}

/// Read and parse every matching item.
///
/// Items that vanish between listing and reading are skipped silently;
/// unreadable ones are skipped with a warning.
pub async fn load_items(directory: &Path, pattern: &str) -> Result<Vec<WorkItem>> {
    let mut items = Vec::new();
    for path in list(directory, pattern).await? {
        match WorkItem::read(&path).await {
            Ok(item) => items.push(item),
            Err(VaultError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} vanished before it could be read", path.display());
            }
            Err(e) => warn!("Skipping unreadable work item {}: {}", path.display(), e),
        }
    }
    Ok(items)
}

/// Sort paths by file name, ascending
pub fn sorted_by_name(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    paths
}

/// Sort items by creation time, newest first; items without one go last
pub fn sorted_by_created_desc(mut items: Vec<WorkItem>) -> Vec<WorkItem> {
    items.sort_by(|a, b| b.created_at().cmp(&a.created_at()).then(b.name.cmp(&a.name)));
    items
}

/// Write a new work item.
///
/// Fails with [`VaultError::AlreadyExists`] if `name` is taken; callers embed
/// a timestamp in the name to make that unlikely.
pub async fn create(
    directory: &Path,
    name: &str,
    metadata: &Metadata,
    body: &str,
) -> Result<PathBuf> {
    fs::create_dir_all(directory).await?;
    let path = directory.join(name);

    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(VaultError::AlreadyExists(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    file.write_all(render_work_item(metadata, body).as_bytes())
        .await?;
    file.flush().await?;

    debug!("Created work item {}", path.display());
    Ok(path)
}

/// Name with a `_YYYYmmdd_HHMMSS` suffix inserted before the extension
pub fn with_timestamp_suffix(name: &str) -> String {
    let ts = timestamp_suffix();
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, ts, ext),
        _ => format!("{}_{}", name, ts),
    }
}

/// Result of placing a file at one exact target path
enum Placement {
    Placed,
    /// The target name is already in use
    Taken,
    Vanished,
}

/// Move `source` to `target` without ever replacing an existing file.
///
/// The file is hard-linked at `target` and then unlinked from `source`. When
/// two movers race, both links can succeed but only one unlink of the source
/// does; the loser removes its link and reports the source as vanished.
async fn place(source: &Path, target: &Path) -> Result<Placement> {
    match fs::hard_link(source, target).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(Placement::Taken),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Placement::Vanished),
        Err(e) => {
            // No hard links on this filesystem
            debug!("Hard link {} failed ({}), using rename", target.display(), e);
            if fs::try_exists(target).await? {
                return Ok(Placement::Taken);
            }
            return match fs::rename(source, target).await {
                Ok(()) => Ok(Placement::Placed),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Placement::Vanished),
                Err(e) => Err(e.into()),
            };
        }
    }

    match fs::remove_file(source).await {
        Ok(()) => Ok(Placement::Placed),
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(target).await {
                warn!("Failed to remove link {}: {}", target.display(), cleanup);
            }
            if e.kind() == std::io::ErrorKind::NotFound {
                Ok(Placement::Vanished)
            } else {
                Err(e.into())
            }
        }
    }
}

/// Move `source` into `destination_dir` under `target_name`.
///
/// An existing file is never replaced. On a name collision a timestamp
/// suffix is appended and the move is tried once more; a second collision is
/// surfaced as `AlreadyExists`. A vanished source is reported as
/// [`MoveOutcome::Vanished`], not as an error.
pub async fn move_to(
    source: &Path,
    destination_dir: &Path,
    target_name: &str,
) -> Result<MoveOutcome> {
    move_to_or(source, destination_dir, target_name, &with_timestamp_suffix(target_name)).await
}

async fn move_to_or(
    source: &Path,
    destination_dir: &Path,
    target_name: &str,
    fallback_name: &str,
) -> Result<MoveOutcome> {
    fs::create_dir_all(destination_dir).await?;

    for name in [target_name, fallback_name] {
        let target = destination_dir.join(name);
        match place(source, &target).await? {
            Placement::Placed => {
                debug!("Moved {} -> {}", source.display(), target.display());
                return Ok(MoveOutcome::Moved(target));
            }
            Placement::Vanished => {
                debug!("{} vanished before it could be moved", source.display());
                return Ok(MoveOutcome::Vanished);
            }
            Placement::Taken => {}
        }
    }

    Err(VaultError::AlreadyExists(
        destination_dir.join(fallback_name).display().to_string(),
    ))
}

/// Move an item into `destination_dir`, keeping its name
pub async fn move_item(source: &Path, destination_dir: &Path) -> Result<MoveOutcome> {
    let name = file_name(source)?;
    move_to(source, destination_dir, &name).await
}

/// Archive an item into `done_dir` with an optional marker prefix
/// (`DUPLICATE`, `REJECTED`, ...).
pub async fn archive(source: &Path, done_dir: &Path, marker: Option<&str>) -> Result<MoveOutcome> {
    let name = file_name(source)?;
    let target_name = match marker {
        Some(marker) => format!("{}_{}", marker, name),
        None => name,
    };
    move_to(source, done_dir, &target_name).await
}

pub(crate) fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| VaultError::NotFound(format!("{} has no file name", path.display())))
}
