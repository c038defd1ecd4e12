//! # vault-store
//!
//! Filesystem-backed coordination primitives for the vault work queue.
//!
//! # Overview
//!
//! Agents never talk to each other directly. Everything they share is on
//! disk:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │         Agents (orchestrator, workers)      │
//! └─────────────────┬───────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────┐
//! │         vault-store (this crate)            │
//! │  • work_item: list / create / move          │
//! │  • claim: single-winner claim-by-move       │
//! │  • repository: versioned JSON maps          │
//! │  • signature: processed-content registry    │
//! │  • lock: single-writer artifact gate        │
//! └─────────────────┬───────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────┐
//! │         Vault directory tree                │
//! │  • Needs_Action/ Approved/ Done/ ...        │
//! │  • State/*.json                             │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```no_run
//! use vault_core::{VaultLayout, VaultState};
//! use vault_store::{ClaimCoordinator, work_item};
//!
//! # async fn example() -> vault_core::Result<()> {
//! let layout = VaultLayout::new("vault");
//! let coordinator = ClaimCoordinator::new(&layout, "local");
//!
//! for path in work_item::list(&layout.dir(&VaultState::NeedsAction), "*.md").await? {
//!     if let Some(claimed) = coordinator.claim(&path).await.into_claimed() {
//!         println!("working on {}", claimed.path.display());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod claim;
pub mod lock;
pub mod repository;
pub mod signature;
pub mod work_item;

pub use claim::{ClaimCoordinator, ClaimResult, ClaimedItem};
pub use lock::{DashboardLock, SingleWriterLock};
pub use repository::{atomic_write, update_map, JsonMapFile, MapRepository, Snapshot};
pub use signature::{
    signature_of, signature_of_file, DedupDecision, SignatureRecord, SignatureRegistry,
};
pub use work_item::{MoveOutcome, MARKDOWN};
