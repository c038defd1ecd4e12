//! # vault-core
//!
//! Core types for the vault work queue.
//!
//! A vault is a directory tree whose subdirectories are queue states.
//! Independent agent processes cooperate only through that tree:
//!
//! - Work items ARE markdown files (metadata block + free-text body)
//! - State IS the directory an item lives in
//! - Transitions ARE single-winner moves that never replace a file
//! - Shared registries ARE single JSON documents under `State/`

pub mod config;
mod error;
pub mod fail_open;
mod types;

pub use config::{AgentRole, VaultConfig};
pub use error::{ErrorKind, Result, VaultError};
pub use types::*;
