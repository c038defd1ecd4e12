//! Unified error types for vault

use thiserror::Error;

/// Unified error type for all vault operations
#[derive(Error, Debug)]
pub enum VaultError {
    // Downstream service errors
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Permanent error: {0}")]
    Permanent(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Channel processor error: {0}")]
    Processor(String),

    // Work item errors
    #[error("Malformed work item {name}: {reason}")]
    MalformedWorkItem { name: String, reason: String },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Persisted state errors
    #[error("Stale write to {0}: file changed since it was loaded")]
    StaleWrite(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of an error, used to decide retry eligibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network / rate-limit class, worth retrying
    Transient,
    /// Operation exceeded its deadline
    Timeout,
    /// Local filesystem failure
    Io,
    /// Validation / auth class, never retried
    Permanent,
    /// Circuit open for the target service
    Unavailable,
    /// Work item is missing required data
    Malformed,
    /// Name collision or concurrent writer
    Conflict,
    Other,
}

impl VaultError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Io(_) => ErrorKind::Io,
            Self::Permanent(_) | Self::Config(_) | Self::Serialization(_) => {
                ErrorKind::Permanent
            }
            Self::ServiceUnavailable(_) => ErrorKind::Unavailable,
            Self::MalformedWorkItem { .. } => ErrorKind::Malformed,
            Self::AlreadyExists(_) | Self::StaleWrite(_) => ErrorKind::Conflict,
            Self::Processor(_) | Self::NotFound(_) | Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Shorthand for a malformed-item error
    pub fn malformed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedWorkItem {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using VaultError
pub type Result<T> = std::result::Result<T, VaultError>;
