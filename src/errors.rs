//! Error types for drive monitoring and mirroring.

use std::path::PathBuf;
use thiserror::Error;

use crate::session::RejectReason;

/// Main error type for mirror operations.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A tree root could not be enumerated.
    #[error("Cannot scan {}: {source}", root.display())]
    Scan {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot create directory {}: {source}", path.display())]
    DirectoryCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Copying a single file failed. `path` is relative to the local root.
    #[error("Failed to copy {}: {source}", path.display())]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot query mount status of {}: {reason}", path.display())]
    MountQuery { path: PathBuf, reason: String },

    #[error("Eject failed: {0}")]
    Eject(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("Sync request rejected: {0}")]
    Rejected(#[from] RejectReason),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for mirror operations.
pub type SyncResult<T> = Result<T, SyncError>;
