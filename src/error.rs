//! Error types for mirrorsync

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for mirrorsync operations
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Main error type for mirrorsync
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Configuration not found: {}", .0.display())]
    ConfigMissing(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Conflict unresolved: {0}")]
    ConflictUnresolved(String),

    #[error("Transfer timed out after {0}s")]
    Timeout(u64),

    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Bandwidth shaping unavailable: {0}")]
    ShapingUnavailable(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MirrorError {
    /// Check if error is retryable on a later cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MirrorError::TransferFailed(_)
                | MirrorError::ConflictUnresolved(_)
                | MirrorError::Timeout(_)
                | MirrorError::StoreUnavailable(_)
        )
    }

    /// Fold backing-medium failures into `StoreUnavailable`
    pub fn into_store_error(self) -> Self {
        match self {
            MirrorError::Database(e) => MirrorError::StoreUnavailable(e.to_string()),
            MirrorError::Io(e) => MirrorError::StoreUnavailable(e.to_string()),
            other => other,
        }
    }

    /// Short machine-readable kind, used in logs and the status surface
    pub fn kind(&self) -> &'static str {
        match self {
            MirrorError::ConfigMissing(_) => "config_missing",
            MirrorError::Config(_) => "config",
            MirrorError::TransferFailed(_) => "transfer_failed",
            MirrorError::ConflictUnresolved(_) => "conflict_unresolved",
            MirrorError::Timeout(_) => "timeout",
            MirrorError::StoreUnavailable(_) => "store_unavailable",
            MirrorError::ShapingUnavailable(_) => "shaping_unavailable",
            MirrorError::InvalidCommand(_) => "invalid_command",
            MirrorError::Database(_) => "database",
            MirrorError::Serialization(_) => "serialization",
            MirrorError::Io(_) => "io",
            MirrorError::Internal(_) => "internal",
        }
    }
}
