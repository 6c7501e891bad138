/*!
Error types for the snapvault core engine.
*/

use thiserror::Error;

/// Result type used throughout snapvault core.
pub type Result<T> = std::result::Result<T, SnapvaultError>;

/// Errors that can occur while listing, evaluating, or moving snapshots.
#[derive(Error, Debug)]
pub enum SnapvaultError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Compression algorithm name that is not in the suffix table
    #[error("Unsupported compression algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// A listing handed to the reconciler is malformed
    #[error("Invalid snapshot listing: {0}")]
    InvalidListing(String),

    /// Every name candidate was probed and none exists
    #[error("Snapshot not found: {requested} (checked {})", tried.join(", "))]
    SnapshotNotFound {
        requested: String,
        tried: Vec<String>,
    },

    /// Storage adapter errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl SnapvaultError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new invalid listing error
    pub fn invalid_listing<S: Into<String>>(msg: S) -> Self {
        Self::InvalidListing(msg.into())
    }

    /// True for the recoverable "artifact absent" outcome of name resolution
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SnapshotNotFound { .. })
    }
}
