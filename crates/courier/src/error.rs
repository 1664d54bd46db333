//! Error types for the node.

use courier_core::FormatError;
use courier_store::StoreError;
use courier_sync::SyncError;
use courier_validation::ValidationError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// A message or record could not be built.
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// A session failed.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// The validation service refused the call.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
