//! Error types for the sync module.

use thiserror::Error;

use courier_core::FormatError;
use courier_store::StoreError;

/// Errors that can occur during sync sessions.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The peer sent malformed data. The connection should be torn down.
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// The transport failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The peer supports none of our protocol versions.
    #[error("no common protocol version, peer supports {peer:?}")]
    NoCommonVersion { peer: Vec<u8> },
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
