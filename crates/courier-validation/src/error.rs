//! Error types for the validation module.

use thiserror::Error;

use courier_store::StoreError;

/// Errors that can occur while managing validation and delivery.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Registration after start, or a second start.
    #[error("validation service already started")]
    AlreadyStarted,

    /// The service is not running.
    #[error("validation service not running")]
    NotRunning,

    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A worker queue closed while work was being submitted.
    #[error("validation queue closed")]
    QueueClosed,
}

/// Result type for validation operations.
pub type Result<T> = std::result::Result<T, ValidationError>;
