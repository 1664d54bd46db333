//! Error types for the store module.

use thiserror::Error;

use courier_core::{ContactId, FormatError, GroupId, MessageId, MessageState};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The message does not exist, or its raw bytes were deleted.
    #[error("no such message: {0}")]
    NoSuchMessage(MessageId),

    /// The group does not exist.
    #[error("no such group: {0}")]
    NoSuchGroup(GroupId),

    /// The contact does not exist.
    #[error("no such contact: {0}")]
    NoSuchContact(ContactId),

    /// A write was attempted inside a read-only transaction.
    #[error("write attempted in a read-only transaction")]
    ReadOnly,

    /// A state change that would break the message state machine.
    #[error("message {id}: illegal state transition {from} -> {to}")]
    IllegalStateTransition {
        id: MessageId,
        from: MessageState,
        to: MessageState,
    },

    /// Stored bytes could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// A thread panicked while holding the store lock.
    #[error("store lock poisoned: {0}")]
    Poisoned(String),

    /// The blocking task running a transaction failed.
    #[error("transaction task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Whether this error means a message or group vanished, which the
    /// delivery pipeline tolerates by skipping the item.
    pub fn is_missing(&self) -> bool {
        matches!(self, StoreError::NoSuchMessage(_) | StoreError::NoSuchGroup(_))
    }
}

impl From<FormatError> for StoreError {
    fn from(e: FormatError) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
