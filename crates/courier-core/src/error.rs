//! Error types for wire decoding and message validation.

use thiserror::Error;

/// Malformed data read from an untrusted peer.
///
/// Format errors are never recovered locally: the connection that produced
/// them is torn down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLong { len: usize, max: usize },

    #[error("stream ended inside a record {0}")]
    Truncated(&'static str),

    #[error("record carries no message ids")]
    EmptyIdList,

    #[error("id list of {0} bytes is not a multiple of the id length")]
    RaggedIdList(usize),

    #[error("{count} message ids exceed maximum of {max}")]
    TooManyIds { count: usize, max: usize },

    #[error("versions record must list 1 to {max} versions, got {count}")]
    BadVersionCount { count: usize, max: usize },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("malformed group: {0}")]
    MalformedGroup(String),

    #[error("expected {expected} record, found {found}")]
    UnexpectedRecord {
        expected: &'static str,
        found: &'static str,
    },
}

/// A client validator or delivery hook rejected a message.
///
/// Recovered locally: the message is invalidated and processing continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid message: {reason}")]
pub struct InvalidMessageError {
    pub reason: String,
}

impl InvalidMessageError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
