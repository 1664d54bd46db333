//! Messages: the unit of application data moved by the sync engine.
//!
//! On the wire a message is `group_id (32) || timestamp (u64 BE, ms) || body`.
//! The message id is a content address over those bytes, so a message can
//! be re-identified from its raw form alone.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::FormatError;
use crate::types::{GroupId, MessageId, UNIQUE_ID_LENGTH};

/// Length of the fixed header: group id plus timestamp.
pub const MESSAGE_HEADER_LENGTH: usize = UNIQUE_ID_LENGTH + 8;

/// Maximum length of a message body.
pub const MAX_MESSAGE_BODY_LENGTH: usize = 32 * 1024;

/// Maximum length of a raw message.
pub const MAX_MESSAGE_LENGTH: usize = MESSAGE_HEADER_LENGTH + MAX_MESSAGE_BODY_LENGTH;

/// Format version mixed into message ids.
pub const MESSAGE_FORMAT_VERSION: u8 = 1;

const MESSAGE_ID_DOMAIN: &[u8] = b"courier-message-id-v0:";

/// A message with its derived id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    group_id: GroupId,
    timestamp: u64,
    raw: Bytes,
}

impl Message {
    /// Build a message from its parts.
    pub fn new(group_id: GroupId, timestamp: u64, body: &[u8]) -> Result<Self, FormatError> {
        check_body_length(body.len())?;
        check_timestamp(timestamp)?;
        let mut raw = BytesMut::with_capacity(MESSAGE_HEADER_LENGTH + body.len());
        raw.put_slice(group_id.as_bytes());
        raw.put_u64(timestamp);
        raw.put_slice(body);
        let raw = raw.freeze();
        Ok(Self {
            id: Self::derive_id(&raw),
            group_id,
            timestamp,
            raw,
        })
    }

    /// Parse a raw message received from a peer or loaded from storage.
    pub fn from_raw(raw: impl Into<Bytes>) -> Result<Self, FormatError> {
        let raw = raw.into();
        if raw.len() <= MESSAGE_HEADER_LENGTH {
            return Err(FormatError::MalformedMessage(format!(
                "{} bytes is too short for a message",
                raw.len()
            )));
        }
        check_body_length(raw.len() - MESSAGE_HEADER_LENGTH)?;

        let group_id = GroupId::try_from(&raw[..UNIQUE_ID_LENGTH])
            .map_err(|e| FormatError::MalformedMessage(e.to_string()))?;
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&raw[UNIQUE_ID_LENGTH..MESSAGE_HEADER_LENGTH]);
        let timestamp = u64::from_be_bytes(ts);
        check_timestamp(timestamp)?;

        Ok(Self {
            id: Self::derive_id(&raw),
            group_id,
            timestamp,
            raw,
        })
    }

    /// Compute the id of a raw message.
    pub fn derive_id(raw: &[u8]) -> MessageId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(MESSAGE_ID_DOMAIN);
        hasher.update(&[MESSAGE_FORMAT_VERSION]);
        hasher.update(raw);
        MessageId(*hasher.finalize().as_bytes())
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Author-claimed creation time, Unix milliseconds.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The application body (opaque to this layer).
    pub fn body(&self) -> &[u8] {
        &self.raw[MESSAGE_HEADER_LENGTH..]
    }

    /// The full wire form.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Length of the wire form.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

fn check_body_length(len: usize) -> Result<(), FormatError> {
    if len == 0 {
        return Err(FormatError::MalformedMessage("empty body".into()));
    }
    if len > MAX_MESSAGE_BODY_LENGTH {
        return Err(FormatError::PayloadTooLong {
            len,
            max: MAX_MESSAGE_BODY_LENGTH,
        });
    }
    Ok(())
}

fn check_timestamp(timestamp: u64) -> Result<(), FormatError> {
    if timestamp > i64::MAX as u64 {
        return Err(FormatError::MalformedMessage(format!(
            "timestamp {} out of range",
            timestamp
        )));
    }
    Ok(())
}
