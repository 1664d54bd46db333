//! # Courier Core
//!
//! Pure primitives for the Courier sync engine: identifiers, messages,
//! groups, the framed record format and the typed sync records.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`MessageId`] / [`GroupId`] - 32-byte content addresses (BLAKE3)
//! - [`Message`] - group id, timestamp and opaque body
//! - [`Record`] - version, type tag and length-prefixed payload
//! - [`SyncMessage`] - `Ack`, `Offer`, `Request`, `Message`, `Versions`
//! - [`MessageState`] - position in the validation and delivery pipeline

pub mod error;
pub mod group;
pub mod message;
pub mod metadata;
pub mod record;
pub mod records;
pub mod state;
pub mod types;

pub use error::{FormatError, InvalidMessageError};
pub use group::{ClientId, ClientKey, Group, MAX_CLIENT_ID_LENGTH, MAX_GROUP_DESCRIPTOR_LENGTH};
pub use message::{
    Message, MAX_MESSAGE_BODY_LENGTH, MAX_MESSAGE_LENGTH, MESSAGE_HEADER_LENGTH,
};
pub use metadata::{MessageContext, Metadata};
pub use record::{
    Record, RecordHeader, RecordType, MAX_RECORD_PAYLOAD_LENGTH, PROTOCOL_VERSION,
    RECORD_HEADER_LENGTH,
};
pub use records::{
    Ack, Offer, Request, SyncMessage, Versions, MAX_MESSAGE_IDS, MAX_SUPPORTED_VERSIONS,
    SUPPORTED_VERSIONS,
};
pub use state::{MessageState, Visibility};
pub use types::{ContactId, GroupId, MessageId, UNIQUE_ID_LENGTH};
