//! Golden wire vectors.
//!
//! Each vector is a byte stream together with the sync records a reader
//! must produce from it, and whether reading must then fail. They pin the
//! record format so that independent implementations interoperate. The
//! vectors live in `vectors/wire.json`.

use serde::{Deserialize, Serialize};

use courier_core::{Ack, GroupId, Message, MessageId, Offer, Request, SyncMessage, Versions};

const WIRE_VECTORS: &str = include_str!("../vectors/wire.json");

/// One golden stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireVector {
    /// Human-readable name for the vector.
    pub name: String,
    /// The stream, hex encoded.
    pub stream: String,
    /// Records a reader yields, in order.
    pub records: Vec<ExpectedRecord>,
    /// Whether reading fails after the listed records.
    pub error: bool,
}

/// A decoded record, spelled out field by field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpectedRecord {
    Ack { ids: Vec<String> },
    Offer { ids: Vec<String> },
    Request { ids: Vec<String> },
    Versions { versions: Vec<u8> },
    Message {
        group_id: String,
        timestamp: u64,
        body: String,
    },
}

impl ExpectedRecord {
    /// Build the sync message this record describes.
    pub fn build(&self) -> Result<SyncMessage, String> {
        let ids = |ids: &[String]| -> Result<Vec<MessageId>, String> {
            ids.iter()
                .map(|id| MessageId::from_hex(id).map_err(|e| e.to_string()))
                .collect()
        };
        Ok(match self {
            ExpectedRecord::Ack { ids: list } => {
                SyncMessage::Ack(Ack::new(ids(list)?).map_err(|e| e.to_string())?)
            }
            ExpectedRecord::Offer { ids: list } => {
                SyncMessage::Offer(Offer::new(ids(list)?).map_err(|e| e.to_string())?)
            }
            ExpectedRecord::Request { ids: list } => {
                SyncMessage::Request(Request::new(ids(list)?).map_err(|e| e.to_string())?)
            }
            ExpectedRecord::Versions { versions } => {
                SyncMessage::Versions(Versions::new(versions.clone()).map_err(|e| e.to_string())?)
            }
            ExpectedRecord::Message {
                group_id,
                timestamp,
                body,
            } => {
                let group = GroupId::from_hex(group_id).map_err(|e| e.to_string())?;
                let body = hex::decode(body).map_err(|e| e.to_string())?;
                SyncMessage::Message(
                    Message::new(group, *timestamp, &body).map_err(|e| e.to_string())?,
                )
            }
        })
    }
}

impl WireVector {
    pub fn bytes(&self) -> Vec<u8> {
        hex::decode(&self.stream).unwrap_or_default()
    }

    /// The records this vector's reader must yield.
    pub fn expected(&self) -> Vec<SyncMessage> {
        self.records
            .iter()
            .map(|r| r.build().unwrap_or_else(|e| panic!("vector '{}': {e}", self.name)))
            .collect()
    }
}

/// Get all golden wire vectors.
pub fn all_vectors() -> Vec<WireVector> {
    serde_json::from_str(WIRE_VECTORS).unwrap_or_else(|e| panic!("wire.json is malformed: {e}"))
}

/// Concatenated encodings of `messages`, as a writer would produce them.
pub fn encode_stream(messages: &[SyncMessage]) -> Vec<u8> {
    messages
        .iter()
        .flat_map(|m| m.to_record().map(|r| r.encode()).unwrap_or_default())
        .collect()
}
