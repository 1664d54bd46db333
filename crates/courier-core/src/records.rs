//! Typed sync records and their payload encodings.
//!
//! `Ack`, `Offer` and `Request` carry a list of 1 to [`MAX_MESSAGE_IDS`]
//! message ids, concatenated. `Versions` carries one byte per supported
//! protocol version. `Message` carries a raw message.

use bytes::Bytes;

use crate::error::FormatError;
use crate::message::Message;
use crate::record::{Record, RecordType, MAX_RECORD_PAYLOAD_LENGTH, PROTOCOL_VERSION};
use crate::types::MessageId;

/// Maximum number of ids in one ack, offer or request.
pub const MAX_MESSAGE_IDS: usize = MAX_RECORD_PAYLOAD_LENGTH / MessageId::LENGTH;

/// Maximum number of entries in a versions record.
pub const MAX_SUPPORTED_VERSIONS: usize = 10;

/// Protocol versions this implementation announces.
pub const SUPPORTED_VERSIONS: &[u8] = &[PROTOCOL_VERSION];

fn check_id_count(count: usize) -> Result<(), FormatError> {
    if count == 0 {
        return Err(FormatError::EmptyIdList);
    }
    if count > MAX_MESSAGE_IDS {
        return Err(FormatError::TooManyIds {
            count,
            max: MAX_MESSAGE_IDS,
        });
    }
    Ok(())
}

/// Decode a concatenated id list.
pub fn decode_id_list(payload: &[u8]) -> Result<Vec<MessageId>, FormatError> {
    if payload.is_empty() {
        return Err(FormatError::EmptyIdList);
    }
    if payload.len() % MessageId::LENGTH != 0 {
        return Err(FormatError::RaggedIdList(payload.len()));
    }
    check_id_count(payload.len() / MessageId::LENGTH)?;
    payload
        .chunks_exact(MessageId::LENGTH)
        .map(|chunk| {
            MessageId::try_from(chunk).map_err(|e| FormatError::MalformedMessage(e.to_string()))
        })
        .collect()
}

/// Encode an id list.
pub fn encode_id_list(ids: &[MessageId]) -> Bytes {
    let mut out = Vec::with_capacity(ids.len() * MessageId::LENGTH);
    for id in ids {
        out.extend_from_slice(id.as_bytes());
    }
    Bytes::from(out)
}

macro_rules! id_list_record {
    ($(#[$meta:meta])* $name:ident, $record_type:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            ids: Vec<MessageId>,
        }

        impl $name {
            /// Create from 1 to `MAX_MESSAGE_IDS` ids.
            pub fn new(ids: Vec<MessageId>) -> Result<Self, FormatError> {
                check_id_count(ids.len())?;
                Ok(Self { ids })
            }

            pub fn ids(&self) -> &[MessageId] {
                &self.ids
            }

            pub fn into_ids(self) -> Vec<MessageId> {
                self.ids
            }

            pub fn encode_payload(&self) -> Bytes {
                encode_id_list(&self.ids)
            }

            pub fn decode_payload(payload: &[u8]) -> Result<Self, FormatError> {
                Ok(Self {
                    ids: decode_id_list(payload)?,
                })
            }

            pub fn to_record(&self) -> Result<Record, FormatError> {
                Record::new($record_type.as_u8(), self.encode_payload())
            }
        }
    };
}

id_list_record! {
    /// Acknowledges messages the sender has received.
    Ack, RecordType::Ack
}

id_list_record! {
    /// Offers messages the sender could send.
    Offer, RecordType::Offer
}

id_list_record! {
    /// Requests offered messages the sender does not have.
    Request, RecordType::Request
}

/// Announces the protocol versions the sender supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versions {
    versions: Vec<u8>,
}

impl Versions {
    pub fn new(versions: Vec<u8>) -> Result<Self, FormatError> {
        if versions.is_empty() || versions.len() > MAX_SUPPORTED_VERSIONS {
            return Err(FormatError::BadVersionCount {
                count: versions.len(),
                max: MAX_SUPPORTED_VERSIONS,
            });
        }
        Ok(Self { versions })
    }

    /// The versions this implementation supports.
    pub fn supported() -> Self {
        Self {
            versions: SUPPORTED_VERSIONS.to_vec(),
        }
    }

    pub fn versions(&self) -> &[u8] {
        &self.versions
    }

    /// Highest version both sides support.
    pub fn best_common(&self, other: &Versions) -> Option<u8> {
        self.versions
            .iter()
            .filter(|v| other.versions.contains(v))
            .max()
            .copied()
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, FormatError> {
        Self::new(payload.to_vec())
    }

    pub fn to_record(&self) -> Result<Record, FormatError> {
        Record::new(RecordType::Versions.as_u8(), self.versions.clone())
    }
}

/// Any record the sync layer understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    Ack(Ack),
    Message(Message),
    Offer(Offer),
    Request(Request),
    Versions(Versions),
}

impl SyncMessage {
    pub fn record_type(&self) -> RecordType {
        match self {
            SyncMessage::Ack(_) => RecordType::Ack,
            SyncMessage::Message(_) => RecordType::Message,
            SyncMessage::Offer(_) => RecordType::Offer,
            SyncMessage::Request(_) => RecordType::Request,
            SyncMessage::Versions(_) => RecordType::Versions,
        }
    }

    pub fn to_record(&self) -> Result<Record, FormatError> {
        match self {
            SyncMessage::Ack(ack) => ack.to_record(),
            SyncMessage::Message(m) => Record::new(RecordType::Message.as_u8(), m.raw().clone()),
            SyncMessage::Offer(offer) => offer.to_record(),
            SyncMessage::Request(request) => request.to_record(),
            SyncMessage::Versions(versions) => versions.to_record(),
        }
    }

    /// Decode a record of a known type. The caller checks the version and
    /// skips unknown types before calling this.
    pub fn from_record(kind: RecordType, payload: Bytes) -> Result<Self, FormatError> {
        Ok(match kind {
            RecordType::Ack => SyncMessage::Ack(Ack::decode_payload(&payload)?),
            RecordType::Message => SyncMessage::Message(Message::from_raw(payload)?),
            RecordType::Offer => SyncMessage::Offer(Offer::decode_payload(&payload)?),
            RecordType::Request => SyncMessage::Request(Request::decode_payload(&payload)?),
            RecordType::Versions => SyncMessage::Versions(Versions::decode_payload(&payload)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(n: usize) -> Vec<MessageId> {
        (0..n)
            .map(|i| {
                let mut bytes = [0u8; 32];
                bytes[..8].copy_from_slice(&(i as u64).to_be_bytes());
                MessageId(bytes)
            })
            .collect()
    }

    #[test]
    fn test_max_ids_is_payload_sized() {
        assert_eq!(MAX_MESSAGE_IDS, 1536);
        assert_eq!(MAX_MESSAGE_IDS * MessageId::LENGTH, MAX_RECORD_PAYLOAD_LENGTH);
    }

    #[test]
    fn test_ack_boundaries() {
        let payload = encode_id_list(&ids(MAX_MESSAGE_IDS));
        assert_eq!(Ack::decode_payload(&payload).unwrap().ids().len(), MAX_MESSAGE_IDS);

        let payload = encode_id_list(&ids(MAX_MESSAGE_IDS + 1));
        assert!(matches!(
            Ack::decode_payload(&payload),
            Err(FormatError::TooManyIds { .. })
        ));

        assert_eq!(Ack::decode_payload(&[]), Err(FormatError::EmptyIdList));
        assert!(Ack::new(Vec::new()).is_err());
    }

    #[test]
    fn test_ragged_id_list_rejected() {
        let mut payload = encode_id_list(&ids(2)).to_vec();
        payload.pop();
        assert_eq!(
            Request::decode_payload(&payload),
            Err(FormatError::RaggedIdList(63))
        );
    }

    #[test]
    fn test_versions_limits() {
        assert!(Versions::decode_payload(&[]).is_err());
        assert!(Versions::decode_payload(&[0; MAX_SUPPORTED_VERSIONS]).is_ok());
        assert!(Versions::decode_payload(&[0; MAX_SUPPORTED_VERSIONS + 1]).is_err());
    }

    #[test]
    fn test_best_common_version() {
        let ours = Versions::new(vec![0, 1, 2]).unwrap();
        let theirs = Versions::new(vec![1, 2, 3]).unwrap();
        assert_eq!(ours.best_common(&theirs), Some(2));
        let disjoint = Versions::new(vec![9]).unwrap();
        assert_eq!(ours.best_common(&disjoint), None);
    }

    proptest! {
        #[test]
        fn id_list_records_roundtrip(
            raw in prop::collection::vec(any::<[u8; 32]>(), 1..=MAX_MESSAGE_IDS),
            kind in 0u8..3,
        ) {
            let ids: Vec<MessageId> = raw.into_iter().map(MessageId).collect();
            let message = match kind {
                0 => SyncMessage::Ack(Ack::new(ids).unwrap()),
                1 => SyncMessage::Offer(Offer::new(ids).unwrap()),
                _ => SyncMessage::Request(Request::new(ids).unwrap()),
            };
            let record = message.to_record().unwrap();
            let kind = record.known_type().unwrap();
            let decoded = SyncMessage::from_record(kind, record.into_payload()).unwrap();
            prop_assert_eq!(decoded, message);
        }
    }
}
