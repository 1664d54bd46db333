//! The generic framed record.
//!
//! ```text
//! byte 0:     protocol version
//! byte 1:     record type
//! bytes 2-3:  payload length, big-endian u16
//! bytes 4..:  payload
//! ```
//!
//! This module holds the pure parts of the codec. Reading and writing
//! records on byte streams lives with the transport code.

use bytes::Bytes;

use crate::error::FormatError;

/// The only protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u8 = 0;

/// Length of the record header.
pub const RECORD_HEADER_LENGTH: usize = 4;

/// Maximum length of a record payload.
pub const MAX_RECORD_PAYLOAD_LENGTH: usize = 48 * 1024;

/// Known record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    Ack = 0,
    Message = 1,
    Offer = 2,
    Request = 3,
    Versions = 4,
}

impl RecordType {
    /// Map a type tag to a known type. Unknown tags are not an error: newer
    /// peers may send record types this version skips.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(RecordType::Ack),
            1 => Some(RecordType::Message),
            2 => Some(RecordType::Offer),
            3 => Some(RecordType::Request),
            4 => Some(RecordType::Versions),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            RecordType::Ack => "ack",
            RecordType::Message => "message",
            RecordType::Offer => "offer",
            RecordType::Request => "request",
            RecordType::Versions => "versions",
        }
    }
}

/// A decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub payload_length: usize,
}

impl RecordHeader {
    /// Decode a header, rejecting oversized payload lengths.
    pub fn decode(header: &[u8; RECORD_HEADER_LENGTH]) -> Result<Self, FormatError> {
        let payload_length = u16::from_be_bytes([header[2], header[3]]) as usize;
        if payload_length > MAX_RECORD_PAYLOAD_LENGTH {
            return Err(FormatError::PayloadTooLong {
                len: payload_length,
                max: MAX_RECORD_PAYLOAD_LENGTH,
            });
        }
        Ok(Self {
            version: header[0],
            record_type: header[1],
            payload_length,
        })
    }
}

/// A generic record: version, type tag and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    version: u8,
    record_type: u8,
    payload: Bytes,
}

impl Record {
    /// Create a record at the current protocol version.
    pub fn new(record_type: u8, payload: impl Into<Bytes>) -> Result<Self, FormatError> {
        Self::with_version(PROTOCOL_VERSION, record_type, payload)
    }

    /// Create a record with an explicit protocol version.
    pub fn with_version(
        version: u8,
        record_type: u8,
        payload: impl Into<Bytes>,
    ) -> Result<Self, FormatError> {
        let payload = payload.into();
        if payload.len() > MAX_RECORD_PAYLOAD_LENGTH {
            return Err(FormatError::PayloadTooLong {
                len: payload.len(),
                max: MAX_RECORD_PAYLOAD_LENGTH,
            });
        }
        Ok(Self {
            version,
            record_type,
            payload,
        })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn record_type(&self) -> u8 {
        self.record_type
    }

    /// The known type of this record, if any.
    pub fn known_type(&self) -> Option<RecordType> {
        RecordType::from_u8(self.record_type)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// The encoded header.
    pub fn header(&self) -> [u8; RECORD_HEADER_LENGTH] {
        // Construction bounds the payload well below u16::MAX.
        let len = (self.payload.len() as u16).to_be_bytes();
        [self.version, self.record_type, len[0], len[1]]
    }

    /// Length of the record on the wire.
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_LENGTH + self.payload.len()
    }

    /// Encode header and payload into one buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.header());
        out.extend_from_slice(&self.payload);
        out
    }
}
