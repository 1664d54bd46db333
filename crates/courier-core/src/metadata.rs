//! Client-defined message metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::FormatError;
use crate::types::MessageId;

/// Key/value metadata a client attaches to a message during validation.
///
/// Merging a key with an empty value removes the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(BTreeMap<String, Vec<u8>>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.insert(key, value);
        self
    }

    /// Apply `update` on top of this metadata.
    pub fn merge(&mut self, update: &Metadata) {
        for (key, value) in &update.0 {
            if value.is_empty() {
                self.0.remove(key);
            } else {
                self.0.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Encode as CBOR for persistence.
    pub fn to_cbor(&self) -> Result<Vec<u8>, FormatError> {
        let mut buf = Vec::new();
        ciborium::into_writer(&self.0, &mut buf)
            .map_err(|e| FormatError::MalformedMessage(format!("metadata encoding: {}", e)))?;
        Ok(buf)
    }

    /// Decode from CBOR. Empty input is empty metadata.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let map: BTreeMap<String, Vec<u8>> = ciborium::from_reader(bytes)
            .map_err(|e| FormatError::MalformedMessage(format!("metadata decoding: {}", e)))?;
        Ok(Self(map))
    }
}

/// The outcome of successful validation: metadata to store and the ids of
/// messages this one depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContext {
    pub metadata: Metadata,
    pub dependencies: Vec<MessageId>,
}

impl MessageContext {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(metadata: Metadata, dependencies: Vec<MessageId>) -> Self {
        Self {
            metadata,
            dependencies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_overwrites_and_removes() {
        let mut meta = Metadata::new().with("title", "a").with("read", vec![1u8]);
        let update = Metadata::new().with("title", "b").with("read", Vec::<u8>::new());
        meta.merge(&update);
        assert_eq!(meta.get("title"), Some(&b"b"[..]));
        assert_eq!(meta.get("read"), None);
        assert_eq!(meta.len(), 1);
    }

    #[test]
    fn test_cbor_roundtrip() {
        let meta = Metadata::new().with("k", vec![1u8, 2, 3]);
        let decoded = Metadata::from_cbor(&meta.to_cbor().unwrap()).unwrap();
        assert_eq!(decoded, meta);
        assert!(Metadata::from_cbor(&[]).unwrap().is_empty());
    }
}
