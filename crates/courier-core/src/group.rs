//! Groups and the application clients that own them.
//!
//! A group is a logical channel owned by one client. Its id is derived from
//! the client, the client's major version and an opaque descriptor, so two
//! devices that agree on those inputs agree on the id.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FormatError;
use crate::types::GroupId;

/// Maximum length in bytes of a client identifier.
pub const MAX_CLIENT_ID_LENGTH: usize = 100;

/// Maximum length in bytes of a group descriptor.
pub const MAX_GROUP_DESCRIPTOR_LENGTH: usize = 16 * 1024;

const GROUP_ID_DOMAIN: &[u8] = b"courier-group-id-v0:";

/// Identifier of an application client, e.g. `"org.example.forum"`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Create a client id, checking its length.
    pub fn new(id: impl Into<String>) -> Result<Self, FormatError> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_CLIENT_ID_LENGTH {
            return Err(FormatError::MalformedGroup(format!(
                "client id must be 1 to {} bytes, got {}",
                MAX_CLIENT_ID_LENGTH,
                id.len()
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A client at a given major version.
///
/// Validators and delivery hooks are registered per key; incompatible major
/// versions of the same client are separate registrations.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientKey {
    pub client_id: ClientId,
    pub major_version: u32,
}

impl ClientKey {
    pub fn new(client_id: ClientId, major_version: u32) -> Self {
        Self {
            client_id,
            major_version,
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.client_id, self.major_version)
    }
}

/// A group: the scope every message belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    id: GroupId,
    client: ClientKey,
    descriptor: Bytes,
}

impl Group {
    /// Create a group, deriving its id.
    pub fn new(client: ClientKey, descriptor: impl Into<Bytes>) -> Result<Self, FormatError> {
        let descriptor = descriptor.into();
        if descriptor.len() > MAX_GROUP_DESCRIPTOR_LENGTH {
            return Err(FormatError::MalformedGroup(format!(
                "descriptor of {} bytes exceeds maximum of {}",
                descriptor.len(),
                MAX_GROUP_DESCRIPTOR_LENGTH
            )));
        }
        let id = Self::derive_id(&client, &descriptor);
        Ok(Self {
            id,
            client,
            descriptor,
        })
    }

    /// Derive a group id from the client and descriptor.
    pub fn derive_id(client: &ClientKey, descriptor: &[u8]) -> GroupId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(GROUP_ID_DOMAIN);
        let client_id = client.client_id.as_str().as_bytes();
        hasher.update(&(client_id.len() as u32).to_be_bytes());
        hasher.update(client_id);
        hasher.update(&client.major_version.to_be_bytes());
        hasher.update(descriptor);
        GroupId(*hasher.finalize().as_bytes())
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn client(&self) -> &ClientKey {
        &self.client
    }

    pub fn descriptor(&self) -> &[u8] {
        &self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(name: &str, major: u32) -> ClientKey {
        ClientKey::new(ClientId::new(name).unwrap(), major)
    }

    #[test]
    fn test_group_id_is_deterministic() {
        let a = Group::new(client("org.example.forum", 1), &b"general"[..]).unwrap();
        let b = Group::new(client("org.example.forum", 1), &b"general"[..]).unwrap();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_group_id_depends_on_every_input() {
        let base = Group::derive_id(&client("org.example.forum", 1), b"general");
        assert_ne!(base, Group::derive_id(&client("org.example.blog", 1), b"general"));
        assert_ne!(base, Group::derive_id(&client("org.example.forum", 2), b"general"));
        assert_ne!(base, Group::derive_id(&client("org.example.forum", 1), b"random"));
    }

    #[test]
    fn test_client_id_length_limits() {
        assert!(ClientId::new("").is_err());
        assert!(ClientId::new("x".repeat(MAX_CLIENT_ID_LENGTH)).is_ok());
        assert!(ClientId::new("x".repeat(MAX_CLIENT_ID_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_descriptor_length_limit() {
        let big = vec![0u8; MAX_GROUP_DESCRIPTOR_LENGTH + 1];
        assert!(Group::new(client("org.example.forum", 0), big).is_err());
    }
}
