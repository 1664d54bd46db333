//! Strong type definitions for identifiers.
//!
//! All identifiers are newtypes to prevent misuse at compile time. Message
//! and group identifiers are 32-byte content addresses, ordered as raw bytes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length in bytes of every content-derived identifier.
pub const UNIQUE_ID_LENGTH: usize = 32;

macro_rules! unique_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; UNIQUE_ID_LENGTH]);

        impl $name {
            /// Length of the identifier on the wire.
            pub const LENGTH: usize = UNIQUE_ID_LENGTH;

            /// Create from raw bytes.
            pub const fn from_bytes(bytes: [u8; UNIQUE_ID_LENGTH]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes.
            pub const fn as_bytes(&self) -> &[u8; UNIQUE_ID_LENGTH] {
                &self.0
            }

            /// Convert to hex string.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from hex string.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                let arr: [u8; UNIQUE_ID_LENGTH] = bytes
                    .try_into()
                    .map_err(|_| hex::FromHexError::InvalidStringLength)?;
                Ok(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..16])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.to_hex()[..16])
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; UNIQUE_ID_LENGTH]> for $name {
            fn from(bytes: [u8; UNIQUE_ID_LENGTH]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = std::array::TryFromSliceError;

            fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
                let arr: [u8; UNIQUE_ID_LENGTH] = slice.try_into()?;
                Ok(Self(arr))
            }
        }
    };
}

unique_id! {
    /// A 32-byte message identifier, derived from the raw message bytes.
    ///
    /// Two messages with the same bytes have the same id.
    MessageId
}

unique_id! {
    /// A 32-byte group identifier, derived from the owning client and the
    /// group descriptor.
    GroupId
}

/// Local handle for a contact.
///
/// Contact ids are assigned by the local store and never leave the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId(pub u32);

impl ContactId {
    /// Get the numeric value.
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "contact-{}", self.0)
    }
}

impl From<u32> for ContactId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_hex_roundtrip() {
        let id = MessageId::from_bytes([0x42; 32]);
        let recovered = MessageId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, recovered);
    }

    #[test]
    fn test_from_hex_rejects_wrong_length() {
        assert!(GroupId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_ids_order_as_raw_bytes() {
        let mut low = [0u8; 32];
        low[31] = 0xff;
        let mut high = [0u8; 32];
        high[0] = 0x01;
        assert!(MessageId(low) < MessageId(high));
    }

    #[test]
    fn test_display_and_debug() {
        let id = GroupId::from_bytes([0xab; 32]);
        assert_eq!(format!("{}", id), "abababababababab");
        assert!(format!("{:?}", id).starts_with("GroupId("));
        assert_eq!(ContactId(7).to_string(), "contact-7");
    }
}
