//! Per-message protocol state and per-contact group visibility.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a message is in the validation and delivery pipeline.
///
/// `Invalid` and `Delivered` are terminal: a message never leaves `Invalid`
/// and is never delivered twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    /// Received or created, not yet validated. Also reported for
    /// dependencies that have not arrived.
    Unknown,
    /// Valid, waiting for dependencies to be delivered.
    Pending,
    /// Rejected, or depends on a rejected message.
    Invalid,
    /// Handed to its client.
    Delivered,
}

impl MessageState {
    /// Stable numeric code, used by persistent stores.
    pub fn as_i64(self) -> i64 {
        match self {
            MessageState::Unknown => 0,
            MessageState::Invalid => 1,
            MessageState::Pending => 2,
            MessageState::Delivered => 3,
        }
    }

    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            0 => Some(MessageState::Unknown),
            1 => Some(MessageState::Invalid),
            2 => Some(MessageState::Pending),
            3 => Some(MessageState::Delivered),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Invalid | MessageState::Delivered)
    }

    /// Whether a stored message in this state may be moved to `next`.
    pub fn can_transition_to(self, next: MessageState) -> bool {
        use MessageState::*;
        match (self, next) {
            (Unknown, Pending | Delivered | Invalid) => true,
            (Pending, Pending | Delivered | Invalid) => true,
            (Invalid, Invalid) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageState::Unknown => "unknown",
            MessageState::Pending => "pending",
            MessageState::Invalid => "invalid",
            MessageState::Delivered => "delivered",
        };
        f.write_str(name)
    }
}

/// How a group is visible to a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Visibility {
    /// The contact cannot see the group; its messages are neither accepted
    /// from nor sent to the contact.
    #[default]
    Invisible,
    /// The contact can see the group; messages are accepted but not sent.
    Visible,
    /// Messages are exchanged in both directions.
    Shared,
}

impl Visibility {
    pub fn as_i64(self) -> i64 {
        match self {
            Visibility::Invisible => 0,
            Visibility::Visible => 1,
            Visibility::Shared => 2,
        }
    }

    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            0 => Some(Visibility::Invisible),
            1 => Some(Visibility::Visible),
            2 => Some(Visibility::Shared),
            _ => None,
        }
    }

    pub fn is_visible(self) -> bool {
        !matches!(self, Visibility::Invisible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [MessageState; 4] = [
        MessageState::Unknown,
        MessageState::Pending,
        MessageState::Invalid,
        MessageState::Delivered,
    ];

    #[test]
    fn test_invalid_never_leaves_invalid() {
        for next in ALL {
            assert_eq!(
                MessageState::Invalid.can_transition_to(next),
                next == MessageState::Invalid
            );
        }
    }

    #[test]
    fn test_delivered_is_final() {
        for next in ALL {
            assert!(!MessageState::Delivered.can_transition_to(next));
        }
    }

    #[test]
    fn test_nothing_returns_to_unknown() {
        for from in ALL {
            assert!(!from.can_transition_to(MessageState::Unknown));
        }
    }

    #[test]
    fn test_codes_roundtrip() {
        for state in ALL {
            assert_eq!(MessageState::from_i64(state.as_i64()), Some(state));
        }
        assert_eq!(MessageState::from_i64(9), None);
        assert_eq!(Visibility::from_i64(2), Some(Visibility::Shared));
    }
}
