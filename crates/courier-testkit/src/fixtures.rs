//! Test fixtures and helpers.
//!
//! Common setup code for integration tests. Every helper runs its own
//! blocking transaction, so fixtures work both inside and outside a runtime.

use courier_core::{
    ClientId, ClientKey, ContactId, Group, Message, MessageId, MessageState, Visibility,
};
use courier_store::{EventBus, MemoryStore, Store, StoreTxn};

/// The client every fixture group belongs to.
pub fn test_client() -> ClientKey {
    ClientKey::new(ClientId::new("org.example.testkit").unwrap(), 0)
}

/// A store holding one group, plus an event bus.
pub struct TestFixture<S = MemoryStore> {
    pub store: S,
    pub events: EventBus,
    pub group: Group,
}

impl TestFixture<MemoryStore> {
    /// A fixture over a fresh memory store.
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }
}

impl Default for TestFixture<MemoryStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Store> TestFixture<S> {
    /// A fixture over `store`, with the fixture group added.
    pub fn with_store(store: S) -> Self {
        let group = Group::new(test_client(), b"testkit".to_vec()).unwrap();
        let fixture = Self {
            store,
            events: EventBus::default(),
            group,
        };
        let group = fixture.group.clone();
        fixture.write(move |txn| txn.add_group(&group));
        fixture
    }

    /// Run `body` in a committed read-write transaction.
    pub fn write<R>(&self, body: impl FnOnce(&mut dyn StoreTxn) -> courier_store::Result<R>) -> R {
        self.store.transaction_blocking(false, body).unwrap()
    }

    /// Run `body` in a read-only transaction.
    pub fn read<R>(&self, body: impl FnOnce(&mut dyn StoreTxn) -> courier_store::Result<R>) -> R {
        self.store.transaction_blocking(true, body).unwrap()
    }

    /// Add a contact and give it `visibility` of the fixture group.
    pub fn contact(&self, contact: ContactId, visibility: Visibility) {
        let group = self.group.id();
        self.write(move |txn| {
            txn.add_contact(contact)?;
            txn.set_group_visibility(contact, &group, visibility)
        });
    }

    /// A message in the fixture group. Not stored.
    pub fn message(&self, timestamp: u64, body: &[u8]) -> Message {
        Message::new(self.group.id(), timestamp, body).unwrap()
    }

    /// Store a local message that is delivered and shared, so it is
    /// sendable to every contact the group is shared with.
    pub fn add_sendable(&self, timestamp: u64, body: &[u8]) -> Message {
        let message = self.message(timestamp, body);
        let m = message.clone();
        self.write(move |txn| txn.add_message(&m, MessageState::Delivered, true, None));
        message
    }

    /// Store a local message in `state`, unshared.
    pub fn add_local(&self, timestamp: u64, body: &[u8], state: MessageState) -> Message {
        let message = self.message(timestamp, body);
        let m = message.clone();
        self.write(move |txn| txn.add_message(&m, state, false, None));
        message
    }

    /// Receive `count` distinct messages from `contact`, leaving that many
    /// acks owed to it.
    pub fn receive_from(&self, contact: ContactId, count: usize) -> Vec<MessageId> {
        (0..count)
            .map(|i| {
                let message = self.message(i as u64, format!("from {contact} #{i}").as_bytes());
                let m = message.clone();
                assert!(self.write(move |txn| txn.receive_message(contact, &m)));
                message.id()
            })
            .collect()
    }

    pub fn state(&self, id: &MessageId) -> MessageState {
        let id = *id;
        self.read(move |txn| txn.get_message_state(&id))
    }
}

/// Fixtures sharing one group, for multi-party tests. Party `i` knows every
/// other party `j` as `ContactId(j)` with the group shared.
pub fn multi_party_fixtures(count: usize) -> Vec<TestFixture> {
    (0..count)
        .map(|i| {
            let fixture = TestFixture::new();
            for j in (0..count).filter(|&j| j != i) {
                fixture.contact(ContactId(j as u32), Visibility::Shared);
            }
            fixture
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sendable_message_is_unacked() {
        let fixture = TestFixture::new();
        fixture.contact(ContactId(1), Visibility::Shared);
        let message = fixture.add_sendable(10, b"hello");
        let unacked = fixture.read(|txn| txn.get_unacked_messages_to_send(ContactId(1)));
        assert_eq!(unacked, vec![message.id()]);
    }

    #[test]
    fn test_receive_from_owes_acks() {
        let fixture = TestFixture::new();
        fixture.contact(ContactId(2), Visibility::Visible);
        let ids = fixture.receive_from(ContactId(2), 3);
        let mut owed = fixture.read(|txn| txn.get_messages_to_ack(ContactId(2), 10));
        let mut expected = ids.clone();
        owed.sort();
        expected.sort();
        assert_eq!(owed, expected);
        assert_eq!(fixture.state(&ids[0]), MessageState::Unknown);
    }

    #[test]
    fn test_multi_party() {
        let parties = multi_party_fixtures(3);
        let contacts = parties[1].read(|txn| txn.get_contacts());
        assert_eq!(contacts, vec![ContactId(0), ContactId(2)]);
        assert_eq!(parties[0].group.id(), parties[2].group.id());
    }
}
