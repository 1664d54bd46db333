//! Store traits: the transactional interface the sync engine runs against.
//!
//! A [`Store`] hands out transactions; every query and command lives on
//! [`StoreTxn`] so that each decision the engine makes is taken inside the
//! transaction that acts on it. Implementations include SQLite (primary)
//! and in-memory (for tests).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use courier_core::{
    Ack, ClientKey, ContactId, Group, GroupId, Message, MessageId, MessageState, Metadata,
    Offer, Request, Visibility,
};

use crate::error::{Result, StoreError};

/// Maximum number of offered ids remembered per contact for requesting.
pub const MAX_OFFERED_MESSAGES: usize = 1000;

/// Operations available inside a transaction.
///
/// Write operations in a read-only transaction fail with
/// [`StoreError::ReadOnly`]. Nothing is visible to other transactions until
/// commit.
pub trait StoreTxn {
    /// Whether this transaction was opened read-only.
    fn is_read_only(&self) -> bool;

    // ─────────────────────────────────────────────────────────────────────────
    // Contacts
    // ─────────────────────────────────────────────────────────────────────────

    fn add_contact(&mut self, contact: ContactId) -> Result<()>;

    /// Remove a contact with its group visibilities and message statuses.
    fn remove_contact(&mut self, contact: ContactId) -> Result<()>;

    fn contains_contact(&self, contact: ContactId) -> Result<bool>;

    fn get_contacts(&self) -> Result<Vec<ContactId>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a group. Adding an existing group is a no-op.
    fn add_group(&mut self, group: &Group) -> Result<()>;

    /// Remove a group and every message in it.
    fn remove_group(&mut self, group: &GroupId) -> Result<()>;

    fn contains_group(&self, group: &GroupId) -> Result<bool>;

    /// Fails with [`StoreError::NoSuchGroup`] if the group does not exist.
    fn get_group(&self, group: &GroupId) -> Result<Group>;

    fn get_group_visibility(&self, contact: ContactId, group: &GroupId) -> Result<Visibility>;

    fn set_group_visibility(
        &mut self,
        contact: ContactId,
        group: &GroupId,
        visibility: Visibility,
    ) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Store a message. `source` is the contact it came from, or `None` for a
    /// locally created message.
    fn add_message(
        &mut self,
        message: &Message,
        state: MessageState,
        shared: bool,
        source: Option<ContactId>,
    ) -> Result<()>;

    /// Whether a row exists for the message, including deleted (invalid) ones.
    fn contains_message(&self, id: &MessageId) -> Result<bool>;

    /// Load a message. Fails with [`StoreError::NoSuchMessage`] if it does
    /// not exist or its raw bytes were deleted.
    fn get_message(&self, id: &MessageId) -> Result<Message>;

    /// Delete the raw bytes of a message, keeping its state.
    fn delete_message(&mut self, id: &MessageId) -> Result<()>;

    fn get_message_state(&self, id: &MessageId) -> Result<MessageState>;

    /// Change the state of a message. Transitions that would break the state
    /// machine fail with [`StoreError::IllegalStateTransition`].
    fn set_message_state(&mut self, id: &MessageId, state: MessageState) -> Result<()>;

    fn is_message_shared(&self, id: &MessageId) -> Result<bool>;

    fn set_message_shared(&mut self, id: &MessageId) -> Result<()>;

    fn get_message_metadata(&self, id: &MessageId) -> Result<Metadata>;

    fn merge_message_metadata(&mut self, id: &MessageId, metadata: &Metadata) -> Result<()>;

    fn delete_message_metadata(&mut self, id: &MessageId) -> Result<()>;

    /// Record `dependent -> dependency` edges.
    fn add_message_dependencies(
        &mut self,
        dependent: &Message,
        dependencies: &[MessageId],
    ) -> Result<()>;

    /// States of the messages `id` depends on. A dependency that has not
    /// arrived is `Unknown`; one in a different group is `Invalid`.
    fn get_message_dependencies(&self, id: &MessageId)
        -> Result<BTreeMap<MessageId, MessageState>>;

    /// States of the messages that depend on `id`.
    fn get_message_dependents(&self, id: &MessageId) -> Result<BTreeMap<MessageId, MessageState>>;

    /// `Unknown` messages with raw bytes in this client's groups.
    fn get_messages_to_validate(&self, client: &ClientKey) -> Result<Vec<MessageId>>;

    /// `Pending` messages with raw bytes in this client's groups.
    fn get_pending_messages(&self, client: &ClientKey) -> Result<Vec<MessageId>>;

    /// Delivered, unshared messages that a shared message depends on.
    fn get_messages_to_share(&self, client: &ClientKey) -> Result<Vec<MessageId>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Outgoing sync
    // ─────────────────────────────────────────────────────────────────────────

    /// Take up to `max_ids` ids we owe the contact an ack for, clearing the
    /// flags. `None` when nothing is owed.
    fn generate_ack(&mut self, contact: ContactId, max_ids: usize) -> Result<Option<Ack>>;

    /// Peek at up to `max_ids` ids we owe the contact an ack for.
    fn get_messages_to_ack(&self, contact: ContactId, max_ids: usize) -> Result<Vec<MessageId>>;

    /// Clear ack flags after an ack was delivered by other means.
    fn set_ack_sent(&mut self, contact: ContactId, ids: &[MessageId]) -> Result<()>;

    /// Every sendable message the contact has not acknowledged, oldest
    /// first, regardless of retransmission timers.
    fn get_unacked_messages_to_send(&self, contact: ContactId) -> Result<Vec<MessageId>>;

    /// Sendable messages due for (re)transmission, oldest first, whose
    /// records fit in `capacity` bytes in total.
    fn get_messages_to_send(
        &self,
        contact: ContactId,
        capacity: u64,
        max_latency: Duration,
    ) -> Result<Vec<MessageId>>;

    /// Re-check that a message is still sendable and load it. With
    /// `mark_sent` the transmission is recorded immediately (requires a
    /// read-write transaction). `None` if the message is no longer sendable.
    fn get_message_to_send(
        &mut self,
        contact: ContactId,
        id: &MessageId,
        max_latency: Duration,
        mark_sent: bool,
    ) -> Result<Option<Message>>;

    /// Record a transmission that happened outside `get_message_to_send`.
    fn set_message_sent(
        &mut self,
        contact: ContactId,
        id: &MessageId,
        max_latency: Duration,
    ) -> Result<()>;

    /// Take up to `max_ids` sendable messages that are due and were not
    /// requested, oldest first, and record a transmission for each. The
    /// offer stands in for the message until the contact requests it.
    /// `None` when nothing is due.
    fn generate_offer(
        &mut self,
        contact: ContactId,
        max_ids: usize,
        max_latency: Duration,
    ) -> Result<Option<Offer>>;

    /// Take up to `max_ids` offered ids to request from the contact.
    fn generate_request(&mut self, contact: ContactId, max_ids: usize)
        -> Result<Option<Request>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Incoming sync
    // ─────────────────────────────────────────────────────────────────────────

    /// The contact has these messages.
    fn receive_ack(&mut self, contact: ContactId, ack: &Ack) -> Result<()>;

    /// Store a message received from the contact. Returns true if the
    /// message is new and must be validated. Messages in groups the contact
    /// cannot see are dropped.
    fn receive_message(&mut self, contact: ContactId, message: &Message) -> Result<bool>;

    /// Ack offered messages we have; remember the rest for a request.
    fn receive_offer(&mut self, contact: ContactId, offer: &Offer) -> Result<()>;

    /// Make requested messages due for sending immediately.
    fn receive_request(&mut self, contact: ContactId, request: &Request) -> Result<()>;
}

/// A transactional store.
///
/// Two transaction styles are offered: callback style ([`Store::transaction`],
/// [`Store::transaction_blocking`]) and explicit
/// `start_transaction`/`commit_transaction`/`end_transaction`. A transaction
/// that is dropped without commit is rolled back.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Txn<'a>: StoreTxn
    where
        Self: 'a;

    /// Begin a transaction, blocking until the store lock is available.
    fn start_transaction(&self, read_only: bool) -> Result<Self::Txn<'_>>;

    /// Commit a transaction.
    fn commit_transaction(&self, txn: Self::Txn<'_>) -> Result<()>;

    /// End a transaction without committing.
    fn end_transaction(&self, txn: Self::Txn<'_>) {
        drop(txn);
    }

    /// Run `body` in a transaction on the current thread, committing if it
    /// succeeds.
    fn transaction_blocking<F, R>(&self, read_only: bool, body: F) -> Result<R>
    where
        F: FnOnce(&mut dyn StoreTxn) -> Result<R>,
    {
        let mut txn = self.start_transaction(read_only)?;
        match body(&mut txn) {
            Ok(value) => {
                self.commit_transaction(txn)?;
                Ok(value)
            }
            Err(e) => {
                self.end_transaction(txn);
                Err(e)
            }
        }
    }

    /// Run `body` in a transaction on the blocking pool.
    async fn transaction<F, R>(&self, read_only: bool, body: F) -> Result<R>
    where
        F: FnOnce(&mut dyn StoreTxn) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.transaction_blocking(read_only, body))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}
