//! A store wrapper that injects faults.
//!
//! [`FaultyStore`] forwards everything to an inner [`Store`] except:
//!
//! - **Vanishing messages**: `get_message_to_send` returns `None` for ids
//!   marked with [`FaultyStore::vanish`], as if the message stopped being
//!   sendable between the candidate query and the load.
//! - **Failing operations**: operations marked with [`FaultyStore::fail`]
//!   return an error until healed.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_core::{
    Ack, ClientKey, ContactId, Group, GroupId, Message, MessageId, MessageState, Metadata,
    Offer, Request, Visibility,
};
use courier_store::{Result, Store, StoreError, StoreTxn};

/// Operations whose failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    StartTransaction,
    Commit,
    GenerateAck,
    GetMessagesToAck,
    GetUnackedMessagesToSend,
    GetMessagesToSend,
    GetMessageToSend,
    GenerateOffer,
    ReceiveMessage,
    ReceiveAck,
}

#[derive(Debug, Default)]
struct Faults {
    vanished: Mutex<HashSet<MessageId>>,
    failing: Mutex<HashSet<Operation>>,
}

impl Faults {
    fn check(&self, op: Operation) -> Result<()> {
        let failing = self
            .failing
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        if failing.contains(&op) {
            return Err(StoreError::Task(format!("injected failure in {op:?}")));
        }
        Ok(())
    }

    fn vanished(&self, id: &MessageId) -> Result<bool> {
        Ok(self
            .vanished
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?
            .contains(id))
    }
}

/// A [`Store`] with injectable faults. Clones share their faults.
#[derive(Debug, Clone)]
pub struct FaultyStore<S> {
    inner: S,
    faults: Arc<Faults>,
}

impl<S: Store> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Arc::default(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Make `id` look unsendable to `get_message_to_send`.
    pub fn vanish(&self, id: MessageId) {
        if let Ok(mut vanished) = self.faults.vanished.lock() {
            vanished.insert(id);
        }
    }

    /// Make `op` fail until [`FaultyStore::heal`] is called.
    pub fn fail(&self, op: Operation) {
        if let Ok(mut failing) = self.faults.failing.lock() {
            failing.insert(op);
        }
    }

    pub fn heal(&self, op: Operation) {
        if let Ok(mut failing) = self.faults.failing.lock() {
            failing.remove(&op);
        }
    }
}

impl<S: Store> Store for FaultyStore<S> {
    type Txn<'a> = FaultyTxn<S::Txn<'a>>
    where
        Self: 'a;

    fn start_transaction(&self, read_only: bool) -> Result<Self::Txn<'_>> {
        self.faults.check(Operation::StartTransaction)?;
        Ok(FaultyTxn {
            inner: self.inner.start_transaction(read_only)?,
            faults: Arc::clone(&self.faults),
        })
    }

    fn commit_transaction(&self, txn: Self::Txn<'_>) -> Result<()> {
        self.faults.check(Operation::Commit)?;
        self.inner.commit_transaction(txn.inner)
    }

    fn end_transaction(&self, txn: Self::Txn<'_>) {
        self.inner.end_transaction(txn.inner)
    }
}

/// A transaction of a [`FaultyStore`].
pub struct FaultyTxn<T> {
    inner: T,
    faults: Arc<Faults>,
}

impl<T: StoreTxn> StoreTxn for FaultyTxn<T> {
    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn add_contact(&mut self, contact: ContactId) -> Result<()> {
        self.inner.add_contact(contact)
    }

    fn remove_contact(&mut self, contact: ContactId) -> Result<()> {
        self.inner.remove_contact(contact)
    }

    fn contains_contact(&self, contact: ContactId) -> Result<bool> {
        self.inner.contains_contact(contact)
    }

    fn get_contacts(&self) -> Result<Vec<ContactId>> {
        self.inner.get_contacts()
    }

    fn add_group(&mut self, group: &Group) -> Result<()> {
        self.inner.add_group(group)
    }

    fn remove_group(&mut self, group: &GroupId) -> Result<()> {
        self.inner.remove_group(group)
    }

    fn contains_group(&self, group: &GroupId) -> Result<bool> {
        self.inner.contains_group(group)
    }

    fn get_group(&self, group: &GroupId) -> Result<Group> {
        self.inner.get_group(group)
    }

    fn get_group_visibility(&self, contact: ContactId, group: &GroupId) -> Result<Visibility> {
        self.inner.get_group_visibility(contact, group)
    }

    fn set_group_visibility(
        &mut self,
        contact: ContactId,
        group: &GroupId,
        visibility: Visibility,
    ) -> Result<()> {
        self.inner.set_group_visibility(contact, group, visibility)
    }

    fn add_message(
        &mut self,
        message: &Message,
        state: MessageState,
        shared: bool,
        source: Option<ContactId>,
    ) -> Result<()> {
        self.inner.add_message(message, state, shared, source)
    }

    fn contains_message(&self, id: &MessageId) -> Result<bool> {
        self.inner.contains_message(id)
    }

    fn get_message(&self, id: &MessageId) -> Result<Message> {
        self.inner.get_message(id)
    }

    fn delete_message(&mut self, id: &MessageId) -> Result<()> {
        self.inner.delete_message(id)
    }

    fn get_message_state(&self, id: &MessageId) -> Result<MessageState> {
        self.inner.get_message_state(id)
    }

    fn set_message_state(&mut self, id: &MessageId, state: MessageState) -> Result<()> {
        self.inner.set_message_state(id, state)
    }

    fn is_message_shared(&self, id: &MessageId) -> Result<bool> {
        self.inner.is_message_shared(id)
    }

    fn set_message_shared(&mut self, id: &MessageId) -> Result<()> {
        self.inner.set_message_shared(id)
    }

    fn get_message_metadata(&self, id: &MessageId) -> Result<Metadata> {
        self.inner.get_message_metadata(id)
    }

    fn merge_message_metadata(&mut self, id: &MessageId, metadata: &Metadata) -> Result<()> {
        self.inner.merge_message_metadata(id, metadata)
    }

    fn delete_message_metadata(&mut self, id: &MessageId) -> Result<()> {
        self.inner.delete_message_metadata(id)
    }

    fn add_message_dependencies(
        &mut self,
        dependent: &Message,
        dependencies: &[MessageId],
    ) -> Result<()> {
        self.inner.add_message_dependencies(dependent, dependencies)
    }

    fn get_message_dependencies(
        &self,
        id: &MessageId,
    ) -> Result<BTreeMap<MessageId, MessageState>> {
        self.inner.get_message_dependencies(id)
    }

    fn get_message_dependents(&self, id: &MessageId) -> Result<BTreeMap<MessageId, MessageState>> {
        self.inner.get_message_dependents(id)
    }

    fn get_messages_to_validate(&self, client: &ClientKey) -> Result<Vec<MessageId>> {
        self.inner.get_messages_to_validate(client)
    }

    fn get_pending_messages(&self, client: &ClientKey) -> Result<Vec<MessageId>> {
        self.inner.get_pending_messages(client)
    }

    fn get_messages_to_share(&self, client: &ClientKey) -> Result<Vec<MessageId>> {
        self.inner.get_messages_to_share(client)
    }

    fn generate_ack(&mut self, contact: ContactId, max_ids: usize) -> Result<Option<Ack>> {
        self.faults.check(Operation::GenerateAck)?;
        self.inner.generate_ack(contact, max_ids)
    }

    fn get_messages_to_ack(&self, contact: ContactId, max_ids: usize) -> Result<Vec<MessageId>> {
        self.faults.check(Operation::GetMessagesToAck)?;
        self.inner.get_messages_to_ack(contact, max_ids)
    }

    fn set_ack_sent(&mut self, contact: ContactId, ids: &[MessageId]) -> Result<()> {
        self.inner.set_ack_sent(contact, ids)
    }

    fn get_unacked_messages_to_send(&self, contact: ContactId) -> Result<Vec<MessageId>> {
        self.faults.check(Operation::GetUnackedMessagesToSend)?;
        self.inner.get_unacked_messages_to_send(contact)
    }

    fn get_messages_to_send(
        &self,
        contact: ContactId,
        capacity: u64,
        max_latency: Duration,
    ) -> Result<Vec<MessageId>> {
        self.faults.check(Operation::GetMessagesToSend)?;
        self.inner.get_messages_to_send(contact, capacity, max_latency)
    }

    fn get_message_to_send(
        &mut self,
        contact: ContactId,
        id: &MessageId,
        max_latency: Duration,
        mark_sent: bool,
    ) -> Result<Option<Message>> {
        self.faults.check(Operation::GetMessageToSend)?;
        if self.faults.vanished(id)? {
            return Ok(None);
        }
        self.inner
            .get_message_to_send(contact, id, max_latency, mark_sent)
    }

    fn set_message_sent(
        &mut self,
        contact: ContactId,
        id: &MessageId,
        max_latency: Duration,
    ) -> Result<()> {
        self.inner.set_message_sent(contact, id, max_latency)
    }

    fn generate_offer(
        &mut self,
        contact: ContactId,
        max_ids: usize,
        max_latency: Duration,
    ) -> Result<Option<Offer>> {
        self.faults.check(Operation::GenerateOffer)?;
        self.inner.generate_offer(contact, max_ids, max_latency)
    }

    fn generate_request(&mut self, contact: ContactId, max_ids: usize) -> Result<Option<Request>> {
        self.inner.generate_request(contact, max_ids)
    }

    fn receive_ack(&mut self, contact: ContactId, ack: &Ack) -> Result<()> {
        self.faults.check(Operation::ReceiveAck)?;
        self.inner.receive_ack(contact, ack)
    }

    fn receive_message(&mut self, contact: ContactId, message: &Message) -> Result<bool> {
        self.faults.check(Operation::ReceiveMessage)?;
        self.inner.receive_message(contact, message)
    }

    fn receive_offer(&mut self, contact: ContactId, offer: &Offer) -> Result<()> {
        self.inner.receive_offer(contact, offer)
    }

    fn receive_request(&mut self, contact: ContactId, request: &Request) -> Result<()> {
        self.inner.receive_request(contact, request)
    }
}
