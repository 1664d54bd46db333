//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.
//!
//! A read-write transaction works on a private copy of the state that
//! replaces the shared state on commit, so dropping the transaction is a
//! rollback. Copying the whole state per write is fine for test-sized data.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;

use courier_core::{
    Ack, ClientKey, ContactId, Group, GroupId, Message, MessageId, MessageState, Metadata,
    Offer, Request, Visibility,
};

use crate::error::{Result, StoreError};
use crate::retransmission::{calculate_expiry, is_due, latency_millis, now_millis, record_length};
use crate::traits::{Store, StoreTxn, MAX_OFFERED_MESSAGES};

/// In-memory store implementation.
///
/// All data is lost when the last clone is dropped.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Clone, Default)]
struct MemoryState {
    contacts: BTreeSet<ContactId>,
    groups: BTreeMap<GroupId, Group>,
    visibilities: BTreeMap<(ContactId, GroupId), Visibility>,
    messages: BTreeMap<MessageId, MessageRow>,
    /// dependent -> (dependent's group, dependencies)
    dependencies: BTreeMap<MessageId, (GroupId, BTreeSet<MessageId>)>,
    statuses: BTreeMap<(ContactId, MessageId), Status>,
    offers: BTreeMap<ContactId, Vec<MessageId>>,
}

#[derive(Clone)]
struct MessageRow {
    group_id: GroupId,
    timestamp: u64,
    /// `None` once deleted.
    raw: Option<Bytes>,
    state: MessageState,
    shared: bool,
    metadata: Metadata,
}

#[derive(Clone, Default)]
struct Status {
    ack: bool,
    seen: bool,
    requested: bool,
    tx_count: u32,
    eta: i64,
    expiry: i64,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    type Txn<'a> = MemoryTxn<'a>;

    fn start_transaction(&self, read_only: bool) -> Result<MemoryTxn<'_>> {
        let guard = self
            .state
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        let working = if read_only {
            None
        } else {
            Some(guard.clone())
        };
        Ok(MemoryTxn { guard, working })
    }

    fn commit_transaction(&self, mut txn: MemoryTxn<'_>) -> Result<()> {
        if let Some(working) = txn.working.take() {
            *txn.guard = working;
        }
        Ok(())
    }
}

/// A transaction over a [`MemoryStore`]. Holds the store lock until dropped.
pub struct MemoryTxn<'a> {
    guard: MutexGuard<'a, MemoryState>,
    working: Option<MemoryState>,
}

impl MemoryTxn<'_> {
    fn state(&self) -> &MemoryState {
        self.working.as_ref().unwrap_or(&*self.guard)
    }

    fn state_mut(&mut self) -> Result<&mut MemoryState> {
        self.working.as_mut().ok_or(StoreError::ReadOnly)
    }
}

impl MemoryState {
    fn require_contact(&self, contact: ContactId) -> Result<()> {
        if self.contacts.contains(&contact) {
            Ok(())
        } else {
            Err(StoreError::NoSuchContact(contact))
        }
    }

    fn row(&self, id: &MessageId) -> Result<&MessageRow> {
        self.messages.get(id).ok_or(StoreError::NoSuchMessage(*id))
    }

    fn row_mut(&mut self, id: &MessageId) -> Result<&mut MessageRow> {
        self.messages.get_mut(id).ok_or(StoreError::NoSuchMessage(*id))
    }

    fn visibility(&self, contact: ContactId, group: &GroupId) -> Visibility {
        self.visibilities
            .get(&(contact, *group))
            .copied()
            .unwrap_or_default()
    }

    /// Whether `id` may be sent to `contact`, ignoring retransmission timers.
    fn sendable(&self, contact: ContactId, id: &MessageId) -> Option<(&MessageRow, &Status)> {
        let row = self.messages.get(id)?;
        let status = self.statuses.get(&(contact, *id))?;
        let ok = row.raw.is_some()
            && row.state == MessageState::Delivered
            && row.shared
            && !status.seen
            && self.visibility(contact, &row.group_id) == Visibility::Shared;
        ok.then_some((row, status))
    }

    /// Sendable messages for a contact, oldest first.
    fn sendable_ordered(&self, contact: ContactId) -> Vec<(u64, MessageId, usize, &Status)> {
        let mut out: Vec<_> = self
            .statuses
            .range((contact, MessageId::from_bytes([0; 32]))..)
            .take_while(|((c, _), _)| *c == contact)
            .filter_map(|((_, id), _)| {
                self.sendable(contact, id).map(|(row, status)| {
                    let len = row.raw.as_ref().map_or(0, Bytes::len);
                    (row.timestamp, *id, len, status)
                })
            })
            .collect();
        out.sort_by_key(|(timestamp, id, _, _)| (*timestamp, *id));
        out
    }

    fn ids_for_client(
        &self,
        client: &ClientKey,
        pred: impl Fn(&MessageRow) -> bool,
    ) -> Vec<MessageId> {
        let mut out: Vec<_> = self
            .messages
            .iter()
            .filter(|(_, row)| {
                self.groups
                    .get(&row.group_id)
                    .is_some_and(|g| g.client() == client)
                    && pred(row)
            })
            .map(|(id, row)| (row.timestamp, *id))
            .collect();
        out.sort();
        out.into_iter().map(|(_, id)| id).collect()
    }

    fn acks_owed(&self, contact: ContactId, max_ids: usize) -> Vec<MessageId> {
        self.statuses
            .iter()
            .filter(|((c, _), s)| *c == contact && s.ack)
            .map(|((_, id), _)| *id)
            .take(max_ids)
            .collect()
    }

    fn mark_sent(&mut self, contact: ContactId, id: &MessageId, max_latency: Duration) {
        if let Some(status) = self.statuses.get_mut(&(contact, *id)) {
            let now = now_millis();
            status.tx_count = status.tx_count.saturating_add(1);
            status.eta = now.saturating_add(latency_millis(max_latency));
            status.expiry = calculate_expiry(now, max_latency, status.tx_count);
            status.requested = false;
        }
    }
}

impl StoreTxn for MemoryTxn<'_> {
    fn is_read_only(&self) -> bool {
        self.working.is_none()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Contacts
    // ─────────────────────────────────────────────────────────────────────────

    fn add_contact(&mut self, contact: ContactId) -> Result<()> {
        self.state_mut()?.contacts.insert(contact);
        Ok(())
    }

    fn remove_contact(&mut self, contact: ContactId) -> Result<()> {
        let state = self.state_mut()?;
        if !state.contacts.remove(&contact) {
            return Err(StoreError::NoSuchContact(contact));
        }
        state.visibilities.retain(|(c, _), _| *c != contact);
        state.statuses.retain(|(c, _), _| *c != contact);
        state.offers.remove(&contact);
        Ok(())
    }

    fn contains_contact(&self, contact: ContactId) -> Result<bool> {
        Ok(self.state().contacts.contains(&contact))
    }

    fn get_contacts(&self) -> Result<Vec<ContactId>> {
        Ok(self.state().contacts.iter().copied().collect())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────────

    fn add_group(&mut self, group: &Group) -> Result<()> {
        self.state_mut()?
            .groups
            .entry(group.id())
            .or_insert_with(|| group.clone());
        Ok(())
    }

    fn remove_group(&mut self, group: &GroupId) -> Result<()> {
        let state = self.state_mut()?;
        if state.groups.remove(group).is_none() {
            return Err(StoreError::NoSuchGroup(*group));
        }
        let doomed: BTreeSet<MessageId> = state
            .messages
            .iter()
            .filter(|(_, row)| row.group_id == *group)
            .map(|(id, _)| *id)
            .collect();
        state.messages.retain(|id, _| !doomed.contains(id));
        state.dependencies.retain(|id, _| !doomed.contains(id));
        state.statuses.retain(|(_, id), _| !doomed.contains(id));
        state.visibilities.retain(|(_, g), _| g != group);
        Ok(())
    }

    fn contains_group(&self, group: &GroupId) -> Result<bool> {
        Ok(self.state().groups.contains_key(group))
    }

    fn get_group(&self, group: &GroupId) -> Result<Group> {
        self.state()
            .groups
            .get(group)
            .cloned()
            .ok_or(StoreError::NoSuchGroup(*group))
    }

    fn get_group_visibility(&self, contact: ContactId, group: &GroupId) -> Result<Visibility> {
        let state = self.state();
        state.require_contact(contact)?;
        Ok(state.visibility(contact, group))
    }

    fn set_group_visibility(
        &mut self,
        contact: ContactId,
        group: &GroupId,
        visibility: Visibility,
    ) -> Result<()> {
        let state = self.state_mut()?;
        state.require_contact(contact)?;
        if !state.groups.contains_key(group) {
            return Err(StoreError::NoSuchGroup(*group));
        }
        let was_visible = state.visibility(contact, group).is_visible();
        if visibility.is_visible() {
            state.visibilities.insert((contact, *group), visibility);
        } else {
            state.visibilities.remove(&(contact, *group));
        }

        let in_group: Vec<MessageId> = state
            .messages
            .iter()
            .filter(|(_, row)| row.group_id == *group)
            .map(|(id, _)| *id)
            .collect();
        match (was_visible, visibility.is_visible()) {
            (false, true) => {
                for id in in_group {
                    state.statuses.entry((contact, id)).or_default();
                }
            }
            (true, false) => {
                for id in in_group {
                    state.statuses.remove(&(contact, id));
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────────

    fn add_message(
        &mut self,
        message: &Message,
        state: MessageState,
        shared: bool,
        source: Option<ContactId>,
    ) -> Result<()> {
        let db = self.state_mut()?;
        let group_id = message.group_id();
        if !db.groups.contains_key(&group_id) {
            return Err(StoreError::NoSuchGroup(group_id));
        }
        if db.messages.contains_key(&message.id()) {
            return Ok(());
        }
        db.messages.insert(
            message.id(),
            MessageRow {
                group_id,
                timestamp: message.timestamp(),
                raw: Some(message.raw().clone()),
                state,
                shared,
                metadata: Metadata::new(),
            },
        );

        let contacts: Vec<ContactId> = db
            .contacts
            .iter()
            .copied()
            .filter(|c| db.visibility(*c, &group_id).is_visible())
            .collect();
        for contact in contacts {
            let offered = match db.offers.get_mut(&contact) {
                Some(offers) => {
                    let before = offers.len();
                    offers.retain(|id| *id != message.id());
                    offers.len() != before
                }
                None => false,
            };
            let from_contact = source == Some(contact);
            db.statuses.insert(
                (contact, message.id()),
                Status {
                    ack: offered || from_contact,
                    seen: offered || from_contact,
                    ..Status::default()
                },
            );
        }
        Ok(())
    }

    fn contains_message(&self, id: &MessageId) -> Result<bool> {
        Ok(self.state().messages.contains_key(id))
    }

    fn get_message(&self, id: &MessageId) -> Result<Message> {
        let raw = self
            .state()
            .row(id)?
            .raw
            .clone()
            .ok_or(StoreError::NoSuchMessage(*id))?;
        Ok(Message::from_raw(raw)?)
    }

    fn delete_message(&mut self, id: &MessageId) -> Result<()> {
        self.state_mut()?.row_mut(id)?.raw = None;
        Ok(())
    }

    fn get_message_state(&self, id: &MessageId) -> Result<MessageState> {
        Ok(self.state().row(id)?.state)
    }

    fn set_message_state(&mut self, id: &MessageId, state: MessageState) -> Result<()> {
        let row = self.state_mut()?.row_mut(id)?;
        if !row.state.can_transition_to(state) {
            return Err(StoreError::IllegalStateTransition {
                id: *id,
                from: row.state,
                to: state,
            });
        }
        row.state = state;
        Ok(())
    }

    fn is_message_shared(&self, id: &MessageId) -> Result<bool> {
        Ok(self.state().row(id)?.shared)
    }

    fn set_message_shared(&mut self, id: &MessageId) -> Result<()> {
        self.state_mut()?.row_mut(id)?.shared = true;
        Ok(())
    }

    fn get_message_metadata(&self, id: &MessageId) -> Result<Metadata> {
        Ok(self.state().row(id)?.metadata.clone())
    }

    fn merge_message_metadata(&mut self, id: &MessageId, metadata: &Metadata) -> Result<()> {
        self.state_mut()?.row_mut(id)?.metadata.merge(metadata);
        Ok(())
    }

    fn delete_message_metadata(&mut self, id: &MessageId) -> Result<()> {
        self.state_mut()?.row_mut(id)?.metadata = Metadata::new();
        Ok(())
    }

    fn add_message_dependencies(
        &mut self,
        dependent: &Message,
        dependencies: &[MessageId],
    ) -> Result<()> {
        let state = self.state_mut()?;
        let (_, deps) = state
            .dependencies
            .entry(dependent.id())
            .or_insert_with(|| (dependent.group_id(), BTreeSet::new()));
        deps.extend(dependencies.iter().copied());
        Ok(())
    }

    fn get_message_dependencies(
        &self,
        id: &MessageId,
    ) -> Result<BTreeMap<MessageId, MessageState>> {
        let state = self.state();
        let Some((group_id, deps)) = state.dependencies.get(id) else {
            return Ok(BTreeMap::new());
        };
        Ok(deps
            .iter()
            .map(|dep| {
                let dep_state = match state.messages.get(dep) {
                    None => MessageState::Unknown,
                    Some(row) if row.group_id != *group_id => MessageState::Invalid,
                    Some(row) => row.state,
                };
                (*dep, dep_state)
            })
            .collect())
    }

    fn get_message_dependents(&self, id: &MessageId) -> Result<BTreeMap<MessageId, MessageState>> {
        let state = self.state();
        Ok(state
            .dependencies
            .iter()
            .filter(|(_, (_, deps))| deps.contains(id))
            .filter_map(|(dependent, _)| {
                state
                    .messages
                    .get(dependent)
                    .map(|row| (*dependent, row.state))
            })
            .collect())
    }

    fn get_messages_to_validate(&self, client: &ClientKey) -> Result<Vec<MessageId>> {
        Ok(self.state().ids_for_client(client, |row| {
            row.state == MessageState::Unknown && row.raw.is_some()
        }))
    }

    fn get_pending_messages(&self, client: &ClientKey) -> Result<Vec<MessageId>> {
        Ok(self.state().ids_for_client(client, |row| {
            row.state == MessageState::Pending && row.raw.is_some()
        }))
    }

    fn get_messages_to_share(&self, client: &ClientKey) -> Result<Vec<MessageId>> {
        let state = self.state();
        let wanted: BTreeSet<MessageId> = state
            .dependencies
            .iter()
            .filter(|(dependent, _)| state.messages.get(dependent).is_some_and(|r| r.shared))
            .flat_map(|(_, (_, deps))| deps.iter().copied())
            .collect();
        Ok(state.ids_for_client(client, |row| {
            row.state == MessageState::Delivered && !row.shared
        })
        .into_iter()
        .filter(|id| wanted.contains(id))
        .collect())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outgoing sync
    // ─────────────────────────────────────────────────────────────────────────

    fn generate_ack(&mut self, contact: ContactId, max_ids: usize) -> Result<Option<Ack>> {
        let state = self.state_mut()?;
        state.require_contact(contact)?;
        let ids = state.acks_owed(contact, max_ids);
        if ids.is_empty() {
            return Ok(None);
        }
        for id in &ids {
            if let Some(status) = state.statuses.get_mut(&(contact, *id)) {
                status.ack = false;
            }
        }
        Ok(Some(Ack::new(ids)?))
    }

    fn get_messages_to_ack(&self, contact: ContactId, max_ids: usize) -> Result<Vec<MessageId>> {
        let state = self.state();
        state.require_contact(contact)?;
        Ok(state.acks_owed(contact, max_ids))
    }

    fn set_ack_sent(&mut self, contact: ContactId, ids: &[MessageId]) -> Result<()> {
        let state = self.state_mut()?;
        state.require_contact(contact)?;
        for id in ids {
            if let Some(status) = state.statuses.get_mut(&(contact, *id)) {
                status.ack = false;
            }
        }
        Ok(())
    }

    fn get_unacked_messages_to_send(&self, contact: ContactId) -> Result<Vec<MessageId>> {
        let state = self.state();
        state.require_contact(contact)?;
        Ok(state
            .sendable_ordered(contact)
            .into_iter()
            .map(|(_, id, _, _)| id)
            .collect())
    }

    fn get_messages_to_send(
        &self,
        contact: ContactId,
        capacity: u64,
        max_latency: Duration,
    ) -> Result<Vec<MessageId>> {
        let state = self.state();
        state.require_contact(contact)?;
        let now = now_millis();
        let mut used = 0u64;
        let mut out = Vec::new();
        for (_, id, len, status) in state.sendable_ordered(contact) {
            if !is_due(status.expiry, status.eta, now, max_latency) {
                continue;
            }
            used += record_length(len);
            if used > capacity {
                break;
            }
            out.push(id);
        }
        Ok(out)
    }

    fn get_message_to_send(
        &mut self,
        contact: ContactId,
        id: &MessageId,
        max_latency: Duration,
        mark_sent: bool,
    ) -> Result<Option<Message>> {
        let state = self.state();
        state.require_contact(contact)?;
        let Some((row, _)) = state.sendable(contact, id) else {
            return Ok(None);
        };
        let Some(raw) = row.raw.clone() else {
            return Ok(None);
        };
        let message = Message::from_raw(raw)?;
        if mark_sent {
            self.state_mut()?.mark_sent(contact, id, max_latency);
        }
        Ok(Some(message))
    }

    fn set_message_sent(
        &mut self,
        contact: ContactId,
        id: &MessageId,
        max_latency: Duration,
    ) -> Result<()> {
        let state = self.state_mut()?;
        state.require_contact(contact)?;
        state.mark_sent(contact, id, max_latency);
        Ok(())
    }

    fn generate_offer(
        &mut self,
        contact: ContactId,
        max_ids: usize,
        max_latency: Duration,
    ) -> Result<Option<Offer>> {
        let state = self.state_mut()?;
        state.require_contact(contact)?;
        let now = now_millis();
        let ids: Vec<MessageId> = state
            .sendable_ordered(contact)
            .into_iter()
            .filter(|(_, _, _, status)| {
                !status.requested && is_due(status.expiry, status.eta, now, max_latency)
            })
            .map(|(_, id, _, _)| id)
            .take(max_ids)
            .collect();
        if ids.is_empty() {
            return Ok(None);
        }
        for id in &ids {
            state.mark_sent(contact, id, max_latency);
        }
        Ok(Some(Offer::new(ids)?))
    }

    fn generate_request(
        &mut self,
        contact: ContactId,
        max_ids: usize,
    ) -> Result<Option<Request>> {
        let state = self.state_mut()?;
        state.require_contact(contact)?;
        let Some(offers) = state.offers.get_mut(&contact) else {
            return Ok(None);
        };
        if offers.is_empty() {
            return Ok(None);
        }
        let take = offers.len().min(max_ids);
        let ids: Vec<MessageId> = offers.drain(..take).collect();
        Ok(Some(Request::new(ids)?))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Incoming sync
    // ─────────────────────────────────────────────────────────────────────────

    fn receive_ack(&mut self, contact: ContactId, ack: &Ack) -> Result<()> {
        let state = self.state_mut()?;
        state.require_contact(contact)?;
        for id in ack.ids() {
            if let Some(status) = state.statuses.get_mut(&(contact, *id)) {
                status.seen = true;
            }
        }
        Ok(())
    }

    fn receive_message(&mut self, contact: ContactId, message: &Message) -> Result<bool> {
        let state = self.state_mut()?;
        state.require_contact(contact)?;
        if !state.visibility(contact, &message.group_id()).is_visible() {
            return Ok(false);
        }
        if let Some(status) = state.statuses.get_mut(&(contact, message.id())) {
            status.ack = true;
            status.seen = true;
            return Ok(false);
        }
        if state.messages.contains_key(&message.id()) {
            return Ok(false);
        }
        self.add_message(message, MessageState::Unknown, false, Some(contact))?;
        Ok(true)
    }

    fn receive_offer(&mut self, contact: ContactId, offer: &Offer) -> Result<()> {
        let state = self.state_mut()?;
        state.require_contact(contact)?;
        for id in offer.ids() {
            if let Some(status) = state.statuses.get_mut(&(contact, *id)) {
                status.ack = true;
                status.seen = true;
                continue;
            }
            let offers = state.offers.entry(contact).or_default();
            if offers.len() < MAX_OFFERED_MESSAGES && !offers.contains(id) {
                offers.push(*id);
            }
        }
        Ok(())
    }

    fn receive_request(&mut self, contact: ContactId, request: &Request) -> Result<()> {
        let state = self.state_mut()?;
        state.require_contact(contact)?;
        for id in request.ids() {
            if let Some(status) = state.statuses.get_mut(&(contact, *id)) {
                status.requested = true;
                status.expiry = 0;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    #[test]
    fn test_memory_store_conformance() {
        conformance::run_all(&MemoryStore::new());
    }

    #[test]
    fn test_rollback_on_drop() {
        let store = MemoryStore::new();
        {
            let mut txn = store.start_transaction(false).unwrap();
            txn.add_contact(ContactId(1)).unwrap();
            store.end_transaction(txn);
        }
        let txn = store.start_transaction(true).unwrap();
        assert!(!txn.contains_contact(ContactId(1)).unwrap());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let store = MemoryStore::new();
        let mut txn = store.start_transaction(true).unwrap();
        assert!(txn.is_read_only());
        assert!(matches!(
            txn.add_contact(ContactId(1)),
            Err(StoreError::ReadOnly)
        ));
    }

    #[tokio::test]
    async fn test_async_transaction_commits() {
        let store = MemoryStore::new();
        store
            .transaction(false, |txn| txn.add_contact(ContactId(9)))
            .await
            .unwrap();
        let contacts = store
            .transaction(true, |txn| txn.get_contacts())
            .await
            .unwrap();
        assert_eq!(contacts, vec![ContactId(9)]);
    }

    #[tokio::test]
    async fn test_failed_body_rolls_back() {
        let store = MemoryStore::new();
        let result: Result<()> = store
            .transaction(false, |txn| {
                txn.add_contact(ContactId(2))?;
                Err(StoreError::NoSuchContact(ContactId(3)))
            })
            .await;
        assert!(result.is_err());
        let present = store
            .transaction(true, |txn| txn.contains_contact(ContactId(2)))
            .await
            .unwrap();
        assert!(!present);
    }
}
