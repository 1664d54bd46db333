//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite behind a mutex; the async transaction helper runs bodies on the
//! blocking pool. Transactions are explicit `BEGIN`/`COMMIT`, and a
//! transaction dropped without commit is rolled back.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use courier_core::{
    Ack, ClientId, ClientKey, ContactId, Group, GroupId, Message, MessageId, MessageState,
    Metadata, Offer, Request, Visibility,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::retransmission::{calculate_expiry, is_due, latency_millis, now_millis, record_length};
use crate::traits::{Store, StoreTxn, MAX_OFFERED_MESSAGES};

/// SQLite-based store implementation.
///
/// Cloning shares the connection. One transaction runs at a time.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl Store for SqliteStore {
    type Txn<'a> = SqliteTxn<'a>;

    fn start_transaction(&self, read_only: bool) -> Result<SqliteTxn<'_>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        conn.execute_batch(if read_only {
            "BEGIN DEFERRED"
        } else {
            "BEGIN IMMEDIATE"
        })?;
        Ok(SqliteTxn {
            conn,
            read_only,
            open: true,
        })
    }

    fn commit_transaction(&self, mut txn: SqliteTxn<'_>) -> Result<()> {
        txn.conn.execute_batch("COMMIT")?;
        txn.open = false;
        Ok(())
    }
}

/// A transaction over a [`SqliteStore`]. Holds the connection until dropped.
pub struct SqliteTxn<'a> {
    conn: MutexGuard<'a, Connection>,
    read_only: bool,
    open: bool,
}

impl Drop for SqliteTxn<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "rollback failed");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

const STATE_DELIVERED: i64 = 3;

fn message_id(bytes: &[u8]) -> Result<MessageId> {
    MessageId::try_from(bytes)
        .map_err(|_| StoreError::Serialization(format!("message id of {} bytes", bytes.len())))
}

fn message_ids(rows: Vec<Vec<u8>>) -> Result<Vec<MessageId>> {
    rows.iter().map(|b| message_id(b)).collect()
}

fn message_state(code: i64) -> Result<MessageState> {
    MessageState::from_i64(code)
        .ok_or_else(|| StoreError::Serialization(format!("unknown message state {}", code)))
}

/// A sendable message as seen from the statuses table.
struct Candidate {
    id: MessageId,
    length: usize,
    requested: bool,
    eta: i64,
    expiry: i64,
}

const SENDABLE_QUERY: &str = "
    SELECT s.message_id, m.length, s.requested, s.eta, s.expiry
    FROM statuses AS s
    JOIN messages AS m ON m.message_id = s.message_id
    JOIN group_visibilities AS v
        ON v.contact_id = s.contact_id AND v.group_id = s.group_id
    WHERE s.contact_id = ?1
        AND s.seen = 0
        AND m.state = ?2
        AND m.shared = 1
        AND m.raw IS NOT NULL
        AND v.shared = 1";

impl SqliteTxn<'_> {
    fn writable(&self) -> Result<()> {
        if self.read_only {
            Err(StoreError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn require_contact(&self, contact: ContactId) -> Result<()> {
        if self.contains_contact(contact)? {
            Ok(())
        } else {
            Err(StoreError::NoSuchContact(contact))
        }
    }

    fn require_message(&self, id: &MessageId, changed: usize) -> Result<()> {
        if changed == 0 {
            Err(StoreError::NoSuchMessage(*id))
        } else {
            Ok(())
        }
    }

    fn has_status(&self, contact: ContactId, id: &MessageId) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM statuses WHERE contact_id = ?1 AND message_id = ?2)",
            params![contact.get(), &id.as_bytes()[..]],
            |row| row.get(0),
        )?)
    }

    fn sendable(&self, contact: ContactId, only: Option<&MessageId>) -> Result<Vec<Candidate>> {
        let rows: Vec<(Vec<u8>, i64, bool, i64, i64)> = match only {
            Some(id) => {
                let sql = format!("{} AND s.message_id = ?3", SENDABLE_QUERY);
                let mut stmt = self.conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(
                    params![contact.get(), STATE_DELIVERED, &id.as_bytes()[..]],
                    |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                    },
                )?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            None => {
                let sql = format!("{} ORDER BY s.timestamp, s.message_id", SENDABLE_QUERY);
                let mut stmt = self.conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(params![contact.get(), STATE_DELIVERED], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?;
                rows.collect::<rusqlite::Result<_>>()?
            }
        };
        rows.into_iter()
            .map(|(id, length, requested, eta, expiry)| {
                Ok(Candidate {
                    id: message_id(&id)?,
                    length: length as usize,
                    requested,
                    eta,
                    expiry,
                })
            })
            .collect()
    }

    fn client_messages(&self, client: &ClientKey, state: MessageState) -> Result<Vec<MessageId>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT m.message_id FROM messages AS m
             JOIN groups AS g ON g.group_id = m.group_id
             WHERE g.client_id = ?1 AND g.major_version = ?2
                AND m.state = ?3 AND m.raw IS NOT NULL
             ORDER BY m.timestamp, m.message_id",
        )?;
        let rows = stmt
            .query_map(
                params![
                    client.client_id.as_str(),
                    client.major_version,
                    state.as_i64()
                ],
                |row| row.get::<_, Vec<u8>>(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        message_ids(rows)
    }

    fn acks_owed(&self, contact: ContactId, max_ids: usize) -> Result<Vec<MessageId>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT message_id FROM statuses
             WHERE contact_id = ?1 AND ack = 1
             ORDER BY message_id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![contact.get(), max_ids as i64], |row| {
                row.get::<_, Vec<u8>>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        message_ids(rows)
    }

    fn clear_acks(&self, contact: ContactId, ids: &[MessageId]) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "UPDATE statuses SET ack = 0 WHERE contact_id = ?1 AND message_id = ?2",
        )?;
        for id in ids {
            stmt.execute(params![contact.get(), &id.as_bytes()[..]])?;
        }
        Ok(())
    }

    fn mark_sent(&self, contact: ContactId, id: &MessageId, max_latency: Duration) -> Result<()> {
        let tx_count: Option<u32> = self
            .conn
            .query_row(
                "SELECT tx_count FROM statuses WHERE contact_id = ?1 AND message_id = ?2",
                params![contact.get(), &id.as_bytes()[..]],
                |row| row.get(0),
            )
            .optional()?;
        let Some(tx_count) = tx_count else {
            return Ok(());
        };
        let tx_count = tx_count.saturating_add(1);
        let now = now_millis();
        self.conn.execute(
            "UPDATE statuses SET tx_count = ?3, eta = ?4, expiry = ?5, requested = 0
             WHERE contact_id = ?1 AND message_id = ?2",
            params![
                contact.get(),
                &id.as_bytes()[..],
                tx_count,
                now.saturating_add(latency_millis(max_latency)),
                calculate_expiry(now, max_latency, tx_count),
            ],
        )?;
        Ok(())
    }
}

impl StoreTxn for SqliteTxn<'_> {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Contacts
    // ─────────────────────────────────────────────────────────────────────────

    fn add_contact(&mut self, contact: ContactId) -> Result<()> {
        self.writable()?;
        self.conn.execute(
            "INSERT OR IGNORE INTO contacts (contact_id) VALUES (?1)",
            [contact.get()],
        )?;
        Ok(())
    }

    fn remove_contact(&mut self, contact: ContactId) -> Result<()> {
        self.writable()?;
        let removed = self
            .conn
            .execute("DELETE FROM contacts WHERE contact_id = ?1", [contact.get()])?;
        if removed == 0 {
            return Err(StoreError::NoSuchContact(contact));
        }
        Ok(())
    }

    fn contains_contact(&self, contact: ContactId) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM contacts WHERE contact_id = ?1)",
            [contact.get()],
            |row| row.get(0),
        )?)
    }

    fn get_contacts(&self) -> Result<Vec<ContactId>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT contact_id FROM contacts ORDER BY contact_id")?;
        let contacts = stmt
            .query_map([], |row| row.get::<_, u32>(0).map(ContactId))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(contacts)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────────

    fn add_group(&mut self, group: &Group) -> Result<()> {
        self.writable()?;
        self.conn.execute(
            "INSERT OR IGNORE INTO groups (group_id, client_id, major_version, descriptor)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &group.id().as_bytes()[..],
                group.client().client_id.as_str(),
                group.client().major_version,
                group.descriptor(),
            ],
        )?;
        Ok(())
    }

    fn remove_group(&mut self, group: &GroupId) -> Result<()> {
        self.writable()?;
        let removed = self.conn.execute(
            "DELETE FROM groups WHERE group_id = ?1",
            [&group.as_bytes()[..]],
        )?;
        if removed == 0 {
            return Err(StoreError::NoSuchGroup(*group));
        }
        Ok(())
    }

    fn contains_group(&self, group: &GroupId) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM groups WHERE group_id = ?1)",
            [&group.as_bytes()[..]],
            |row| row.get(0),
        )?)
    }

    fn get_group(&self, group: &GroupId) -> Result<Group> {
        let row: Option<(String, u32, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT client_id, major_version, descriptor FROM groups WHERE group_id = ?1",
                [&group.as_bytes()[..]],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (client_id, major_version, descriptor) =
            row.ok_or(StoreError::NoSuchGroup(*group))?;
        let client = ClientKey::new(ClientId::new(client_id)?, major_version);
        Ok(Group::new(client, descriptor)?)
    }

    fn get_group_visibility(&self, contact: ContactId, group: &GroupId) -> Result<Visibility> {
        self.require_contact(contact)?;
        let shared: Option<bool> = self
            .conn
            .query_row(
                "SELECT shared FROM group_visibilities WHERE contact_id = ?1 AND group_id = ?2",
                params![contact.get(), &group.as_bytes()[..]],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match shared {
            None => Visibility::Invisible,
            Some(false) => Visibility::Visible,
            Some(true) => Visibility::Shared,
        })
    }

    fn set_group_visibility(
        &mut self,
        contact: ContactId,
        group: &GroupId,
        visibility: Visibility,
    ) -> Result<()> {
        self.writable()?;
        if !self.contains_group(group)? {
            return Err(StoreError::NoSuchGroup(*group));
        }
        let was_visible = self.get_group_visibility(contact, group)?.is_visible();
        let group_bytes = &group.as_bytes()[..];

        if visibility.is_visible() {
            self.conn.execute(
                "INSERT OR REPLACE INTO group_visibilities (contact_id, group_id, shared)
                 VALUES (?1, ?2, ?3)",
                params![contact.get(), group_bytes, visibility == Visibility::Shared],
            )?;
        } else {
            self.conn.execute(
                "DELETE FROM group_visibilities WHERE contact_id = ?1 AND group_id = ?2",
                params![contact.get(), group_bytes],
            )?;
        }

        match (was_visible, visibility.is_visible()) {
            (false, true) => {
                self.conn.execute(
                    "INSERT OR IGNORE INTO statuses
                        (message_id, contact_id, group_id, timestamp,
                         ack, seen, requested, tx_count, eta, expiry)
                     SELECT message_id, ?1, group_id, timestamp, 0, 0, 0, 0, 0, 0
                     FROM messages WHERE group_id = ?2",
                    params![contact.get(), group_bytes],
                )?;
            }
            (true, false) => {
                self.conn.execute(
                    "DELETE FROM statuses WHERE contact_id = ?1 AND group_id = ?2",
                    params![contact.get(), group_bytes],
                )?;
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
        self.writable()?;
        let group_id = message.group_id();
        if !self.contains_group(&group_id)? {
            return Err(StoreError::NoSuchGroup(group_id));
        }
        if self.contains_message(&message.id())? {
            return Ok(());
        }
        let message_id = message.id();
        let id = &message_id.as_bytes()[..];
        let group_bytes = &group_id.as_bytes()[..];
        let timestamp = message.timestamp() as i64;

        self.conn.execute(
            "INSERT INTO messages
                (message_id, group_id, timestamp, state, shared, length, raw, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                group_bytes,
                timestamp,
                state.as_i64(),
                shared,
                message.len() as i64,
                &message.raw()[..],
                Vec::<u8>::new(),
            ],
        )?;

        let contacts: Vec<u32> = {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT contact_id FROM group_visibilities WHERE group_id = ?1")?;
            let rows = stmt.query_map([group_bytes], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for contact in contacts {
            let offered = self.conn.execute(
                "DELETE FROM offers WHERE contact_id = ?1 AND message_id = ?2",
                params![contact, id],
            )? > 0;
            let flag = offered || source == Some(ContactId(contact));
            self.conn.execute(
                "INSERT INTO statuses
                    (message_id, contact_id, group_id, timestamp,
                     ack, seen, requested, tx_count, eta, expiry)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0, 0, 0, 0)",
                params![id, contact, group_bytes, timestamp, flag],
            )?;
        }
        Ok(())
    }

    fn contains_message(&self, id: &MessageId) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE message_id = ?1)",
            [&id.as_bytes()[..]],
            |row| row.get(0),
        )?)
    }

    fn get_message(&self, id: &MessageId) -> Result<Message> {
        let raw: Option<Option<Vec<u8>>> = self
            .conn
            .query_row(
                "SELECT raw FROM messages WHERE message_id = ?1",
                [&id.as_bytes()[..]],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.flatten().ok_or(StoreError::NoSuchMessage(*id))?;
        Ok(Message::from_raw(raw)?)
    }

    fn delete_message(&mut self, id: &MessageId) -> Result<()> {
        self.writable()?;
        let changed = self.conn.execute(
            "UPDATE messages SET raw = NULL WHERE message_id = ?1",
            [&id.as_bytes()[..]],
        )?;
        self.require_message(id, changed)
    }

    fn get_message_state(&self, id: &MessageId) -> Result<MessageState> {
        let code: Option<i64> = self
            .conn
            .query_row(
                "SELECT state FROM messages WHERE message_id = ?1",
                [&id.as_bytes()[..]],
                |row| row.get(0),
            )
            .optional()?;
        message_state(code.ok_or(StoreError::NoSuchMessage(*id))?)
    }

    fn set_message_state(&mut self, id: &MessageId, state: MessageState) -> Result<()> {
        self.writable()?;
        let current = self.get_message_state(id)?;
        if !current.can_transition_to(state) {
            return Err(StoreError::IllegalStateTransition {
                id: *id,
                from: current,
                to: state,
            });
        }
        self.conn.execute(
            "UPDATE messages SET state = ?2 WHERE message_id = ?1",
            params![&id.as_bytes()[..], state.as_i64()],
        )?;
        Ok(())
    }

    fn is_message_shared(&self, id: &MessageId) -> Result<bool> {
        let shared: Option<bool> = self
            .conn
            .query_row(
                "SELECT shared FROM messages WHERE message_id = ?1",
                [&id.as_bytes()[..]],
                |row| row.get(0),
            )
            .optional()?;
        shared.ok_or(StoreError::NoSuchMessage(*id))
    }

    fn set_message_shared(&mut self, id: &MessageId) -> Result<()> {
        self.writable()?;
        let changed = self.conn.execute(
            "UPDATE messages SET shared = 1 WHERE message_id = ?1",
            [&id.as_bytes()[..]],
        )?;
        self.require_message(id, changed)
    }

    fn get_message_metadata(&self, id: &MessageId) -> Result<Metadata> {
        let cbor: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT metadata FROM messages WHERE message_id = ?1",
                [&id.as_bytes()[..]],
                |row| row.get(0),
            )
            .optional()?;
        let cbor = cbor.ok_or(StoreError::NoSuchMessage(*id))?;
        Ok(Metadata::from_cbor(&cbor)?)
    }

    fn merge_message_metadata(&mut self, id: &MessageId, metadata: &Metadata) -> Result<()> {
        self.writable()?;
        let mut merged = self.get_message_metadata(id)?;
        merged.merge(metadata);
        self.conn.execute(
            "UPDATE messages SET metadata = ?2 WHERE message_id = ?1",
            params![&id.as_bytes()[..], merged.to_cbor()?],
        )?;
        Ok(())
    }

    fn delete_message_metadata(&mut self, id: &MessageId) -> Result<()> {
        self.writable()?;
        let changed = self.conn.execute(
            "UPDATE messages SET metadata = ?2 WHERE message_id = ?1",
            params![&id.as_bytes()[..], Vec::<u8>::new()],
        )?;
        self.require_message(id, changed)
    }

    fn add_message_dependencies(
        &mut self,
        dependent: &Message,
        dependencies: &[MessageId],
    ) -> Result<()> {
        self.writable()?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR IGNORE INTO message_dependencies (message_id, group_id, dependency_id)
             VALUES (?1, ?2, ?3)",
        )?;
        for dependency in dependencies {
            stmt.execute(params![
                &dependent.id().as_bytes()[..],
                &dependent.group_id().as_bytes()[..],
                &dependency.as_bytes()[..],
            ])?;
        }
        Ok(())
    }

    fn get_message_dependencies(
        &self,
        id: &MessageId,
    ) -> Result<BTreeMap<MessageId, MessageState>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT d.dependency_id, d.group_id = m.group_id, m.state
             FROM message_dependencies AS d
             LEFT JOIN messages AS m ON m.message_id = d.dependency_id
             WHERE d.message_id = ?1",
        )?;
        let rows = stmt
            .query_map([&id.as_bytes()[..]], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Option<bool>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = BTreeMap::new();
        for (dependency, same_group, state) in rows {
            let state = match (same_group, state) {
                (_, None) => MessageState::Unknown,
                (Some(false), Some(_)) => MessageState::Invalid,
                (_, Some(code)) => message_state(code)?,
            };
            out.insert(message_id(&dependency)?, state);
        }
        Ok(out)
    }

    fn get_message_dependents(&self, id: &MessageId) -> Result<BTreeMap<MessageId, MessageState>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT d.message_id, m.state
             FROM message_dependencies AS d
             JOIN messages AS m ON m.message_id = d.message_id
             WHERE d.dependency_id = ?1",
        )?;
        let rows = stmt
            .query_map([&id.as_bytes()[..]], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(dependent, state)| Ok((message_id(&dependent)?, message_state(state)?)))
            .collect()
    }

    fn get_messages_to_validate(&self, client: &ClientKey) -> Result<Vec<MessageId>> {
        self.client_messages(client, MessageState::Unknown)
    }

    fn get_pending_messages(&self, client: &ClientKey) -> Result<Vec<MessageId>> {
        self.client_messages(client, MessageState::Pending)
    }

    fn get_messages_to_share(&self, client: &ClientKey) -> Result<Vec<MessageId>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT DISTINCT m1.message_id, m1.timestamp FROM messages AS m1
             JOIN groups AS g ON g.group_id = m1.group_id
             JOIN message_dependencies AS d ON d.dependency_id = m1.message_id
             JOIN messages AS m2 ON m2.message_id = d.message_id
             WHERE g.client_id = ?1 AND g.major_version = ?2
                AND m1.state = ?3 AND m1.shared = 0 AND m2.shared = 1
             ORDER BY m1.timestamp, m1.message_id",
        )?;
        let rows = stmt
            .query_map(
                params![
                    client.client_id.as_str(),
                    client.major_version,
                    STATE_DELIVERED
                ],
                |row| row.get::<_, Vec<u8>>(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        message_ids(rows)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outgoing sync
    // ─────────────────────────────────────────────────────────────────────────

    fn generate_ack(&mut self, contact: ContactId, max_ids: usize) -> Result<Option<Ack>> {
        self.writable()?;
        self.require_contact(contact)?;
        let ids = self.acks_owed(contact, max_ids)?;
        if ids.is_empty() {
            return Ok(None);
        }
        self.clear_acks(contact, &ids)?;
        Ok(Some(Ack::new(ids)?))
    }

    fn get_messages_to_ack(&self, contact: ContactId, max_ids: usize) -> Result<Vec<MessageId>> {
        self.require_contact(contact)?;
        self.acks_owed(contact, max_ids)
    }

    fn set_ack_sent(&mut self, contact: ContactId, ids: &[MessageId]) -> Result<()> {
        self.writable()?;
        self.require_contact(contact)?;
        self.clear_acks(contact, ids)
    }

    fn get_unacked_messages_to_send(&self, contact: ContactId) -> Result<Vec<MessageId>> {
        self.require_contact(contact)?;
        Ok(self
            .sendable(contact, None)?
            .into_iter()
            .map(|c| c.id)
            .collect())
    }

    fn get_messages_to_send(
        &self,
        contact: ContactId,
        capacity: u64,
        max_latency: Duration,
    ) -> Result<Vec<MessageId>> {
        self.require_contact(contact)?;
        let now = now_millis();
        let mut used = 0u64;
        let mut out = Vec::new();
        for candidate in self.sendable(contact, None)? {
            if !is_due(candidate.expiry, candidate.eta, now, max_latency) {
                continue;
            }
            used += record_length(candidate.length);
            if used > capacity {
                break;
            }
            out.push(candidate.id);
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
        if mark_sent {
            self.writable()?;
        }
        self.require_contact(contact)?;
        if self.sendable(contact, Some(id))?.is_empty() {
            return Ok(None);
        }
        let message = self.get_message(id)?;
        if mark_sent {
            self.mark_sent(contact, id, max_latency)?;
        }
        Ok(Some(message))
    }

    fn set_message_sent(
        &mut self,
        contact: ContactId,
        id: &MessageId,
        max_latency: Duration,
    ) -> Result<()> {
        self.writable()?;
        self.require_contact(contact)?;
        self.mark_sent(contact, id, max_latency)
    }

    fn generate_offer(
        &mut self,
        contact: ContactId,
        max_ids: usize,
        max_latency: Duration,
    ) -> Result<Option<Offer>> {
        self.writable()?;
        self.require_contact(contact)?;
        let now = now_millis();
        let ids: Vec<MessageId> = self
            .sendable(contact, None)?
            .into_iter()
            .filter(|c| !c.requested && is_due(c.expiry, c.eta, now, max_latency))
            .map(|c| c.id)
            .take(max_ids)
            .collect();
        if ids.is_empty() {
            return Ok(None);
        }
        for id in &ids {
            self.mark_sent(contact, id, max_latency)?;
        }
        Ok(Some(Offer::new(ids)?))
    }

    fn generate_request(
        &mut self,
        contact: ContactId,
        max_ids: usize,
    ) -> Result<Option<Request>> {
        self.writable()?;
        self.require_contact(contact)?;
        let rows: Vec<Vec<u8>> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT message_id FROM offers WHERE contact_id = ?1
                 ORDER BY position LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![contact.get(), max_ids as i64], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        if rows.is_empty() {
            return Ok(None);
        }
        let ids = message_ids(rows)?;
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM offers WHERE contact_id = ?1 AND message_id = ?2")?;
        for id in &ids {
            stmt.execute(params![contact.get(), &id.as_bytes()[..]])?;
        }
        Ok(Some(Request::new(ids)?))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Incoming sync
    // ─────────────────────────────────────────────────────────────────────────

    fn receive_ack(&mut self, contact: ContactId, ack: &Ack) -> Result<()> {
        self.writable()?;
        self.require_contact(contact)?;
        let mut stmt = self.conn.prepare_cached(
            "UPDATE statuses SET seen = 1 WHERE contact_id = ?1 AND message_id = ?2",
        )?;
        for id in ack.ids() {
            stmt.execute(params![contact.get(), &id.as_bytes()[..]])?;
        }
        Ok(())
    }

    fn receive_message(&mut self, contact: ContactId, message: &Message) -> Result<bool> {
        self.writable()?;
        if !self
            .get_group_visibility(contact, &message.group_id())?
            .is_visible()
        {
            return Ok(false);
        }
        if self.has_status(contact, &message.id())? {
            self.conn.execute(
                "UPDATE statuses SET ack = 1, seen = 1 WHERE contact_id = ?1 AND message_id = ?2",
                params![contact.get(), &message.id().as_bytes()[..]],
            )?;
            return Ok(false);
        }
        if self.contains_message(&message.id())? {
            return Ok(false);
        }
        self.add_message(message, MessageState::Unknown, false, Some(contact))?;
        Ok(true)
    }

    fn receive_offer(&mut self, contact: ContactId, offer: &Offer) -> Result<()> {
        self.writable()?;
        self.require_contact(contact)?;
        for id in offer.ids() {
            let id_bytes = &id.as_bytes()[..];
            let known = self.conn.execute(
                "UPDATE statuses SET ack = 1, seen = 1 WHERE contact_id = ?1 AND message_id = ?2",
                params![contact.get(), id_bytes],
            )?;
            if known > 0 {
                continue;
            }
            let offered: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM offers WHERE contact_id = ?1",
                [contact.get()],
                |row| row.get(0),
            )?;
            if offered as usize >= MAX_OFFERED_MESSAGES {
                continue;
            }
            self.conn.execute(
                "INSERT OR IGNORE INTO offers (contact_id, message_id, position)
                 SELECT ?1, ?2, COALESCE(MAX(position), 0) + 1 FROM offers WHERE contact_id = ?1",
                params![contact.get(), id_bytes],
            )?;
        }
        Ok(())
    }

    fn receive_request(&mut self, contact: ContactId, request: &Request) -> Result<()> {
        self.writable()?;
        self.require_contact(contact)?;
        let mut stmt = self.conn.prepare_cached(
            "UPDATE statuses SET requested = 1, expiry = 0
             WHERE contact_id = ?1 AND message_id = ?2",
        )?;
        for id in request.ids() {
            stmt.execute(params![contact.get(), &id.as_bytes()[..]])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    #[test]
    fn test_sqlite_store_conformance() {
        conformance::run_all(&SqliteStore::open_memory().unwrap());
    }

    #[test]
    fn test_rollback_on_drop() {
        let store = SqliteStore::open_memory().unwrap();
        {
            let mut txn = store.start_transaction(false).unwrap();
            txn.add_contact(ContactId(1)).unwrap();
        }
        let txn = store.start_transaction(true).unwrap();
        assert!(!txn.contains_contact(ContactId(1)).unwrap());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let store = SqliteStore::open_memory().unwrap();
        let mut txn = store.start_transaction(true).unwrap();
        assert!(matches!(
            txn.add_contact(ContactId(1)),
            Err(StoreError::ReadOnly)
        ));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.db");
        let group = Group::new(
            ClientKey::new(ClientId::new("org.example.forum").unwrap(), 1),
            b"persist".to_vec(),
        )
        .unwrap();
        let message = Message::new(group.id(), 1, b"kept").unwrap();

        {
            let store = SqliteStore::open(&path).unwrap();
            let (g, m) = (group.clone(), message.clone());
            store
                .transaction(false, move |txn| {
                    txn.add_group(&g)?;
                    txn.add_message(&m, MessageState::Unknown, false, None)?;
                    txn.merge_message_metadata(&m.id(), &Metadata::new().with("k", "v"))
                })
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let id = message.id();
        let (loaded, metadata) = store
            .transaction(true, move |txn| {
                Ok((txn.get_message(&id)?, txn.get_message_metadata(&id)?))
            })
            .await
            .unwrap();
        assert_eq!(loaded, message);
        assert_eq!(metadata.get("k"), Some(&b"v"[..]));
    }
}
