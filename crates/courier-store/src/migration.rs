//! Database schema migrations for SQLite.
//!
//! Each migration transforms the schema from version N to N+1 and is
//! recorded in `schema_migrations`.

use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::retransmission::now_millis;

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema. Safe to call repeatedly.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;
        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }
        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE contacts (
            contact_id INTEGER PRIMARY KEY
        );

        CREATE TABLE groups (
            group_id BLOB PRIMARY KEY,          -- 32 bytes
            client_id TEXT NOT NULL,
            major_version INTEGER NOT NULL,
            descriptor BLOB NOT NULL
        );

        CREATE TABLE group_visibilities (
            contact_id INTEGER NOT NULL REFERENCES contacts(contact_id) ON DELETE CASCADE,
            group_id BLOB NOT NULL REFERENCES groups(group_id) ON DELETE CASCADE,
            shared INTEGER NOT NULL,            -- 0 = visible, 1 = shared
            PRIMARY KEY (contact_id, group_id)
        );

        CREATE TABLE messages (
            message_id BLOB PRIMARY KEY,        -- 32 bytes
            group_id BLOB NOT NULL REFERENCES groups(group_id) ON DELETE CASCADE,
            timestamp INTEGER NOT NULL,
            state INTEGER NOT NULL,
            shared INTEGER NOT NULL,
            length INTEGER NOT NULL,
            raw BLOB,                           -- NULL once deleted
            metadata BLOB NOT NULL              -- CBOR map
        );

        CREATE TABLE message_dependencies (
            message_id BLOB NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE,
            group_id BLOB NOT NULL,             -- group of the dependent
            dependency_id BLOB NOT NULL,        -- may not exist yet
            PRIMARY KEY (message_id, dependency_id)
        );

        CREATE TABLE statuses (
            message_id BLOB NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE,
            contact_id INTEGER NOT NULL REFERENCES contacts(contact_id) ON DELETE CASCADE,
            group_id BLOB NOT NULL,
            timestamp INTEGER NOT NULL,
            ack INTEGER NOT NULL,
            seen INTEGER NOT NULL,
            requested INTEGER NOT NULL,
            tx_count INTEGER NOT NULL,
            eta INTEGER NOT NULL,
            expiry INTEGER NOT NULL,
            PRIMARY KEY (message_id, contact_id)
        );

        CREATE TABLE offers (
            contact_id INTEGER NOT NULL REFERENCES contacts(contact_id) ON DELETE CASCADE,
            message_id BLOB NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (contact_id, message_id)
        );

        CREATE INDEX idx_messages_group_state ON messages(group_id, state);
        CREATE INDEX idx_dependencies_dependency ON message_dependencies(dependency_id);
        CREATE INDEX idx_statuses_contact ON statuses(contact_id, timestamp);
        CREATE INDEX idx_offers_position ON offers(contact_id, position);
        "#,
    )?;

    Ok(())
}
