//! # Courier Store
//!
//! Transactional storage for the sync engine. Every query and command the
//! engine needs lives on [`StoreTxn`]; a [`Store`] hands out transactions.
//! The primary implementation is [`SqliteStore`], with [`MemoryStore`] for
//! testing. The [`EventBus`] carries storage-change notifications to
//! sessions and the validation manager.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use courier_core::ContactId;
//! use courier_store::{SqliteStore, Store, StoreTxn};
//!
//! async fn example() -> courier_store::Result<()> {
//!     let store = SqliteStore::open("courier.db")?;
//!
//!     // Callback style: the body runs on the blocking pool.
//!     store.transaction(false, |txn| txn.add_contact(ContactId(1))).await?;
//!
//!     // Explicit style.
//!     let txn = store.start_transaction(true)?;
//!     assert!(txn.contains_contact(ContactId(1))?);
//!     store.end_transaction(txn);
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Tombstones**: deleting a message drops its bytes but keeps its row
//!   and state, so duplicates and dependents still see it as invalid
//! - **Retransmission**: each send pushes the next eligible time back
//!   exponentially; a request or a faster transport makes it due again
//! - **Visibility gates**: messages are accepted from contacts that can see
//!   the group and sent only to contacts it is shared with

pub mod error;
pub mod events;
pub mod memory;
pub mod migration;
pub mod retransmission;
pub mod sqlite;
pub mod traits;

#[cfg(test)]
mod conformance;

pub use error::{Result, StoreError};
pub use events::{Event, EventBus, EventListener, DEFAULT_EVENT_CAPACITY};
pub use memory::{MemoryStore, MemoryTxn};
pub use sqlite::{SqliteStore, SqliteTxn};
pub use traits::{Store, StoreTxn, MAX_OFFERED_MESSAGES};
