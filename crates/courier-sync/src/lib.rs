//! # Courier Sync
//!
//! Sync sessions between contacts over an ordered byte stream.
//!
//! ## Overview
//!
//! A session writes (or reads) framed records: acks for messages we have
//! received, offers and requests, the messages themselves, and a versions
//! record announcing the protocol versions each side speaks. The transport
//! below is opaque; end of stream is the writer shutting down.
//!
//! Outgoing sessions come in three variants sharing one driver:
//!
//! - **eager**: one-way stream, sends every unacked message once.
//! - **duplex**: the outgoing half of a two-way connection; offers due
//!   messages, sends the ones requested and requests offered messages it
//!   lacks. It stays open, reacting to events until its handle is closed.
//! - **mailbox**: packs a file of bounded size for later upload and defers
//!   bookkeeping until the upload succeeds.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use courier_core::ContactId;
//! use courier_store::{EventBus, MemoryStore};
//! use courier_sync::OutgoingSession;
//!
//! async fn example() -> courier_sync::Result<()> {
//!     let store = MemoryStore::new();
//!     let events = EventBus::default();
//!     let mut session = OutgoingSession::eager(
//!         store,
//!         events,
//!         ContactId(1),
//!         Duration::from_secs(30),
//!         Vec::new(),
//!     );
//!     let report = session.run().await?;
//!     println!("wrote {} bytes", report.bytes_written);
//!     Ok(())
//! }
//! ```
//!
//! ## Record Flow
//!
//! ```text
//! Sender                              Receiver
//!   |-------- Versions --------------->|
//!   |-------- Ack* ------------------->|
//!   |-------- Offer* ----------------->|   (duplex only)
//!   |-------- Request* --------------->|   (duplex only)
//!   |-------- Message* --------------->|
//!   |   ... duplex repeats on events   |
//!   |-------- end of stream ---------->|
//! ```

pub mod error;
pub mod incoming;
pub mod protocol;
pub mod records;
pub mod session_record;
pub mod transport;

pub use error::{Result, SyncError};
pub use incoming::{IncomingReport, IncomingSession};
pub use protocol::{
    AckMode, Candidates, Capacity, KeepOpen, OutgoingSession, SessionHandle, SessionPolicy,
    SessionReport, SyncConfig, TxnStyle, MAX_FILE_PAYLOAD_BYTES, MAX_IDLE_TIME,
    RETRANSMISSION_INTERVAL,
};
pub use records::{SyncRecordReader, SyncRecordWriter};
pub use session_record::OutgoingSessionRecord;
pub use transport::{RecordReader, RecordWriter};
