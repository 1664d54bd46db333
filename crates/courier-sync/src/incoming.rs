//! Incoming sync sessions.
//!
//! Reads records from a peer until end of stream and applies each one to
//! storage in its own transaction. Newly stored messages are announced on
//! the event bus after commit so the validation pipeline picks them up.

use tokio::io::AsyncRead;
use tracing::{debug, trace};

use courier_core::{ContactId, SyncMessage, Versions};
use courier_store::{Event, EventBus, EventListener, Store};

use crate::error::{Result, SyncError};
use crate::protocol::{check_interrupted, SessionHandle};
use crate::records::SyncRecordReader;

/// What an incoming session received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingReport {
    pub acks: usize,
    pub offers: usize,
    pub requests: usize,
    pub messages: usize,
    /// Messages stored for the first time.
    pub new_messages: usize,
    pub peer_versions: Option<Vec<u8>>,
    pub interrupted: bool,
}

/// An incoming session from one contact.
pub struct IncomingSession<S, R> {
    store: S,
    events: EventBus,
    contact: ContactId,
    reader: SyncRecordReader<R>,
    handle: SessionHandle,
}

impl<S: Store, R: AsyncRead + Unpin + Send> IncomingSession<S, R> {
    pub fn new(store: S, events: EventBus, contact: ContactId, reader: R) -> Self {
        Self {
            store,
            events,
            contact,
            reader: SyncRecordReader::new(reader),
            handle: SessionHandle::default(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }

    /// Read and apply records until the peer ends the stream.
    pub async fn run(&mut self) -> Result<IncomingReport> {
        let mut listener = self.events.subscribe();
        debug!(contact = %self.contact, "incoming session started");
        let result = self.drive(&mut listener).await;
        drop(listener);
        match &result {
            Ok(report) => debug!(
                contact = %self.contact,
                acks = report.acks,
                messages = report.messages,
                new = report.new_messages,
                interrupted = report.interrupted,
                "incoming session finished"
            ),
            Err(e) => debug!(contact = %self.contact, error = %e, "incoming session failed"),
        }
        result
    }

    async fn drive(&mut self, listener: &mut EventListener) -> Result<IncomingReport> {
        let mut report = IncomingReport::default();
        let contact = self.contact;

        loop {
            if check_interrupted(&self.handle, listener, contact) {
                report.interrupted = true;
                break;
            }
            let Some(record) = self.reader.read_next().await? else {
                break;
            };
            match record {
                SyncMessage::Versions(versions) => {
                    if Versions::supported().best_common(&versions).is_none() {
                        return Err(SyncError::NoCommonVersion {
                            peer: versions.versions().to_vec(),
                        });
                    }
                    report.peer_versions = Some(versions.versions().to_vec());
                }
                SyncMessage::Ack(ack) => {
                    trace!(contact = %contact, ids = ack.ids().len(), "received ack");
                    self.store
                        .transaction(false, move |txn| txn.receive_ack(contact, &ack))
                        .await?;
                    report.acks += 1;
                }
                SyncMessage::Offer(offer) => {
                    trace!(contact = %contact, ids = offer.ids().len(), "received offer");
                    self.store
                        .transaction(false, move |txn| txn.receive_offer(contact, &offer))
                        .await?;
                    report.offers += 1;
                    self.events.broadcast(Event::MessagesToAck { contact });
                    self.events.broadcast(Event::MessagesToRequest { contact });
                }
                SyncMessage::Request(request) => {
                    trace!(contact = %contact, ids = request.ids().len(), "received request");
                    self.store
                        .transaction(false, move |txn| txn.receive_request(contact, &request))
                        .await?;
                    report.requests += 1;
                    self.events.broadcast(Event::MessagesRequested { contact });
                }
                SyncMessage::Message(message) => {
                    let stored = message.clone();
                    let added = self
                        .store
                        .transaction(false, move |txn| txn.receive_message(contact, &stored))
                        .await?;
                    report.messages += 1;
                    if added {
                        trace!(contact = %contact, message = %message.id(), "received new message");
                        report.new_messages += 1;
                        self.events.broadcast(Event::MessageAdded {
                            message,
                            source: Some(contact),
                        });
                    }
                    self.events.broadcast(Event::MessagesToAck { contact });
                }
            }
        }

        Ok(report)
    }
}
