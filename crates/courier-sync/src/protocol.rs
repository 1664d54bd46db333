//! Outgoing sync sessions.
//!
//! One driver, [`OutgoingSession`], runs the state machine
//! `Start → AnnounceVersions → DrainAcks → [DrainOffers] → [DrainRequests] →
//! DrainMessages → [AwaitWork] → SendEndOfStream → Done`. The three session
//! variants differ only in their [`SessionPolicy`]:
//!
//! | variant | capacity  | transactions       | acks      | candidates       | marks sent |
//! |---------|-----------|--------------------|-----------|------------------|------------|
//! | eager   | unbounded | callback           | generated | every unacked    | yes        |
//! | duplex  | unbounded | explicit, blocking | generated | due, requested   | yes        |
//! | mailbox | bounded   | callback           | deferred  | due, within room | no         |
//!
//! The duplex variant offers due messages instead of sending them. Offering
//! counts as a transmission, so the messages still due when it reaches
//! `DrainMessages` are the ones the contact requested. It stays open: once drained it waits in
//! `AwaitWork` for an event that may have made records available, for the
//! retransmission timer, or for [`SessionHandle::close`]. While idle it
//! flushes the transport every `max_idle`.
//!
//! Before every record the session checks its [`SessionHandle`] and its
//! event subscription; once interrupted it stops drawing work and does not
//! send the end-of-stream marker.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use courier_core::{
    Ack, ContactId, MessageId, MessageState, Versions, MAX_MESSAGE_IDS, MESSAGE_HEADER_LENGTH,
    RECORD_HEADER_LENGTH, UNIQUE_ID_LENGTH,
};
use courier_store::{
    Event, EventBus, EventListener, Result as StoreResult, Store, StoreError, StoreTxn,
};

use crate::error::Result;
use crate::records::SyncRecordWriter;
use crate::session_record::OutgoingSessionRecord;

/// Default capacity of a mailbox file's payload.
pub const MAX_FILE_PAYLOAD_BYTES: u64 = 32 * 1024 * 1024;

/// Smallest possible message record: header, message header, one body byte.
const MIN_MESSAGE_RECORD_LENGTH: u64 = (RECORD_HEADER_LENGTH + MESSAGE_HEADER_LENGTH + 1) as u64;

/// Smallest possible ack record.
const MIN_ACK_RECORD_LENGTH: u64 = (RECORD_HEADER_LENGTH + UNIQUE_ID_LENGTH) as u64;

/// How often an open duplex session looks for messages due again.
pub const RETRANSMISSION_INTERVAL: Duration = Duration::from_secs(60);

/// Default idle time after which an open duplex session flushes.
pub const MAX_IDLE_TIME: Duration = Duration::from_secs(30);

/// Configuration for sync behavior.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on the time a transport takes to deliver a record.
    pub max_latency: Duration,
    /// Default capacity of a mailbox session.
    pub mailbox_capacity: u64,
    /// Idle time after which a duplex session flushes the transport.
    pub max_idle: Duration,
    /// How often a duplex session re-checks retransmission timers.
    pub retransmission_interval: Duration,
}

impl SyncConfig {
    /// Keep-open settings for duplex sessions.
    pub fn keep_open(&self) -> KeepOpen {
        KeepOpen {
            max_idle: self.max_idle,
            retransmission_interval: self.retransmission_interval,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_latency: Duration::from_secs(30),
            mailbox_capacity: MAX_FILE_PAYLOAD_BYTES,
            max_idle: MAX_IDLE_TIME,
            retransmission_interval: RETRANSMISSION_INTERVAL,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Unbounded,
    /// Total bytes the session may write, versions record included.
    Bounded(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStyle {
    /// `Store::transaction`.
    Callback,
    /// `start_transaction`/`commit_transaction`/`end_transaction` on the
    /// blocking pool.
    Explicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Take acks with `generate_ack`, clearing the flags as they are written.
    Generate,
    /// Peek with `get_messages_to_ack` and leave the flags for the session
    /// record to clear.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidates {
    /// Every message the contact has not acked.
    Unacked,
    /// Messages due for (re)transmission that fit the remaining capacity.
    Sendable,
}

/// Timers of a session that stays open once drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepOpen {
    pub max_idle: Duration,
    pub retransmission_interval: Duration,
}

impl Default for KeepOpen {
    fn default() -> Self {
        Self {
            max_idle: MAX_IDLE_TIME,
            retransmission_interval: RETRANSMISSION_INTERVAL,
        }
    }
}

/// How an outgoing session pulls work from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub capacity: Capacity,
    pub txn_style: TxnStyle,
    pub ack_mode: AckMode,
    pub candidates: Candidates,
    /// Record transmissions in storage as messages are loaded.
    pub mark_sent: bool,
    /// Offer due messages before sending them.
    pub drains_offers: bool,
    /// Send requests for offered messages we lack.
    pub drains_requests: bool,
    /// Wait for more work instead of ending once drained.
    pub keep_open: Option<KeepOpen>,
}

impl SessionPolicy {
    pub fn eager() -> Self {
        Self {
            capacity: Capacity::Unbounded,
            txn_style: TxnStyle::Callback,
            ack_mode: AckMode::Generate,
            candidates: Candidates::Unacked,
            mark_sent: true,
            drains_offers: false,
            drains_requests: false,
            keep_open: None,
        }
    }

    pub fn duplex() -> Self {
        Self {
            capacity: Capacity::Unbounded,
            txn_style: TxnStyle::Explicit,
            ack_mode: AckMode::Generate,
            candidates: Candidates::Sendable,
            mark_sent: true,
            drains_offers: true,
            drains_requests: true,
            keep_open: Some(KeepOpen::default()),
        }
    }

    pub fn with_keep_open(mut self, keep_open: KeepOpen) -> Self {
        self.keep_open = Some(keep_open);
        self
    }

    pub fn mailbox(capacity: u64) -> Self {
        Self {
            capacity: Capacity::Bounded(capacity),
            txn_style: TxnStyle::Callback,
            ack_mode: AckMode::Deferred,
            candidates: Candidates::Sendable,
            mark_sent: false,
            drains_offers: false,
            drains_requests: false,
            keep_open: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle and report
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct HandleState {
    interrupted: AtomicBool,
    closing: AtomicBool,
    wake: Notify,
}

/// Stops a running session from another task.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    state: Arc<HandleState>,
}

impl SessionHandle {
    /// Stop at the next record without sending end of stream.
    pub fn interrupt(&self) {
        self.state.interrupted.store(true, Ordering::SeqCst);
        self.state.wake.notify_one();
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.interrupted.load(Ordering::SeqCst)
    }

    /// Let an open session finish what is pending, send end of stream and
    /// return. Sessions that do not stay open end on their own.
    pub fn close(&self) {
        self.state.closing.store(true, Ordering::SeqCst);
        self.state.wake.notify_one();
    }

    pub fn is_closing(&self) -> bool {
        self.state.closing.load(Ordering::SeqCst)
    }

    async fn woken(&self) {
        self.state.wake.notified().await
    }
}

/// Outcome of an outgoing session.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    /// Acks and messages written. For mailbox sessions the caller applies
    /// this after a successful upload; other sessions already did.
    pub record: OutgoingSessionRecord,
    /// Ids offered instead of sent.
    pub offered: Vec<MessageId>,
    /// Candidates that stopped being sendable before they were loaded.
    pub skipped: Vec<MessageId>,
    pub bytes_written: u64,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Start,
    AnnounceVersions,
    DrainAcks,
    DrainOffers,
    DrainRequests,
    DrainMessages,
    AwaitWork,
    SendEndOfStream,
    Done,
}

/// What an event means to a session with one contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relevance {
    Interrupt,
    Work,
    Ignore,
}

fn relevance(event: &Event, contact: ContactId) -> Relevance {
    match event {
        Event::ContactRemoved { contact: c } if *c == contact => Relevance::Interrupt,
        Event::Shutdown => Relevance::Interrupt,
        Event::MessageShared { .. }
        | Event::MessageStateChanged {
            state: MessageState::Delivered,
            ..
        } => Relevance::Work,
        Event::MessagesToAck { contact: c }
        | Event::MessagesToRequest { contact: c }
        | Event::MessagesRequested { contact: c }
        | Event::GroupVisibilityUpdated { contact: c }
            if *c == contact =>
        {
            Relevance::Work
        }
        _ => Relevance::Ignore,
    }
}

/// Deadlines of a session waiting in `AwaitWork`.
struct Timers {
    keepalive: Instant,
    retransmit: Instant,
    flushed_at: u64,
}

impl Timers {
    fn new(keep_open: KeepOpen) -> Self {
        let now = Instant::now();
        Self {
            keepalive: now + keep_open.max_idle,
            retransmit: now + keep_open.retransmission_interval,
            flushed_at: 0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// An outgoing session to one contact.
pub struct OutgoingSession<S, W> {
    store: S,
    events: EventBus,
    contact: ContactId,
    max_latency: Duration,
    policy: SessionPolicy,
    writer: SyncRecordWriter<W>,
    handle: SessionHandle,
}

impl<S: Store, W: AsyncWrite + Unpin + Send> OutgoingSession<S, W> {
    pub fn new(
        store: S,
        events: EventBus,
        contact: ContactId,
        max_latency: Duration,
        policy: SessionPolicy,
        writer: W,
    ) -> Self {
        Self {
            store,
            events,
            contact,
            max_latency,
            policy,
            writer: SyncRecordWriter::new(writer),
            handle: SessionHandle::default(),
        }
    }

    /// Send everything pending once over a one-way stream.
    pub fn eager(
        store: S,
        events: EventBus,
        contact: ContactId,
        max_latency: Duration,
        writer: W,
    ) -> Self {
        Self::new(store, events, contact, max_latency, SessionPolicy::eager(), writer)
    }

    /// The outgoing half of a two-way connection. Stays open until its
    /// handle is closed or interrupted.
    pub fn duplex(
        store: S,
        events: EventBus,
        contact: ContactId,
        max_latency: Duration,
        writer: W,
    ) -> Self {
        Self::new(store, events, contact, max_latency, SessionPolicy::duplex(), writer)
    }

    /// Pack a file of at most `capacity` bytes for a mailbox upload.
    pub fn mailbox(
        store: S,
        events: EventBus,
        contact: ContactId,
        max_latency: Duration,
        capacity: u64,
        writer: W,
    ) -> Self {
        Self::new(
            store,
            events,
            contact,
            max_latency,
            SessionPolicy::mailbox(capacity),
            writer,
        )
    }

    /// Use a handle created before the session.
    pub fn with_handle(mut self, handle: SessionHandle) -> Self {
        self.handle = handle;
        self
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    /// Run the session to completion.
    pub async fn run(&mut self) -> Result<SessionReport> {
        let mut listener = self.events.subscribe();
        debug!(contact = %self.contact, policy = ?self.policy, "outgoing session started");
        let result = self.drive(&mut listener).await;
        drop(listener);
        match &result {
            Ok(report) => debug!(
                contact = %self.contact,
                bytes = report.bytes_written,
                acked = report.record.acked_ids().len(),
                sent = report.record.sent_ids().len(),
                offered = report.offered.len(),
                skipped = report.skipped.len(),
                interrupted = report.interrupted,
                "outgoing session finished"
            ),
            Err(e) => debug!(contact = %self.contact, error = %e, "outgoing session failed"),
        }
        result
    }

    async fn drive(&mut self, listener: &mut EventListener) -> Result<SessionReport> {
        let mut report = SessionReport::default();
        let mut candidates: Option<VecDeque<MessageId>> = None;
        let mut timers = self.policy.keep_open.map(Timers::new);
        let mut woken = false;
        let mut state = SessionState::Start;

        while state != SessionState::Done {
            if drain_events(&self.handle, listener, self.contact, &mut woken) {
                report.interrupted = true;
                break;
            }
            state = match state {
                SessionState::Start => SessionState::AnnounceVersions,
                SessionState::AnnounceVersions => {
                    self.writer.write_versions(&Versions::supported()).await?;
                    SessionState::DrainAcks
                }
                SessionState::DrainAcks => {
                    if self.send_ack(&mut report).await? {
                        SessionState::DrainAcks
                    } else if self.policy.drains_offers {
                        SessionState::DrainOffers
                    } else if self.policy.drains_requests {
                        SessionState::DrainRequests
                    } else {
                        SessionState::DrainMessages
                    }
                }
                SessionState::DrainOffers => {
                    if self.send_offer(&mut report).await? {
                        SessionState::DrainOffers
                    } else if self.policy.drains_requests {
                        SessionState::DrainRequests
                    } else {
                        SessionState::DrainMessages
                    }
                }
                SessionState::DrainRequests => {
                    if self.send_request().await? {
                        SessionState::DrainRequests
                    } else {
                        SessionState::DrainMessages
                    }
                }
                SessionState::DrainMessages => {
                    if candidates.is_none() {
                        candidates = Some(self.load_candidates().await?.into());
                    }
                    let drained = match candidates.as_mut().and_then(VecDeque::pop_front) {
                        Some(id) => !self.send_message(id, &mut report).await?,
                        None => true,
                    };
                    if !drained {
                        SessionState::DrainMessages
                    } else if timers.is_some() {
                        SessionState::AwaitWork
                    } else {
                        SessionState::SendEndOfStream
                    }
                }
                SessionState::AwaitWork => {
                    if woken {
                        woken = false;
                        candidates = None;
                        SessionState::DrainAcks
                    } else if self.handle.is_closing() {
                        SessionState::SendEndOfStream
                    } else if let Some(timers) = timers.as_mut() {
                        let next = self.await_work(listener, timers).await?;
                        if next == SessionState::DrainAcks {
                            candidates = None;
                        }
                        next
                    } else {
                        SessionState::SendEndOfStream
                    }
                }
                SessionState::SendEndOfStream => {
                    self.writer.send_end_of_stream().await?;
                    SessionState::Done
                }
                SessionState::Done => SessionState::Done,
            };
        }

        report.bytes_written = self.writer.bytes_written();
        Ok(report)
    }

    /// Wait until something may have made records available. Returns the
    /// state to resume from; the handle is latched on interruption.
    async fn await_work(
        &mut self,
        listener: &mut EventListener,
        timers: &mut Timers,
    ) -> Result<SessionState> {
        let keep_open = self.policy.keep_open.unwrap_or_default();
        if self.writer.bytes_written() > timers.flushed_at {
            self.writer.flush().await?;
            timers.flushed_at = self.writer.bytes_written();
            timers.keepalive = Instant::now() + keep_open.max_idle;
        }
        let handle = self.handle.clone();
        let contact = self.contact;
        tokio::select! {
            biased;
            _ = handle.woken() => Ok(SessionState::AwaitWork),
            received = listener.recv() => Ok(match received {
                Ok(event) => match relevance(&event, contact) {
                    Relevance::Interrupt => {
                        handle.interrupt();
                        SessionState::AwaitWork
                    }
                    Relevance::Work => SessionState::DrainAcks,
                    Relevance::Ignore => SessionState::AwaitWork,
                },
                Err(RecvError::Lagged(n)) => {
                    trace!(contact = %contact, missed = n, "session listener lagged");
                    SessionState::DrainAcks
                }
                Err(RecvError::Closed) => {
                    handle.interrupt();
                    SessionState::AwaitWork
                }
            }),
            _ = sleep_until(timers.retransmit) => {
                trace!(contact = %contact, "checking for retransmissions");
                timers.retransmit = Instant::now() + keep_open.retransmission_interval;
                Ok(SessionState::DrainAcks)
            }
            _ = sleep_until(timers.keepalive) => {
                self.writer.flush().await?;
                timers.keepalive = Instant::now() + keep_open.max_idle;
                Ok(SessionState::AwaitWork)
            }
        }
    }

    fn remaining(&self) -> u64 {
        match self.policy.capacity {
            Capacity::Unbounded => u64::MAX,
            Capacity::Bounded(total) => total.saturating_sub(self.writer.bytes_written()),
        }
    }

    /// Write one ack record. False when there is nothing (more) to ack.
    async fn send_ack(&mut self, report: &mut SessionReport) -> Result<bool> {
        let contact = self.contact;
        match self.policy.ack_mode {
            AckMode::Generate => {
                let ack = run_txn(&self.store, self.policy.txn_style, false, move |txn| {
                    txn.generate_ack(contact, MAX_MESSAGE_IDS)
                })
                .await?;
                let Some(ack) = ack else {
                    return Ok(false);
                };
                self.writer.write_ack(&ack).await?;
                trace!(contact = %contact, ids = ack.ids().len(), "sent ack");
                report.record.on_ack_sent(ack.ids());
                Ok(true)
            }
            AckMode::Deferred => {
                let remaining = self.remaining();
                if remaining < MIN_ACK_RECORD_LENGTH {
                    return Ok(false);
                }
                let room = ((remaining - RECORD_HEADER_LENGTH as u64) / UNIQUE_ID_LENGTH as u64)
                    .min(MAX_MESSAGE_IDS as u64) as usize;
                // Flags stay raised until the record is applied, so skip
                // what this session already acked.
                let already: BTreeSet<MessageId> =
                    report.record.acked_ids().iter().copied().collect();
                let peek = already.len() + room;
                let owed = run_txn(&self.store, self.policy.txn_style, true, move |txn| {
                    txn.get_messages_to_ack(contact, peek)
                })
                .await?;
                let ids: Vec<MessageId> = owed
                    .into_iter()
                    .filter(|id| !already.contains(id))
                    .take(room)
                    .collect();
                if ids.is_empty() {
                    return Ok(false);
                }
                let ack = Ack::new(ids)?;
                self.writer.write_ack(&ack).await?;
                trace!(contact = %contact, ids = ack.ids().len(), "wrote deferred ack");
                report.record.on_ack_sent(ack.ids());
                Ok(true)
            }
        }
    }

    /// Write one offer record. False when nothing is due.
    async fn send_offer(&mut self, report: &mut SessionReport) -> Result<bool> {
        let contact = self.contact;
        let max_latency = self.max_latency;
        let offer = run_txn(&self.store, self.policy.txn_style, false, move |txn| {
            txn.generate_offer(contact, MAX_MESSAGE_IDS, max_latency)
        })
        .await?;
        let Some(offer) = offer else {
            return Ok(false);
        };
        self.writer.write_offer(&offer).await?;
        trace!(contact = %contact, ids = offer.ids().len(), "sent offer");
        report.offered.extend_from_slice(offer.ids());
        Ok(true)
    }

    /// Write one request record. False when nothing is left to request.
    async fn send_request(&mut self) -> Result<bool> {
        let contact = self.contact;
        let request = run_txn(&self.store, self.policy.txn_style, false, move |txn| {
            txn.generate_request(contact, MAX_MESSAGE_IDS)
        })
        .await?;
        let Some(request) = request else {
            return Ok(false);
        };
        self.writer.write_request(&request).await?;
        trace!(contact = %contact, ids = request.ids().len(), "sent request");
        Ok(true)
    }

    async fn load_candidates(&self) -> Result<Vec<MessageId>> {
        let contact = self.contact;
        let max_latency = self.max_latency;
        match self.policy.candidates {
            Candidates::Unacked => {
                run_txn(&self.store, self.policy.txn_style, true, move |txn| {
                    txn.get_unacked_messages_to_send(contact)
                })
                .await
            }
            Candidates::Sendable => {
                let remaining = self.remaining();
                if matches!(self.policy.capacity, Capacity::Bounded(_))
                    && remaining < MIN_MESSAGE_RECORD_LENGTH
                {
                    return Ok(Vec::new());
                }
                run_txn(&self.store, self.policy.txn_style, true, move |txn| {
                    txn.get_messages_to_send(contact, remaining, max_latency)
                })
                .await
            }
        }
    }

    /// Load and write one candidate. False when the session should stop
    /// drawing messages.
    async fn send_message(&mut self, id: MessageId, report: &mut SessionReport) -> Result<bool> {
        let contact = self.contact;
        let max_latency = self.max_latency;
        let mark_sent = self.policy.mark_sent;
        let message = run_txn(&self.store, self.policy.txn_style, !mark_sent, move |txn| {
            txn.get_message_to_send(contact, &id, max_latency, mark_sent)
        })
        .await?;
        let Some(message) = message else {
            trace!(contact = %contact, message = %id, "candidate no longer sendable");
            report.skipped.push(id);
            return Ok(true);
        };
        let record_length = (RECORD_HEADER_LENGTH + message.len()) as u64;
        if record_length > self.remaining() {
            return Ok(false);
        }
        self.writer.write_message(&message).await?;
        trace!(contact = %contact, message = %id, "sent message");
        report.record.on_message_sent(id);
        Ok(true)
    }
}

/// Drain pending events and report whether `contact`'s session should
/// stop. Removal of the contact or a shutdown latches the handle.
pub(crate) fn check_interrupted(
    handle: &SessionHandle,
    listener: &mut EventListener,
    contact: ContactId,
) -> bool {
    let mut woken = false;
    drain_events(handle, listener, contact, &mut woken)
}

/// Like [`check_interrupted`], also raising `woken` when an event may have
/// made records available.
fn drain_events(
    handle: &SessionHandle,
    listener: &mut EventListener,
    contact: ContactId,
    woken: &mut bool,
) -> bool {
    if handle.is_interrupted() {
        return true;
    }
    loop {
        match listener.try_recv() {
            Ok(event) => match relevance(&event, contact) {
                Relevance::Interrupt => {
                    handle.interrupt();
                    return true;
                }
                Relevance::Work => *woken = true,
                Relevance::Ignore => {}
            },
            // A removal among the missed events is reported by the store on
            // the next query.
            Err(TryRecvError::Lagged(n)) => {
                trace!(contact = %contact, missed = n, "session listener lagged");
                *woken = true;
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return false,
        }
    }
}

/// Run `body` in a transaction the way `style` asks.
async fn run_txn<S, F, R>(store: &S, style: TxnStyle, read_only: bool, body: F) -> Result<R>
where
    S: Store,
    F: FnOnce(&mut dyn StoreTxn) -> StoreResult<R> + Send + 'static,
    R: Send + 'static,
{
    match style {
        TxnStyle::Callback => Ok(store.transaction(read_only, body).await?),
        TxnStyle::Explicit => {
            let store = store.clone();
            let result = tokio::task::spawn_blocking(move || {
                let mut txn = store.start_transaction(read_only)?;
                match body(&mut txn) {
                    Ok(value) => {
                        store.commit_transaction(txn)?;
                        Ok(value)
                    }
                    Err(e) => {
                        store.end_transaction(txn);
                        Err(e)
                    }
                }
            })
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?;
            Ok(result?)
        }
    }
}
