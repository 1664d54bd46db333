//! The validation and delivery service.
//!
//! Three long-lived tasks:
//!
//! - a **storage worker** owning the bounded storage queue: loads messages
//!   for validation, writes results back, drains worklists and runs the
//!   startup sweeps, each transaction on the blocking pool;
//! - a **validation worker** owning the bounded validation queue: runs
//!   validators on the blocking pool, at most
//!   `max_concurrent_validations` at a time, and returns results to the
//!   storage worker over an unbounded channel so validators never block;
//! - an **event listener** turning `MessageAdded` events into work.
//!
//! ```text
//!   EventBus ──MessageAdded──▶ listener ──Load──▶ storage worker ──job──▶ validation worker
//!                                                      ▲                          │
//!                                                      └────────Validated─────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use courier_core::{
    ClientKey, ContactId, Group, InvalidMessageError, Message, MessageContext, MessageId,
};
use courier_store::{
    Event, EventBus, EventListener, Result as StoreResult, Store, StoreError,
};

use crate::engine::DeliveryEngine;
use crate::error::{Result, ValidationError};
use crate::registry::{IncomingMessageHook, MessageValidator, Registry};
use crate::tracker::WorkTracker;

/// Configuration for the validation service.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Capacity of the storage work queue.
    pub storage_queue_depth: usize,
    /// Capacity of the validation work queue.
    pub validation_queue_depth: usize,
    /// Validators running at once.
    pub max_concurrent_validations: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            storage_queue_depth: 64,
            validation_queue_depth: 64,
            max_concurrent_validations: 4,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Jobs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum StorageJob {
    ValidateOutstanding(ClientKey),
    DeliverOutstanding(ClientKey),
    ShareOutstanding(ClientKey),
    Load(MessageId),
    Validated {
        message: Message,
        outcome: std::result::Result<MessageContext, InvalidMessageError>,
    },
}

#[derive(Debug)]
struct ValidationJob {
    message: Message,
    group: Group,
}

/// How far the listener has read the bus.
#[derive(Debug, Default)]
struct ListenerProgress {
    base: AtomicU64,
    seen: AtomicU64,
}

impl ListenerProgress {
    fn reset(&self, base: u64) {
        self.seen.store(0, Ordering::SeqCst);
        self.base.store(base, Ordering::SeqCst);
    }

    fn advance(&self, n: u64) {
        self.seen.fetch_add(n, Ordering::SeqCst);
    }

    fn caught_up(&self, events: &EventBus) -> bool {
        self.base.load(Ordering::SeqCst) + self.seen.load(Ordering::SeqCst)
            >= events.sent_count()
    }
}

enum Lifecycle {
    Registering(Registry),
    Running(Running),
    Stopped,
}

struct Running {
    storage: mpsc::Sender<StorageJob>,
    listener: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Validates incoming messages and delivers them to clients in dependency
/// order.
pub struct ValidationManager<S> {
    store: S,
    events: EventBus,
    config: ValidationConfig,
    tracker: WorkTracker,
    progress: Arc<ListenerProgress>,
    lifecycle: Mutex<Lifecycle>,
}

impl<S: Store> ValidationManager<S> {
    pub fn new(store: S, events: EventBus, config: ValidationConfig) -> Self {
        Self {
            store,
            events,
            config,
            tracker: WorkTracker::new(),
            progress: Arc::new(ListenerProgress::default()),
            lifecycle: Mutex::new(Lifecycle::Registering(Registry::new())),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        // The lock guards plain state transitions; a panic elsewhere
        // cannot leave it half-updated.
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self, f: impl FnOnce(&mut Registry)) -> Result<()> {
        match &mut *self.lifecycle() {
            Lifecycle::Registering(registry) => {
                f(registry);
                Ok(())
            }
            _ => Err(ValidationError::AlreadyStarted),
        }
    }

    /// Register the validator for a client. Only before start.
    pub fn register_message_validator(
        &self,
        client: ClientKey,
        validator: impl MessageValidator,
    ) -> Result<()> {
        self.registry_mut(|r| r.register_validator(client, Arc::new(validator)))
    }

    /// Register the delivery hook for a client. Only before start.
    pub fn register_incoming_message_hook(
        &self,
        client: ClientKey,
        hook: impl IncomingMessageHook,
    ) -> Result<()> {
        self.registry_mut(|r| r.register_hook(client, Arc::new(hook)))
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Running(_))
    }

    /// Start the workers and queue the startup sweeps for every registered
    /// client: validate, then deliver, then share outstanding messages.
    pub async fn start_service(&self) -> Result<()> {
        let (storage, clients) = {
            let mut lifecycle = self.lifecycle();
            let registry = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Registering(registry) => Arc::new(registry),
                other => {
                    *lifecycle = other;
                    return Err(ValidationError::AlreadyStarted);
                }
            };
            let clients = registry.clients();
            let engine =
                DeliveryEngine::new(self.store.clone(), registry.clone(), self.events.clone());

            let (storage_tx, storage_rx) = mpsc::channel(self.config.storage_queue_depth.max(1));
            let (validation_tx, validation_rx) =
                mpsc::channel(self.config.validation_queue_depth.max(1));
            let (results_tx, results_rx) = mpsc::unbounded_channel();
            let permits = Arc::new(Semaphore::new(
                self.config.max_concurrent_validations.max(1),
            ));

            let (bus, base) = self.events.subscribe_counted();
            self.progress.reset(base);

            let workers = vec![
                tokio::spawn(storage_worker(
                    engine,
                    storage_rx,
                    results_rx,
                    validation_tx,
                    self.tracker.clone(),
                )),
                tokio::spawn(validation_worker(
                    registry,
                    validation_rx,
                    results_tx,
                    permits,
                    self.tracker.clone(),
                )),
            ];
            let listener = tokio::spawn(listen(
                bus,
                storage_tx.clone(),
                clients.clone(),
                self.tracker.clone(),
                self.progress.clone(),
            ));

            *lifecycle = Lifecycle::Running(Running {
                storage: storage_tx.clone(),
                listener,
                workers,
            });
            (storage_tx, clients)
        };

        info!(clients = clients.len(), "validation service started");
        for client in clients {
            for job in [
                StorageJob::ValidateOutstanding(client.clone()),
                StorageJob::DeliverOutstanding(client.clone()),
                StorageJob::ShareOutstanding(client),
            ] {
                self.submit(&storage, job).await?;
            }
        }
        Ok(())
    }

    /// Stop accepting work, finish what is queued for storage and stop the
    /// workers. Validations still running are abandoned; their messages stay
    /// `Unknown` and are picked up by the next start.
    pub async fn stop_service(&self) -> Result<()> {
        let running = {
            let mut lifecycle = self.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                other => {
                    *lifecycle = other;
                    return Err(ValidationError::NotRunning);
                }
            }
        };

        running.listener.abort();
        // Cancellation is the expected outcome here.
        let _ = running.listener.await;
        drop(running.storage);
        for worker in running.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "validation worker failed");
            }
        }
        info!("validation service stopped");
        Ok(())
    }

    /// Queue a newly stored message for validation.
    pub async fn on_message_added(
        &self,
        message: &Message,
        source: Option<ContactId>,
    ) -> Result<()> {
        let storage = match &*self.lifecycle() {
            Lifecycle::Running(running) => running.storage.clone(),
            _ => return Err(ValidationError::NotRunning),
        };
        debug!(message = %message.id(), source = ?source, "message added");
        self.submit(&storage, StorageJob::Load(message.id())).await
    }

    /// Resolve once no work is queued or in flight and every event on the
    /// bus has been seen. Returns immediately when not running.
    pub async fn wait_until_idle(&self) {
        if !self.is_running() {
            return;
        }
        let progress = self.progress.clone();
        let events = self.events.clone();
        self.tracker
            .wait_until(|t| t.outstanding() == 0 && progress.caught_up(&events))
            .await
    }

    async fn submit(&self, storage: &mpsc::Sender<StorageJob>, job: StorageJob) -> Result<()> {
        self.tracker.begin();
        if storage.send(job).await.is_err() {
            self.tracker.finish();
            return Err(ValidationError::QueueClosed);
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Workers
// ─────────────────────────────────────────────────────────────────────────────

async fn blocking<S, R, F>(engine: &DeliveryEngine<S>, f: F) -> Result<R>
where
    S: Store,
    R: Send + 'static,
    F: FnOnce(&DeliveryEngine<S>) -> StoreResult<R> + Send + 'static,
{
    let engine = engine.clone();
    let result = tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?;
    Ok(result?)
}

async fn storage_worker<S: Store>(
    engine: DeliveryEngine<S>,
    mut jobs: mpsc::Receiver<StorageJob>,
    mut results: mpsc::UnboundedReceiver<StorageJob>,
    validation: mpsc::Sender<ValidationJob>,
    tracker: WorkTracker,
) {
    loop {
        let job = tokio::select! {
            biased;
            Some(job) = results.recv() => job,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        if let Err(e) = handle_storage_job(&engine, job, &validation, &tracker).await {
            warn!(error = %e, "storage job failed");
        }
        tracker.finish();
    }
    debug!("storage worker finished");
}

async fn handle_storage_job<S: Store>(
    engine: &DeliveryEngine<S>,
    job: StorageJob,
    validation: &mpsc::Sender<ValidationJob>,
    tracker: &WorkTracker,
) -> Result<()> {
    match job {
        StorageJob::ValidateOutstanding(client) => {
            let ids = blocking(engine, move |e| e.messages_to_validate(&client)).await?;
            debug!(count = ids.len(), "validating outstanding messages");
            for id in ids {
                load_and_forward(engine, id, validation, tracker).await?;
            }
            Ok(())
        }
        StorageJob::DeliverOutstanding(client) => {
            blocking(engine, move |e| e.deliver_outstanding(&client)).await
        }
        StorageJob::ShareOutstanding(client) => {
            blocking(engine, move |e| e.share_outstanding(&client)).await
        }
        StorageJob::Load(id) => load_and_forward(engine, id, validation, tracker).await,
        StorageJob::Validated { message, outcome } => match outcome {
            Ok(context) => {
                blocking(engine, move |e| e.store_context(&message, &context)).await
            }
            Err(e) => {
                info!(message = %message.id(), reason = %e.reason, "message failed validation");
                let id = message.id();
                blocking(engine, move |e| e.reject(id)).await
            }
        },
    }
}

async fn load_and_forward<S: Store>(
    engine: &DeliveryEngine<S>,
    id: MessageId,
    validation: &mpsc::Sender<ValidationJob>,
    tracker: &WorkTracker,
) -> Result<()> {
    let Some((message, group)) = blocking(engine, move |e| e.load(&id)).await? else {
        return Ok(());
    };
    tracker.begin();
    if validation.send(ValidationJob { message, group }).await.is_err() {
        tracker.finish();
        return Err(ValidationError::QueueClosed);
    }
    Ok(())
}

async fn validation_worker(
    registry: Arc<Registry>,
    mut jobs: mpsc::Receiver<ValidationJob>,
    results: mpsc::UnboundedSender<StorageJob>,
    permits: Arc<Semaphore>,
    tracker: WorkTracker,
) {
    while let Some(job) = jobs.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            tracker.finish();
            break;
        };
        let registry = registry.clone();
        let results = results.clone();
        let tracker = tracker.clone();
        tokio::spawn(async move {
            let _permit = permit;
            validate(&registry, job, &results, &tracker).await;
            tracker.finish();
        });
    }
    debug!("validation worker finished");
}

async fn validate(
    registry: &Registry,
    job: ValidationJob,
    results: &mpsc::UnboundedSender<StorageJob>,
    tracker: &WorkTracker,
) {
    let ValidationJob { message, group } = job;
    let id = message.id();
    let Some(validator) = registry.validator(group.client()) else {
        warn!(message = %id, client = %group.client(), "no validator registered");
        return;
    };
    let outcome = tokio::task::spawn_blocking(move || {
        let outcome = validator.validate_message(&message, &group);
        (message, outcome)
    })
    .await;
    match outcome {
        Ok((message, outcome)) => {
            tracker.begin();
            if results
                .send(StorageJob::Validated { message, outcome })
                .is_err()
            {
                tracker.finish();
            }
        }
        Err(e) => warn!(message = %id, error = %e, "validator task failed"),
    }
}

async fn listen(
    mut bus: EventListener,
    storage: mpsc::Sender<StorageJob>,
    clients: Vec<ClientKey>,
    tracker: WorkTracker,
    progress: Arc<ListenerProgress>,
) {
    loop {
        match bus.recv().await {
            Ok(Event::MessageAdded { message, source }) => {
                trace!(message = %message.id(), source = ?source, "queueing added message");
                tracker.begin();
                progress.advance(1);
                if storage.send(StorageJob::Load(message.id())).await.is_err() {
                    tracker.finish();
                    break;
                }
            }
            Ok(_) => progress.advance(1),
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "validation listener lagged, revalidating outstanding messages");
                for client in &clients {
                    tracker.begin();
                    if storage
                        .send(StorageJob::ValidateOutstanding(client.clone()))
                        .await
                        .is_err()
                    {
                        tracker.finish();
                        return;
                    }
                }
                progress.advance(missed);
            }
            Err(RecvError::Closed) => break,
        }
        tracker.poke();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use courier_core::{ClientId, MessageState, Metadata, Visibility};
    use courier_store::{MemoryStore, StoreTxn};

    use crate::registry::{DeliveryAction, HookError};

    fn client() -> ClientKey {
        ClientKey::new(ClientId::new("org.example.manager").unwrap(), 0)
    }

    fn accept_all(
        _: &Message,
        _: &Group,
    ) -> std::result::Result<MessageContext, InvalidMessageError> {
        Ok(MessageContext::default())
    }

    async fn setup() -> (MemoryStore, EventBus, Group) {
        let store = MemoryStore::new();
        let group = Group::new(client(), b"manager".to_vec()).unwrap();
        let g = group.clone();
        store
            .transaction(false, move |txn| {
                txn.add_contact(ContactId(1))?;
                txn.add_group(&g)?;
                txn.set_group_visibility(ContactId(1), &g.id(), Visibility::Shared)
            })
            .await
            .unwrap();
        (store, EventBus::default(), group)
    }

    async fn add(store: &MemoryStore, message: &Message) {
        let m = message.clone();
        store
            .transaction(false, move |txn| {
                txn.add_message(&m, MessageState::Unknown, false, None)
            })
            .await
            .unwrap();
    }

    async fn state(store: &MemoryStore, id: MessageId) -> MessageState {
        store
            .transaction(true, move |txn| txn.get_message_state(&id))
            .await
            .unwrap()
    }

    async fn idle(manager: &ValidationManager<MemoryStore>) {
        tokio::time::timeout(Duration::from_secs(10), manager.wait_until_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let (store, events, _) = setup().await;
        let manager = ValidationManager::new(store, events, ValidationConfig::default());
        assert!(matches!(
            manager.stop_service().await,
            Err(ValidationError::NotRunning)
        ));
        manager.start_service().await.unwrap();
        assert!(matches!(
            manager.start_service().await,
            Err(ValidationError::AlreadyStarted)
        ));
        assert!(matches!(
            manager.register_message_validator(client(), accept_all),
            Err(ValidationError::AlreadyStarted)
        ));
        manager.stop_service().await.unwrap();
        assert!(!manager.is_running());
        assert!(matches!(
            manager.start_service().await,
            Err(ValidationError::AlreadyStarted)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_event_driven_validation_and_delivery() {
        let (store, events, group) = setup().await;
        let manager =
            ValidationManager::new(store.clone(), events.clone(), ValidationConfig::default());
        manager
            .register_message_validator(client(), accept_all)
            .unwrap();
        manager
            .register_incoming_message_hook(
                client(),
                |_: &mut dyn StoreTxn,
                 _: &Message,
                 _: &Metadata|
                 -> std::result::Result<DeliveryAction, HookError> {
                    Ok(DeliveryAction::AcceptShare)
                },
            )
            .unwrap();
        manager.start_service().await.unwrap();

        let mut changes = events.subscribe();
        let message = Message::new(group.id(), 5, b"event").unwrap();
        add(&store, &message).await;
        events.broadcast(Event::MessageAdded {
            message: message.clone(),
            source: Some(ContactId(1)),
        });
        idle(&manager).await;

        assert_eq!(state(&store, message.id()).await, MessageState::Delivered);
        let mut saw_delivered = false;
        while let Ok(event) = changes.try_recv() {
            if let Event::MessageStateChanged { id, state } = event {
                saw_delivered |= id == message.id() && state == MessageState::Delivered;
            }
        }
        assert!(saw_delivered);
        manager.stop_service().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_startup_validates_outstanding() {
        let (store, events, group) = setup().await;
        let good = Message::new(group.id(), 1, b"good").unwrap();
        let bad = Message::new(group.id(), 2, b"bad").unwrap();
        add(&store, &good).await;
        add(&store, &bad).await;

        let manager =
            ValidationManager::new(store.clone(), events, ValidationConfig::default());
        manager
            .register_message_validator(
                client(),
                |m: &Message,
                 _: &Group|
                 -> std::result::Result<MessageContext, InvalidMessageError> {
                    if m.body() == b"bad" {
                        Err(InvalidMessageError::new("bad body"))
                    } else {
                        Ok(MessageContext::default())
                    }
                },
            )
            .unwrap();
        manager.start_service().await.unwrap();
        idle(&manager).await;

        assert_eq!(state(&store, good.id()).await, MessageState::Delivered);
        assert_eq!(state(&store, bad.id()).await, MessageState::Invalid);
        manager.stop_service().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_validator_leaves_unknown() {
        let (store, events, group) = setup().await;
        let manager =
            ValidationManager::new(store.clone(), events, ValidationConfig::default());
        manager.start_service().await.unwrap();

        let message = Message::new(group.id(), 1, b"orphan").unwrap();
        add(&store, &message).await;
        manager.on_message_added(&message, None).await.unwrap();
        idle(&manager).await;

        assert_eq!(state(&store, message.id()).await, MessageState::Unknown);
        manager.stop_service().await.unwrap();
    }

    #[tokio::test]
    async fn test_on_message_added_requires_running() {
        let (store, events, group) = setup().await;
        let manager = ValidationManager::new(store, events, ValidationConfig::default());
        let message = Message::new(group.id(), 1, b"early").unwrap();
        assert!(matches!(
            manager.on_message_added(&message, None).await,
            Err(ValidationError::NotRunning)
        ));
        // Not running: nothing to wait for.
        manager.wait_until_idle().await;
    }
}
