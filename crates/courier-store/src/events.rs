//! Event bus: storage-change notifications.
//!
//! A broadcast channel. Subscribing registers a listener; dropping the
//! receiver unregisters it. Broadcasting never blocks: a listener that falls
//! more than the channel capacity behind observes a lag and skips ahead.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use courier_core::{ContactId, Message, MessageId, MessageState};

/// Default number of events buffered per listener.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Something that happened in storage.
#[derive(Debug, Clone)]
pub enum Event {
    /// A message was stored and awaits validation. `source` is `None` for
    /// locally created messages.
    MessageAdded {
        message: Message,
        source: Option<ContactId>,
    },
    /// A committed state change.
    MessageStateChanged { id: MessageId, state: MessageState },
    /// A message became shared.
    MessageShared { id: MessageId },
    /// We owe the contact acks.
    MessagesToAck { contact: ContactId },
    /// The contact offered messages we may want to request.
    MessagesToRequest { contact: ContactId },
    /// The contact requested messages from us.
    MessagesRequested { contact: ContactId },
    /// Group visibility changed for the contact.
    GroupVisibilityUpdated { contact: ContactId },
    /// A contact was removed; sessions with it should stop.
    ContactRemoved { contact: ContactId },
    /// The node is shutting down.
    Shutdown,
}

/// Receiving end of a subscription.
pub type EventListener = broadcast::Receiver<Event>;

/// Publish/subscribe bus shared by sessions and the validation manager.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    // Held across each send so that a subscription and the count it starts
    // from are read together.
    sent: Arc<Mutex<u64>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sent: Arc::new(Mutex::new(0)),
        }
    }

    fn sent(&self) -> MutexGuard<'_, u64> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener.
    pub fn subscribe(&self) -> EventListener {
        self.sender.subscribe()
    }

    /// Register a listener along with the number of events broadcast before
    /// it. The listener receives exactly the events counted after that.
    pub fn subscribe_counted(&self) -> (EventListener, u64) {
        let sent = self.sent();
        (self.sender.subscribe(), *sent)
    }

    /// Publish an event to every current listener.
    pub fn broadcast(&self, event: Event) {
        let mut sent = self.sent();
        *sent += 1;
        // No listeners is not an error.
        let _ = self.sender.send(event);
    }

    /// Total events broadcast on this bus. A listener that has consumed
    /// (or skipped past) this many since subscribing is caught up.
    pub fn sent_count(&self) -> u64 {
        *self.sent()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_and_drop_tracks_listeners() {
        let bus = EventBus::default();
        assert_eq!(bus.listener_count(), 0);

        let mut listener = bus.subscribe();
        assert_eq!(bus.listener_count(), 1);

        bus.broadcast(Event::ContactRemoved {
            contact: ContactId(3),
        });
        match listener.recv().await.unwrap() {
            Event::ContactRemoved { contact } => assert_eq!(contact, ContactId(3)),
            other => panic!("unexpected event {:?}", other),
        }

        drop(listener);
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_counted_pairs_listener_with_count() {
        let bus = EventBus::default();
        bus.broadcast(Event::Shutdown);
        bus.broadcast(Event::Shutdown);

        let (mut listener, before) = bus.subscribe_counted();
        assert_eq!(before, 2);
        bus.broadcast(Event::ContactRemoved {
            contact: ContactId(1),
        });

        let mut seen = 0;
        while listener.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(before + seen, bus.sent_count());
    }

    #[tokio::test]
    async fn test_subscribe_counted_under_concurrent_broadcasts() {
        let bus = EventBus::new(4096);
        let sender = bus.clone();
        let producer = tokio::task::spawn_blocking(move || {
            for _ in 0..2000 {
                sender.broadcast(Event::Shutdown);
            }
        });
        let (mut listener, before) = bus.subscribe_counted();
        producer.await.unwrap();

        let mut seen = 0;
        while listener.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(before + seen, 2000);
    }

    #[test]
    fn test_broadcast_without_listeners_is_fine() {
        let bus = EventBus::new(4);
        bus.broadcast(Event::Shutdown);
        assert_eq!(bus.sent_count(), 1);
        assert_eq!(bus.clone().sent_count(), 1);
    }
}
