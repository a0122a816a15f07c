use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Fire-and-forget dispatcher for committed events. Each client has its own
/// channel; staff tooling can follow every event through the salon-wide stream.
/// Slow receivers lag and drop, they never block the engine.
pub struct NotifyHub {
    clients: DashMap<Ulid, broadcast::Sender<Event>>,
    salon: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            salon: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Events touching one client's appointments and subscription.
    pub fn subscribe_client(&self, client_id: Ulid) -> broadcast::Receiver<Event> {
        self.clients
            .entry(client_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_salon(&self) -> broadcast::Receiver<Event> {
        self.salon.subscribe()
    }

    /// No-op for channels nobody listens on.
    pub fn send(&self, client_id: Ulid, event: &Event) {
        if let Some(sender) = self.clients.get(&client_id) {
            if sender.send(event.clone()).is_err() {
                drop(sender);
                // Every receiver is gone.
                self.clients.remove_if(&client_id, |_, s| s.receiver_count() == 0);
            }
        }
        let _ = self.salon.send(event.clone());
    }

    pub fn client_channels(&self) -> usize {
        self.clients.len()
    }
}
