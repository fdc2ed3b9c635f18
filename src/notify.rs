use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events, one channel per aggregate
/// (resource id for resource/reservation events, entitlement id otherwise).
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for an aggregate. Creates the channel if needed.
    pub fn subscribe(&self, aggregate_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(aggregate_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send an event. No-op if nobody is listening.
    pub fn send(&self, aggregate_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&aggregate_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop the channel once its last subscriber is gone.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}
