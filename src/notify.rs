use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub of committed events, one channel per vehicle. Status pages
/// subscribe here instead of polling `get_reservation`.
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

    /// Subscribe to a vehicle's events. Creates the channel if needed.
    pub fn subscribe(&self, vehicle_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(vehicle_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, vehicle_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&vehicle_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a vehicle's channel once it is delisted.
    pub fn remove(&self, vehicle_id: &Ulid) {
        self.channels.remove(vehicle_id);
    }
}
