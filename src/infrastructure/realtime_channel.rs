use crate::infrastructure::error::EngineError;
use crate::infrastructure::event_mapper::{RealtimeEvent, resync_event};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const DEFAULT_CAPACITY: usize = 256;

pub trait RealtimeChannel: Send + Sync {
    /// Fans `event` out to the subscribers of its trip; returns how many received it.
    fn publish(&self, event: RealtimeEvent) -> Result<usize, EngineError>;
    fn subscribe(&self, trip_id: &str) -> Result<Subscription, EngineError>;
}

/// Live subscription to one trip. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    trip_id: String,
    receiver: broadcast::Receiver<RealtimeEvent>,
}

impl Subscription {
    pub fn trip_id(&self) -> &str {
        &self.trip_id
    }

    /// Next event, or `None` once the channel is gone. When events were
    /// dropped because this subscriber lagged, a whole-trip `trip_modified`
    /// is returned in their place.
    pub async fn recv(&mut self) -> Option<RealtimeEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(trip_id = %self.trip_id, skipped, "realtime subscriber lagged; requesting trip reload");
                Some(resync_event(&self.trip_id, Utc::now()))
            }
            Err(RecvError::Closed) => None,
        }
    }

    pub fn unsubscribe(self) {
        tracing::debug!(trip_id = %self.trip_id, "realtime subscription closed");
    }
}

#[derive(Debug)]
pub struct InProcessRealtimeChannel {
    senders: Mutex<HashMap<String, broadcast::Sender<RealtimeEvent>>>,
    capacity: usize,
}

impl Default for InProcessRealtimeChannel {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl InProcessRealtimeChannel {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscriber_count(&self, trip_id: &str) -> Result<usize, EngineError> {
        let senders = self
            .senders
            .lock()
            .map_err(|error| EngineError::lock_poisoned("realtime channel", error))?;
        Ok(senders.get(trip_id).map(broadcast::Sender::receiver_count).unwrap_or(0))
    }
}

impl RealtimeChannel for InProcessRealtimeChannel {
    fn publish(&self, event: RealtimeEvent) -> Result<usize, EngineError> {
        let mut senders = self
            .senders
            .lock()
            .map_err(|error| EngineError::lock_poisoned("realtime channel", error))?;
        let Some(sender) = senders.get(&event.trip_id) else {
            return Ok(0);
        };
        let trip_id = event.trip_id.clone();
        match sender.send(event) {
            Ok(delivered) => Ok(delivered),
            Err(_) => {
                // Every subscriber is gone.
                senders.remove(&trip_id);
                Ok(0)
            }
        }
    }

    fn subscribe(&self, trip_id: &str) -> Result<Subscription, EngineError> {
        let trip_id = trip_id.trim();
        if trip_id.is_empty() {
            return Err(EngineError::InvalidInput("trip_id must not be empty".to_string()));
        }
        let mut senders = self
            .senders
            .lock()
            .map_err(|error| EngineError::lock_poisoned("realtime channel", error))?;
        let receiver = senders
            .entry(trip_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Ok(Subscription {
            trip_id: trip_id.to_string(),
            receiver,
        })
    }
}
