//! Event distribution
//!
//! Persisted payment events fan out to live stream subscribers through
//! per-client tokio broadcast channels. Durability and replay come from the
//! event log in the store; the bus only carries already-committed events, so
//! losing a bus message is always recoverable by re-reading the log.

use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::db::PaymentEventModel;

const CHANNEL_CAPACITY: usize = 256;

/// An event as delivered to stream subscribers
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Owning client
    pub client_id: Uuid,
    /// Per-client sequence number
    pub seq: i64,
    /// Wire event name (`payment.paid`, ...)
    pub event: &'static str,
    /// Serialized JSON snapshot payload
    pub data: String,
}

impl StreamEvent {
    /// Build the wire event from a persisted event row
    pub fn from_model(event: &PaymentEventModel) -> Self {
        Self {
            client_id: event.client_id,
            seq: event.seq,
            event: event.event_type.wire_name(),
            data: event.payload.to_string(),
        }
    }
}

/// In-process pub/sub fan-out, one broadcast channel per client
pub struct EventBus {
    channels: RwLock<HashMap<Uuid, broadcast::Sender<StreamEvent>>>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to a client's events
    pub async fn subscribe(&self, client_id: Uuid) -> broadcast::Receiver<StreamEvent> {
        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(&client_id) {
                return sender.subscribe();
            }
        }

        let mut channels = self.channels.write().await;
        channels
            .entry(client_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a committed event to live subscribers. A send error only
    /// means nobody is listening right now; reconnecting subscribers catch
    /// up from the log.
    pub async fn publish(&self, event: StreamEvent) {
        let channels = self.channels.read().await;
        if let Some(sender) = channels.get(&event.client_id) {
            let _ = sender.send(event);
        }
    }

    /// Number of live subscribers for a client
    pub async fn subscriber_count(&self, client_id: Uuid) -> usize {
        let channels = self.channels.read().await;
        channels
            .get(&client_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_event(client_id: Uuid, seq: i64) -> StreamEvent {
        StreamEvent {
            client_id,
            seq,
            event: "payment.created",
            data: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let client_id = Uuid::new_v4();

        let mut rx = bus.subscribe(client_id).await;
        bus.publish(test_event(client_id, 1)).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.seq, 1);
        assert_eq!(received.event, "payment.created");
    }

    #[tokio::test]
    async fn test_clients_are_isolated() {
        let bus = EventBus::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut rx_a = bus.subscribe(a).await;
        let mut rx_b = bus.subscribe(b).await;

        bus.publish(test_event(a, 1)).await;

        assert_eq!(rx_a.recv().await.unwrap().client_id, a);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(test_event(Uuid::new_v4(), 1)).await;
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let client_id = Uuid::new_v4();

        let mut rx1 = bus.subscribe(client_id).await;
        let mut rx2 = bus.subscribe(client_id).await;
        assert_eq!(bus.subscriber_count(client_id).await, 2);

        bus.publish(test_event(client_id, 7)).await;
        assert_eq!(rx1.recv().await.unwrap().seq, 7);
        assert_eq!(rx2.recv().await.unwrap().seq, 7);
    }
}
