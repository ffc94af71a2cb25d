//! Event bus carrying domain events to the downstream consumer
//!
//! A bounded mailbox with a single reader. Publishing never blocks: when the
//! mailbox is full the event is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::events::{DomainEvent, EventMessage};

const DEFAULT_CAPACITY: usize = 1024;

/// Counters exposed on the health endpoint
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct EventBusStats {
    pub published: u64,
    pub dropped: u64,
}

pub struct EventBus {
    sender: RwLock<Option<mpsc::Sender<EventMessage>>>,
    receiver: Mutex<Option<mpsc::Receiver<EventMessage>>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender: RwLock::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publish an event. Returns `false` when it was dropped.
    pub fn publish(&self, event: DomainEvent) -> bool {
        let message = EventMessage::new(event);
        let event_type = message.event.event_type();
        let charge_point_id = message.event.charge_point_id().to_string();

        let guard = match self.sender.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(sender) = guard.as_ref() else {
            self.record_drop(event_type, &charge_point_id, "closed");
            return false;
        };

        match sender.try_send(message) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                debug!(event_type, charge_point_id = %charge_point_id, "Event published");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.record_drop(event_type, &charge_point_id, "full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.record_drop(event_type, &charge_point_id, "closed");
                false
            }
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = DomainEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    fn record_drop(&self, event_type: &'static str, charge_point_id: &str, reason: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ocpp_events_dropped_total", "reason" => reason).increment(1);
        warn!(event_type, charge_point_id, reason, "Event dropped");
    }

    /// Hand out the single receiver. Subsequent calls return `None`.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<EventMessage>> {
        let mut guard = match self.receiver.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take()
    }

    /// Stop accepting events. The receiver drains what is buffered and then
    /// sees the end of the stream.
    pub fn close(&self) {
        let mut guard = match self.sender.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.take().is_some() {
            info!(
                published = self.published.load(Ordering::Relaxed),
                dropped = self.dropped.load(Ordering::Relaxed),
                "Event bus closed"
            );
        }
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared event bus type
pub type SharedEventBus = Arc<EventBus>;

/// Create a shared event bus
pub fn create_event_bus(capacity: usize) -> SharedEventBus {
    Arc::new(EventBus::with_capacity(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::HeartbeatEvent;
    use chrono::Utc;

    fn heartbeat(cp: &str) -> DomainEvent {
        DomainEvent::HeartbeatReceived(HeartbeatEvent {
            charge_point_id: cp.into(),
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let bus = EventBus::with_capacity(4);
        let mut rx = bus.take_receiver().unwrap();
        assert!(bus.publish(heartbeat("CP1")));
        assert!(bus.publish(heartbeat("CP2")));

        assert_eq!(rx.recv().await.unwrap().event.charge_point_id(), "CP1");
        assert_eq!(rx.recv().await.unwrap().event.charge_point_id(), "CP2");
    }

    #[test]
    fn receiver_is_handed_out_once() {
        let bus = EventBus::new();
        assert!(bus.take_receiver().is_some());
        assert!(bus.take_receiver().is_none());
    }

    #[test]
    fn full_mailbox_drops_and_counts() {
        let bus = EventBus::with_capacity(1);
        let _rx = bus.take_receiver();
        assert!(bus.publish(heartbeat("CP1")));
        assert!(!bus.publish(heartbeat("CP1")));
        let stats = bus.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn close_ends_stream_after_drain() {
        let bus = EventBus::with_capacity(4);
        let mut rx = bus.take_receiver().unwrap();
        bus.publish(heartbeat("CP1"));
        bus.close();
        assert!(!bus.publish(heartbeat("CP2")));
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
