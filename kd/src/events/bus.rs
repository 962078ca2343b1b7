//! Event bus - fan-out of every run's events to daemon-wide consumers
//!
//! Per-run observers read from the run's own history (see [`super::run`]);
//! the bus feeds consumers that want everything, such as the JSONL logger.

use tokio::sync::broadcast;
use tracing::debug;

use super::types::ActionEvent;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

pub struct EventBus {
    tx: broadcast::Sender<ActionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Fire-and-forget: with no subscribers the event is dropped
    pub fn emit(&self, event: ActionEvent) {
        debug!(event_type = event.event_type(), run_id = event.run_id(), "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Receive all events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ActionEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(run_id: &str) -> ActionEvent {
        ActionEvent::Started {
            run_id: run_id.to_string(),
            target: "app".to_string(),
            rule: "jvm.compile".to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(started("r1"));
        assert_eq!(a.recv().await.unwrap().run_id(), "r1");
        assert_eq!(b.recv().await.unwrap().run_id(), "r1");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(started("r1"));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
