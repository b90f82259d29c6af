//! In-process delivery channel between the relay and dispatcher workers.

use tokio::sync::broadcast;

use crate::error::EventError;
use crate::event::PipelineEvent;

/// Default broadcast channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Publisher that hands relayed events to dispatcher workers.
#[derive(Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventPublisher {
    /// Create a publisher and its first receiver.
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<PipelineEvent>) {
        let (sender, receiver) = broadcast::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Hand an event to the attached dispatchers.
    ///
    /// Fails when no dispatcher is attached; the relay treats that as a
    /// failed hand-off and keeps the outbox row for a later cycle, so events
    /// are never dropped into a channel nobody reads.
    pub fn publish(&self, event: PipelineEvent) -> Result<usize, EventError> {
        let event_id = event.event_id;

        self.sender.send(event).map_err(|_| {
            tracing::warn!(
                target: "outbox_relay",
                event_id = %event_id,
                "No dispatcher attached to the delivery channel"
            );
            EventError::PublishFailed {
                cause: "no active receivers".to_string(),
            }
        })
    }

    /// Attach a new dispatcher receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Number of currently attached receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn test_event() -> PipelineEvent {
        PipelineEvent {
            event_id: Uuid::new_v4(),
            aggregate_id: Uuid::new_v4(),
            event_type: "created".to_string(),
            occurred_at: Utc::now(),
            data: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let (publisher, mut receiver) = EventPublisher::new(16);
        let event = test_event();

        publisher.publish(event.clone()).unwrap();

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_id, event.event_id);
    }

    #[tokio::test]
    async fn test_publish_without_receiver_fails() {
        let (publisher, receiver) = EventPublisher::new(16);
        drop(receiver);

        let result = publisher.publish(test_event());
        assert!(matches!(result, Err(EventError::PublishFailed { .. })));
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_all_subscribers() {
        let (publisher, mut first) = EventPublisher::new(16);
        let mut second = publisher.subscribe();
        let event = test_event();

        let delivered = publisher.publish(event.clone()).unwrap();
        assert_eq!(delivered, 2);

        assert_eq!(first.recv().await.unwrap().event_id, event.event_id);
        assert_eq!(second.recv().await.unwrap().event_id, event.event_id);
    }
}
