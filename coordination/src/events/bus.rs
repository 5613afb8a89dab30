//! Event bus for evaluation orchestration
//!
//! Provides pub/sub messaging using Tokio broadcast channels. Publishing
//! never blocks: slow subscribers lag and lose the oldest events rather
//! than holding up the request path.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use super::types::OrchestrationEvent;
use crate::state::Fingerprint;

/// Default channel capacity for broadcast
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus over a broadcast channel
pub struct EventBus {
    sender: broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
    /// Create a new event bus with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus holding up to `capacity` unread events per subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of subscribers that will see it; zero is not an error.
    pub fn publish(&self, event: OrchestrationEvent) -> usize {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => {
                trace!(event_type, receivers = count, "Event published");
                count
            }
            Err(_) => {
                trace!(event_type, "Event published (no receivers)");
                0
            }
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if the bus has any subscribers
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by fingerprint
    pub fingerprint: Option<Fingerprint>,
    /// Filter by event types
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by fingerprint
    pub fn fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    /// Filter by event types
    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &OrchestrationEvent) -> bool {
        if let Some(ref fp) = self.fingerprint {
            if event.fingerprint() != fp {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        true
    }
}

/// Filtered event receiver that only yields matching events
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<OrchestrationEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Create a new filtered receiver
    pub fn new(receiver: broadcast::Receiver<OrchestrationEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> Result<OrchestrationEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// Extension trait for subscribing with filters
pub trait EventBusExt {
    /// Subscribe with a filter
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver;
}

impl EventBusExt for EventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CacheOutcome;
    use chrono::Utc;

    fn accessed(fp: &str, outcome: CacheOutcome) -> OrchestrationEvent {
        OrchestrationEvent::CacheAccessed {
            fingerprint: Fingerprint::new(fp),
            outcome,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        assert_eq!(bus.publish(accessed("fp-1", CacheOutcome::Hit)), 1);

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "cache_accessed");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert!(!bus.has_subscribers());
        assert_eq!(bus.publish(accessed("fp-1", CacheOutcome::Miss)), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new().shared();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);
        bus.publish(accessed("fp-1", CacheOutcome::Miss));

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.event_type(), e2.event_type());
    }

    #[test]
    fn test_event_filter() {
        let filter = EventFilter::new()
            .fingerprint(Fingerprint::new("fp-1"))
            .types(vec!["cache_accessed"]);

        let matching = accessed("fp-1", CacheOutcome::Hit);
        let other_fp = accessed("fp-2", CacheOutcome::Hit);
        let other_type = OrchestrationEvent::CacheInvalidated {
            fingerprint: Fingerprint::new("fp-1"),
            existed: true,
            timestamp: Utc::now(),
        };

        assert!(filter.matches(&matching));
        assert!(!filter.matches(&other_fp));
        assert!(!filter.matches(&other_type));
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let bus = EventBus::new();
        let mut filtered =
            bus.subscribe_filtered(EventFilter::new().fingerprint(Fingerprint::new("target")));

        bus.publish(accessed("other", CacheOutcome::Miss));
        bus.publish(accessed("target", CacheOutcome::Hit));

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.fingerprint().as_str(), "target");
    }
}
