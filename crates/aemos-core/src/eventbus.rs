//! Broadcast bus for outbound notifications.
//!
//! The bus distributes [`BusEvent`]s to every subscriber: the notification
//! fan-out, protocol echo publishers, and WebSocket bridges. It is distinct
//! from the engine work queue: a bus event may be observed by many
//! subscribers, while a queue event is handled by exactly one worker.

use crate::event::{BusEvent, EventMetadata};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Broadcast event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(BusEvent, EventMetadata)>,
    name: String,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    ///
    /// The capacity determines how many events are buffered for slow
    /// subscribers before they start lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            name: "default".to_string(),
        }
    }

    /// Create a new event bus with a name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            tx: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            name: name.into(),
        }
    }

    /// Name of this bus.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event with default metadata. Returns `true` if at least
    /// one subscriber received it.
    pub fn publish(&self, event: BusEvent) -> bool {
        self.publish_with_source(event, "system")
    }

    /// Publish an event with a custom source.
    pub fn publish_with_source(&self, event: BusEvent, source: impl Into<String>) -> bool {
        let metadata = EventMetadata::new(source);
        self.tx.send((event, metadata)).is_ok()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to events matching a filter.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&BusEvent) -> bool + Send + 'static,
    {
        FilteredReceiver::new(self.tx.subscribe(), filter)
    }

    /// Subscribe to state-change notifications only.
    pub fn state_events(&self) -> FilteredReceiver<fn(&BusEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), BusEvent::is_state_event)
    }

    /// Subscribe to data-stream notifications only.
    pub fn stream_events(&self) -> FilteredReceiver<fn(&BusEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), BusEvent::is_stream_event)
    }

    /// Subscribe to every event of one organization.
    pub fn for_organization(
        &self,
        organization_id: i64,
    ) -> FilteredReceiver<impl Fn(&BusEvent) -> bool + Send + 'static> {
        FilteredReceiver::new(self.tx.subscribe(), move |event| {
            event.organization_id() == organization_id
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for all events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(BusEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event. Returns `None` when the bus is closed.
    pub async fn recv(&mut self) -> Option<(BusEvent, EventMetadata)> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => {
                // Missed some events; keep receiving from where we are.
                self.rx.try_recv().ok()
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<(BusEvent, EventMetadata)> {
        self.rx.try_recv().ok()
    }
}

/// Receiver for filtered events.
pub struct FilteredReceiver<F>
where
    F: Fn(&BusEvent) -> bool + Send,
{
    rx: broadcast::Receiver<(BusEvent, EventMetadata)>,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&BusEvent) -> bool + Send,
{
    fn new(rx: broadcast::Receiver<(BusEvent, EventMetadata)>, filter: F) -> Self {
        Self { rx, filter }
    }

    /// Receive the next matching event. Returns `None` when the bus closes.
    pub async fn recv(&mut self) -> Option<(BusEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) => {
                    if (self.filter)(&event) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a matching event without blocking.
    pub fn try_recv(&mut self) -> Option<(BusEvent, EventMetadata)> {
        while let Ok((event, meta)) = self.rx.try_recv() {
            if (self.filter)(&event) {
                return Some((event, meta));
            }
        }
        None
    }
}

/// Shared event bus handle.
pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NotificationPriority;
    use chrono::Utc;

    fn state_event(org: i64) -> BusEvent {
        BusEvent::StateChanged {
            organization_id: org,
            device_uuid: "d1".into(),
            state_name: "fan".into(),
            value: "on".into(),
            priority: NotificationPriority::Normal,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_subscribe_round_trip() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(state_event(1));

        let (event, meta) = rx.recv().await.unwrap();
        assert_eq!(event.type_name(), "StateChanged");
        assert_eq!(meta.source, "system");
    }

    #[tokio::test]
    async fn filtered_by_kind() {
        let bus = EventBus::new();
        let mut rx = bus.state_events();

        bus.publish(BusEvent::Broadcast {
            organization_id: 1,
            payload: serde_json::json!({"msg": "hello"}),
            timestamp: Utc::now(),
        });
        bus.publish(state_event(1));

        let (event, _) = rx.recv().await.unwrap();
        assert!(event.is_state_event());
    }

    #[tokio::test]
    async fn filtered_by_organization() {
        let bus = EventBus::new();
        let mut rx = bus.for_organization(2);

        bus.publish(state_event(1));
        bus.publish(state_event(2));

        let (event, _) = rx.recv().await.unwrap();
        assert_eq!(event.organization_id(), 2);
    }

    #[tokio::test]
    async fn try_recv_without_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert!(rx.try_recv().is_none());

        bus.publish(state_event(1));
        assert!(rx.try_recv().is_some());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::new();
        assert!(!bus.publish(state_event(1)));
    }
}
