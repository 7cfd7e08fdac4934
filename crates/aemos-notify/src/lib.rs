//! Notification fan-out.
//!
//! State changes and data-stream notifications are buffered per
//! `(organization, topic)` and flushed on a short interval or when a buffer
//! fills, whichever comes first. High-priority notifications bypass the
//! buffers entirely. Delivery goes through the [`Publisher`] seam so the
//! MQTT bridge, a CoAP observer registry, or a WebSocket hub can all sit
//! behind the same manager.

pub mod notifier;

pub use notifier::{
    Notification, NotificationManager, Publisher, RecordingPublisher, Thresholds,
};
