//! Protocol ingress: adapters, device authentication, and the message
//! router.
//!
//! Devices reach the core over MQTT, CoAP, or HTTP. Each protocol adapter
//! normalizes its input into one [`Message`] envelope; the
//! [`MessageRouter`] validates it, authenticates the device by token, and
//! dispatches to the matching handler. Data-stream ingest persists readings
//! and hands telemetry events to the engine through the [`EventSink`] seam.

pub mod adapters;
pub mod auth;
pub mod message;
pub mod router;

pub use adapters::{CoapRequest, HttpRequest};
#[cfg(feature = "mqtt")]
pub use adapters::MqttBridge;
pub use auth::{AuthenticatedSensor, DeviceAuthenticator, PUBLISHER_CLIENT_PREFIX};
pub use message::{decode_payload, parse_topic, Message, MessageType, Protocol};
pub use router::{EventSink, MessageRouter, RouteResponse};
