//! Per-protocol normalization to the uniform envelope.

pub mod coap;
pub mod http;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use coap::CoapRequest;
pub use http::HttpRequest;
#[cfg(feature = "mqtt")]
pub use mqtt::MqttBridge;
