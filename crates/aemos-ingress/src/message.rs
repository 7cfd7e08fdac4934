//! Uniform message envelope and the inbound topic grammar.
//!
//! Every protocol adapter normalizes its input into a [`Message`]. The
//! topic grammar is shared: MQTT topics and CoAP/HTTP paths use the same
//! segments.
//!
//! Inbound grammar:
//!
//! - `devices/{deviceUuid}/datastream`
//! - `devices/{deviceUuid}/status`
//! - `devices/{deviceUuid}/state`
//! - `devices/{deviceUuid}/commands`
//! - `devices/{deviceUuid}/notifications` (outbound only)
//! - `organizations/{orgId}/broadcast`
//! - `organizations/{orgId}/rulechain/{ruleChainId}`
//!
//! Topics are restricted to `[A-Za-z0-9_\-/]`. Whitespace, `.`, `@`, and
//! MQTT wildcards are rejected on inbound: the envelope gets
//! [`MessageType::Unknown`] and is routed nowhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Wire protocol a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mqtt,
    Coap,
    Http,
}

/// Routing class derived from the topic/path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    DataStream { device_uuid: String },
    DeviceStatus { device_uuid: String },
    DeviceState { device_uuid: String },
    Commands { device_uuid: String },
    /// Valid as a topic, but outbound only; inbound publishes are refused.
    Notifications { device_uuid: String },
    Broadcast { org_segment: String },
    RuleChain { org_segment: String, chain_segment: String },
    Unknown,
}

impl MessageType {
    /// Handler name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::DataStream { .. } => "dataStream",
            MessageType::DeviceStatus { .. } => "deviceStatus",
            MessageType::DeviceState { .. } => "deviceState",
            MessageType::Commands { .. } => "commands",
            MessageType::Notifications { .. } => "notifications",
            MessageType::Broadcast { .. } => "broadcast",
            MessageType::RuleChain { .. } => "ruleChain",
            MessageType::Unknown => "unknown",
        }
    }
}

/// Characters allowed in a topic. Everything else invalidates it.
fn topic_char_ok(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/')
}

/// Derive the message type from a topic or path.
pub fn parse_topic(topic: &str) -> MessageType {
    let trimmed = topic.trim_start_matches('/');
    if trimmed.is_empty() || !trimmed.chars().all(topic_char_ok) {
        return MessageType::Unknown;
    }

    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return MessageType::Unknown;
    }

    match segments.as_slice() {
        ["devices", uuid, action] => {
            let device_uuid = uuid.to_string();
            match *action {
                "datastream" => MessageType::DataStream { device_uuid },
                "status" => MessageType::DeviceStatus { device_uuid },
                "state" => MessageType::DeviceState { device_uuid },
                "commands" => MessageType::Commands { device_uuid },
                "notifications" => MessageType::Notifications { device_uuid },
                _ => MessageType::Unknown,
            }
        }
        ["organizations", org, "broadcast"] => MessageType::Broadcast {
            org_segment: org.to_string(),
        },
        ["organizations", org, "rulechain", chain] => MessageType::RuleChain {
            org_segment: org.to_string(),
            chain_segment: chain.to_string(),
        },
        _ => MessageType::Unknown,
    }
}

/// Decode a payload: JSON when the bytes parse, otherwise the raw text
/// wrapped as `{"value": "<string>"}`.
pub fn decode_payload(bytes: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => value,
        Err(_) => serde_json::json!({
            "value": String::from_utf8_lossy(bytes).into_owned(),
        }),
    }
}

/// Uniform envelope produced by the protocol adapters.
#[derive(Debug, Clone)]
pub struct Message {
    pub protocol: Protocol,
    pub topic: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub client_id: Option<String>,
    /// Connection credentials, when the protocol carries them.
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: u8,
    pub query: Option<HashMap<String, String>>,
}

impl Message {
    /// Build an envelope from raw protocol input.
    pub fn new(protocol: Protocol, topic: impl Into<String>, payload_bytes: &[u8]) -> Self {
        Self {
            protocol,
            topic: topic.into(),
            payload: decode_payload(payload_bytes),
            timestamp: Utc::now(),
            client_id: None,
            username: None,
            password: None,
            qos: 1,
            query: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    /// Routing class of this envelope.
    pub fn message_type(&self) -> MessageType {
        parse_topic(&self.topic)
    }

    /// Token carried in the payload envelope, if any.
    pub fn token(&self) -> Option<&str> {
        self.payload.get("token").and_then(Value::as_str)
    }
}
