//! HTTP adapter: request normalization.
//!
//! The REST controllers live outside this core; what belongs here is the
//! translation of an HTTP device request into the uniform envelope. Paths
//! reuse the topic grammar (`/devices/{uuid}/datastream` etc.) and query
//! parameters travel in the envelope's `query` member.

use std::collections::HashMap;

use crate::message::{Message, Protocol};

/// A device-facing HTTP request, already read off the wire.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
    pub client_id: Option<String>,
}

/// Normalize an HTTP request into a [`Message`].
pub fn normalize(request: HttpRequest) -> Message {
    let mut message = Message::new(Protocol::Http, request.path, &request.body);
    if !request.query.is_empty() {
        message.query = Some(request.query);
    }
    if let Some(client_id) = request.client_id {
        message = message.with_client_id(client_id);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    #[test]
    fn path_maps_to_the_topic_grammar() {
        let message = normalize(HttpRequest {
            method: "POST".into(),
            path: "/devices/d1/datastream".into(),
            query: HashMap::new(),
            body: br#"{"value": "1", "telemetryDataId": 3}"#.to_vec(),
            client_id: None,
        });
        assert_eq!(
            message.message_type(),
            MessageType::DataStream {
                device_uuid: "d1".into()
            }
        );
        assert_eq!(message.payload["telemetryDataId"], 3);
    }

    #[test]
    fn query_parameters_are_carried() {
        let mut query = HashMap::new();
        query.insert("urgent".to_string(), "true".to_string());
        let message = normalize(HttpRequest {
            method: "POST".into(),
            path: "/devices/d1/state".into(),
            query,
            body: b"{}".to_vec(),
            client_id: Some("gateway-3".into()),
        });
        assert_eq!(
            message.query.as_ref().unwrap().get("urgent"),
            Some(&"true".to_string())
        );
        assert_eq!(message.client_id.as_deref(), Some("gateway-3"));
    }
}
