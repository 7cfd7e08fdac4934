//! CoAP adapter: request normalization.
//!
//! The CoAP wire codec and server socket are external collaborators; this
//! adapter translates a decoded CoAP request into the uniform envelope.
//! Paths reuse the topic grammar. An `observe` request is flagged in the
//! envelope query so the notification fan-out can register the subscriber.

use crate::message::{Message, Protocol};

/// A decoded CoAP request.
#[derive(Debug, Clone)]
pub struct CoapRequest {
    pub path: String,
    pub payload: Vec<u8>,
    /// CoAP Observe option present.
    pub observe: bool,
    pub client_id: Option<String>,
}

/// Normalize a CoAP request into a [`Message`].
pub fn normalize(request: CoapRequest) -> Message {
    let mut message = Message::new(Protocol::Coap, request.path, &request.payload).with_qos(0);
    if request.observe {
        let mut query = std::collections::HashMap::new();
        query.insert("observe".to_string(), "true".to_string());
        message.query = Some(query);
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
    fn coap_paths_share_the_grammar() {
        let message = normalize(CoapRequest {
            path: "devices/d1/state".into(),
            payload: br#"{"stateName": "door", "value": "open"}"#.to_vec(),
            observe: false,
            client_id: None,
        });
        assert_eq!(
            message.message_type(),
            MessageType::DeviceState {
                device_uuid: "d1".into()
            }
        );
        assert_eq!(message.qos, 0);
    }

    #[test]
    fn observe_is_flagged_in_the_query() {
        let message = normalize(CoapRequest {
            path: "devices/d1/state".into(),
            payload: Vec::new(),
            observe: true,
            client_id: None,
        });
        assert_eq!(
            message.query.unwrap().get("observe"),
            Some(&"true".to_string())
        );
    }
}
