//! Message router: envelope validation, authentication, handler dispatch.
//!
//! One entry point, [`MessageRouter::route`]. The router derives the
//! message type from the topic, authenticates the device, runs the matching
//! handler, and answers with a uniform response envelope
//! `{status, message?, data?, code?}`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use aemos_core::{
    BusEvent, EngineEvent, Error, EventMetadata, NotificationPriority, SharedEventBus,
    TelemetryPoint,
};
use aemos_notify::{Notification, NotificationManager, Thresholds};
use aemos_storage::{DeviceStatus, NewStateInstance, SharedRepository};

use crate::auth::{AuthenticatedSensor, DeviceAuthenticator};
use crate::message::{Message, MessageType};

/// Uniform handler response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct RouteResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl RouteResponse {
    pub fn success(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            status: "success",
            message: Some(message.into()),
            data,
            code: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: Some(message.into()),
            data: None,
            code: Some(code.into()),
        }
    }

    fn from_error(e: &Error) -> Self {
        Self::error(e.code(), e.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Where the router submits engine events. Implemented by the engine's
/// queue; tests use a recording sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn submit(&self, event: EngineEvent, metadata: EventMetadata) -> aemos_core::Result<()>;
}

/// Routes normalized messages to their handlers.
pub struct MessageRouter {
    repo: SharedRepository,
    auth: Arc<DeviceAuthenticator>,
    sink: Arc<dyn EventSink>,
    bus: SharedEventBus,
    notify: Arc<NotificationManager>,
}

impl MessageRouter {
    pub fn new(
        repo: SharedRepository,
        auth: Arc<DeviceAuthenticator>,
        sink: Arc<dyn EventSink>,
        bus: SharedEventBus,
        notify: Arc<NotificationManager>,
    ) -> Self {
        Self {
            repo,
            auth,
            sink,
            bus,
            notify,
        }
    }

    /// Route one message.
    pub async fn route(&self, message: Message) -> RouteResponse {
        if message.topic.is_empty() {
            return RouteResponse::error("VALIDATION_ERROR", "empty topic");
        }

        // Feedback-loop suppression: our own publishers are acknowledged
        // and dropped before any handler runs.
        if let Some(client_id) = &message.client_id {
            if DeviceAuthenticator::is_feedback_client(client_id) {
                tracing::info!(client_id = %client_id, topic = %message.topic, "skipping own publisher message");
                return RouteResponse::success("acknowledged: own publisher, not processed", None);
            }
        }

        let message_type = message.message_type();
        match message_type {
            MessageType::Unknown => {
                tracing::debug!(topic = %message.topic, "message with invalid topic routed nowhere");
                RouteResponse::error("VALIDATION_ERROR", format!("invalid topic: {}", message.topic))
            }
            MessageType::Notifications { .. } => RouteResponse::error(
                "UNKNOWN_MESSAGE_TYPE",
                "notifications topic is outbound only",
            ),
            MessageType::DataStream { device_uuid } => {
                self.handle_data_stream(&message, &device_uuid).await
            }
            MessageType::DeviceStatus { device_uuid } => {
                self.handle_device_status(&message, &device_uuid).await
            }
            MessageType::DeviceState { device_uuid } => {
                self.handle_device_state(&message, &device_uuid).await
            }
            MessageType::Commands { device_uuid } => {
                // Command delivery is hardware-bound; this core only logs.
                tracing::info!(device_uuid = %device_uuid, payload = %message.payload, "command received");
                RouteResponse::success("command logged", None)
            }
            MessageType::Broadcast { org_segment } => {
                self.handle_broadcast(&message, &org_segment).await
            }
            MessageType::RuleChain {
                org_segment,
                chain_segment,
            } => {
                self.handle_rule_chain_trigger(&message, &org_segment, &chain_segment)
                    .await
            }
        }
    }

    /// Resolve the publishing identity for a device-scoped topic.
    ///
    /// Internal-publisher credentials bypass token lookup. Without a token,
    /// development mode accepts the publish with a warning; production
    /// rejects it.
    async fn authorize(
        &self,
        message: &Message,
        device_uuid: &str,
    ) -> Result<Option<AuthenticatedSensor>, RouteResponse> {
        if let (Some(user), Some(pass)) = (&message.username, &message.password) {
            if self.auth.is_internal(user, pass) {
                return Ok(None);
            }
        }
        match message.token() {
            Some(token) => match self.auth.authenticate(device_uuid, token).await {
                Ok(identity) => Ok(Some(identity)),
                Err(e) => Err(RouteResponse::from_error(&e)),
            },
            None if self.auth.dev_mode() => {
                tracing::warn!(
                    device_uuid = %device_uuid,
                    "accepting unauthenticated publish in development mode"
                );
                Ok(None)
            }
            None => Err(RouteResponse::error(
                "AUTHENTICATION_FAILED",
                "token required",
            )),
        }
    }

    async fn handle_data_stream(&self, message: &Message, device_uuid: &str) -> RouteResponse {
        let identity = match self.authorize(message, device_uuid).await {
            Ok(identity) => identity,
            Err(resp) => return resp,
        };

        // Unauthenticated paths (dev mode, internal) resolve the sensor
        // from the claimed UUID.
        let sensor = match &identity {
            Some(identity) => (
                identity.sensor_id,
                identity.sensor_uuid.clone(),
                identity.organization_id,
            ),
            None => match self.repo.sensor_by_uuid(device_uuid).await {
                Ok(Some(sensor)) => (sensor.id, sensor.uuid, sensor.organization_id),
                Ok(None) => {
                    return RouteResponse::error(
                        "DEVICE_NOT_FOUND",
                        format!("no sensor for device {device_uuid}"),
                    )
                }
                Err(e) => return RouteResponse::from_error(&Error::from(e)),
            },
        };
        let (sensor_id, sensor_uuid, organization_id) = sensor;

        let items: Vec<Value> = match message.payload.get("dataStreams") {
            Some(Value::Array(batch)) => batch.clone(),
            Some(_) => {
                return RouteResponse::error("VALIDATION_ERROR", "dataStreams must be an array")
            }
            None => vec![message.payload.clone()],
        };
        if items.is_empty() {
            return RouteResponse::error("VALIDATION_ERROR", "empty dataStreams batch");
        }

        let mut stored = 0usize;
        for item in &items {
            match self
                .ingest_item(item, sensor_id, &sensor_uuid, organization_id)
                .await
            {
                Ok(()) => stored += 1,
                Err(resp) => return resp,
            }
        }

        RouteResponse::success(
            format!("stored {stored} data stream(s)"),
            Some(serde_json::json!({ "stored": stored })),
        )
    }

    async fn ingest_item(
        &self,
        item: &Value,
        sensor_id: i64,
        sensor_uuid: &str,
        organization_id: i64,
    ) -> Result<(), RouteResponse> {
        let Some(telemetry_data_id) = item.get("telemetryDataId").and_then(Value::as_i64) else {
            return Err(RouteResponse::error(
                "VALIDATION_ERROR",
                "telemetryDataId is required",
            ));
        };
        let value = match item.get("value") {
            Some(Value::String(s)) => s.clone(),
            Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string(),
            _ => {
                return Err(RouteResponse::error(
                    "VALIDATION_ERROR",
                    "value must be a scalar",
                ))
            }
        };

        let channel = match self.repo.telemetry_data(telemetry_data_id).await {
            Ok(Some(td)) => td,
            Ok(None) => {
                return Err(RouteResponse::error(
                    "VALIDATION_ERROR",
                    format!("unknown telemetryDataId {telemetry_data_id}"),
                ))
            }
            Err(e) => return Err(RouteResponse::from_error(&Error::from(e))),
        };
        if channel.sensor_id != sensor_id {
            return Err(RouteResponse::error(
                "VALIDATION_ERROR",
                format!("telemetryDataId {telemetry_data_id} does not belong to this sensor"),
            ));
        }

        let row = match self
            .repo
            .insert_data_stream(telemetry_data_id, value.clone())
            .await
        {
            Ok(row) => row,
            Err(e) => return Err(RouteResponse::from_error(&Error::from(e))),
        };

        let point = TelemetryPoint {
            organization_id,
            sensor_uuid: sensor_uuid.to_string(),
            telemetry_data_id,
            variable_name: channel.variable_name.clone(),
            value: channel.datatype.coerce(&row.value),
            timestamp: row.received_at,
        };
        self.bus.publish_with_source(
            BusEvent::DataStreamStored {
                organization_id,
                sensor_uuid: sensor_uuid.to_string(),
                variable_name: channel.variable_name.clone(),
                value: point.value.clone(),
                timestamp: row.received_at,
            },
            "router",
        );

        // Envelope-level urgency: an explicit flag or a threshold crossing
        // bypasses notification buffering.
        let urgent = item.get("urgent").and_then(Value::as_bool).unwrap_or(false);
        let thresholds = item
            .get("thresholds")
            .and_then(|t| serde_json::from_value::<Thresholds>(t.clone()).ok())
            .unwrap_or_default();
        let priority = if urgent || thresholds.crossed_by(&value) {
            NotificationPriority::High
        } else {
            NotificationPriority::Normal
        };
        self.notify
            .enqueue(Notification::data_stream(
                organization_id,
                sensor_uuid,
                &channel.variable_name,
                &point.value,
                priority,
            ))
            .await;
        if let Err(e) = self
            .sink
            .submit(EngineEvent::Telemetry(point), EventMetadata::new("router"))
            .await
        {
            return Err(RouteResponse::from_error(&e));
        }
        Ok(())
    }

    async fn handle_device_status(&self, message: &Message, device_uuid: &str) -> RouteResponse {
        if let Err(resp) = self.authorize(message, device_uuid).await {
            return resp;
        }

        let Some(status) = message
            .payload
            .get("status")
            .and_then(|v| serde_json::from_value::<DeviceStatus>(v.clone()).ok())
        else {
            return RouteResponse::error("VALIDATION_ERROR", "status is required");
        };

        match self.repo.update_device_status(device_uuid, status).await {
            Ok(()) => RouteResponse::success("device status updated", None),
            Err(aemos_storage::StorageError::NotFound(_)) => RouteResponse::error(
                "DEVICE_NOT_FOUND",
                format!("unknown device {device_uuid}"),
            ),
            Err(e) => RouteResponse::from_error(&Error::from(e)),
        }
    }

    async fn handle_device_state(&self, message: &Message, device_uuid: &str) -> RouteResponse {
        if let Err(resp) = self.authorize(message, device_uuid).await {
            return resp;
        }

        let device = match self.repo.device_by_uuid(device_uuid).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                return RouteResponse::error(
                    "DEVICE_NOT_FOUND",
                    format!("unknown device {device_uuid}"),
                )
            }
            Err(e) => return RouteResponse::from_error(&Error::from(e)),
        };

        let (Some(state_name), Some(value)) = (
            message.payload.get("stateName").and_then(Value::as_str),
            message.payload.get("value"),
        ) else {
            return RouteResponse::error("VALIDATION_ERROR", "stateName and value are required");
        };
        let value_text = match value {
            Value::String(s) => s.clone(),
            v @ (Value::Number(_) | Value::Bool(_)) => v.to_string(),
            _ => return RouteResponse::error("VALIDATION_ERROR", "value must be a scalar"),
        };

        let instance = match self
            .repo
            .create_state_instance(NewStateInstance {
                device_uuid: device_uuid.to_string(),
                state_name: state_name.to_string(),
                value: value_text.clone(),
                initiated_by: "device".to_string(),
                initiator_id: Some(device.id),
                metadata: None,
            })
            .await
        {
            Ok(instance) => instance,
            Err(aemos_storage::StorageError::NotFound(msg)) => {
                return RouteResponse::error("VALIDATION_ERROR", msg)
            }
            Err(e) => return RouteResponse::from_error(&Error::from(e)),
        };

        self.bus.publish_with_source(
            BusEvent::StateChanged {
                organization_id: device.organization_id,
                device_uuid: device_uuid.to_string(),
                state_name: state_name.to_string(),
                value: value_text.clone(),
                priority: NotificationPriority::Normal,
                timestamp: instance.from_timestamp,
            },
            "router",
        );
        let event = EngineEvent::DeviceStateChange {
            organization_id: device.organization_id,
            device_uuid: device_uuid.to_string(),
            state_name: state_name.to_string(),
            value: value_text,
            timestamp: instance.from_timestamp,
        };
        if let Err(e) = self.sink.submit(event, EventMetadata::new("router")).await {
            return RouteResponse::from_error(&e);
        }

        RouteResponse::success("state recorded", None)
    }

    /// Read surface for CoAP/HTTP `GET devices/{uuid}/state`: the latest
    /// open interval of a named state. Observers subscribe to subsequent
    /// changes through the event bus.
    pub async fn latest_state(&self, device_uuid: &str, state_name: &str) -> RouteResponse {
        match self
            .repo
            .latest_open_state_instance(device_uuid, state_name)
            .await
        {
            Ok(Some(instance)) => match serde_json::to_value(&instance) {
                Ok(data) => RouteResponse::success("current state", Some(data)),
                Err(e) => RouteResponse::error("ROUTING_ERROR", e.to_string()),
            },
            Ok(None) => RouteResponse::error(
                "DEVICE_NOT_FOUND",
                format!("no open state {state_name} on device {device_uuid}"),
            ),
            Err(e) => RouteResponse::from_error(&Error::from(e)),
        }
    }

    async fn handle_broadcast(&self, message: &Message, org_segment: &str) -> RouteResponse {
        let Ok(organization_id) = org_segment.parse::<i64>() else {
            return RouteResponse::error(
                "INVALID_ORG_ID",
                format!("invalid organization id: {org_segment}"),
            );
        };

        let delivered = self.bus.publish_with_source(
            BusEvent::Broadcast {
                organization_id,
                payload: message.payload.clone(),
                timestamp: message.timestamp,
            },
            "router",
        );
        RouteResponse::success(
            "broadcast published",
            Some(serde_json::json!({ "delivered": delivered })),
        )
    }

    async fn handle_rule_chain_trigger(
        &self,
        message: &Message,
        org_segment: &str,
        chain_segment: &str,
    ) -> RouteResponse {
        let Ok(organization_id) = org_segment.parse::<i64>() else {
            return RouteResponse::error(
                "INVALID_ORG_ID",
                format!("invalid organization id: {org_segment}"),
            );
        };
        let Ok(rule_chain_id) = chain_segment.parse::<i64>() else {
            return RouteResponse::error(
                "VALIDATION_ERROR",
                format!("invalid rule chain id: {chain_segment}"),
            );
        };

        let event = EngineEvent::ManualTrigger {
            rule_chain_id,
            organization_id,
            data: Some(message.payload.clone()),
        };
        match self.sink.submit(event, EventMetadata::new("router")).await {
            Ok(()) => RouteResponse::success("trigger enqueued", None),
            Err(e) => RouteResponse::from_error(&e),
        }
    }
}
