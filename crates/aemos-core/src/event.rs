//! Event model for the AEMOS core.
//!
//! Two families of events flow through the system:
//!
//! - [`EngineEvent`]: work items consumed by the rule-engine worker pool.
//!   Exactly one worker handles each engine event.
//! - [`BusEvent`]: observability fan-out published on the broadcast
//!   [`crate::EventBus`] for protocol subscribers (MQTT echo topics,
//!   CoAP observers, WebSocket clients).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single ingested telemetry reading, normalized for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPoint {
    /// Owning organization.
    pub organization_id: i64,
    /// UUID of the sensor the reading belongs to.
    pub sensor_uuid: String,
    /// Telemetry channel row id.
    pub telemetry_data_id: i64,
    /// Channel name, e.g. `temp`.
    pub variable_name: String,
    /// Raw value as received (coercion happens at collection time).
    pub value: Value,
    /// When the reading was received.
    pub timestamp: DateTime<Utc>,
}

/// Work items for the rule-engine queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// One sensor reading was persisted.
    Telemetry(TelemetryPoint),
    /// A batch envelope was persisted; points share one organization.
    BatchTelemetry {
        organization_id: i64,
        points: Vec<TelemetryPoint>,
    },
    /// A device state instance changed.
    DeviceStateChange {
        organization_id: i64,
        device_uuid: String,
        state_name: String,
        value: String,
        timestamp: DateTime<Utc>,
    },
    /// A rule chain or its nodes were mutated via the REST surface.
    RuleChainUpdated {
        rule_chain_id: i64,
        organization_id: i64,
    },
    /// A rule chain was deleted.
    RuleChainDeleted {
        rule_chain_id: i64,
        organization_id: i64,
    },
    /// Operator-initiated execution of a single chain.
    ManualTrigger {
        rule_chain_id: i64,
        organization_id: i64,
        data: Option<Value>,
    },
    /// Cron fire from the schedule manager.
    ScheduleTrigger {
        rule_chain_id: i64,
        organization_id: i64,
        /// Retry attempt, 0 for the initial fire.
        attempt: u32,
    },
}

impl EngineEvent {
    /// Short variant name for logging and metrics.
    pub fn type_name(&self) -> &'static str {
        match self {
            EngineEvent::Telemetry(_) => "telemetry",
            EngineEvent::BatchTelemetry { .. } => "batchTelemetry",
            EngineEvent::DeviceStateChange { .. } => "deviceStateChange",
            EngineEvent::RuleChainUpdated { .. } => "ruleChainUpdated",
            EngineEvent::RuleChainDeleted { .. } => "ruleChainDeleted",
            EngineEvent::ManualTrigger { .. } => "manualTrigger",
            EngineEvent::ScheduleTrigger { .. } => "scheduleTrigger",
        }
    }

    /// Organization the event belongs to.
    pub fn organization_id(&self) -> i64 {
        match self {
            EngineEvent::Telemetry(p) => p.organization_id,
            EngineEvent::BatchTelemetry {
                organization_id, ..
            }
            | EngineEvent::DeviceStateChange {
                organization_id, ..
            }
            | EngineEvent::RuleChainUpdated {
                organization_id, ..
            }
            | EngineEvent::RuleChainDeleted {
                organization_id, ..
            }
            | EngineEvent::ManualTrigger {
                organization_id, ..
            }
            | EngineEvent::ScheduleTrigger {
                organization_id, ..
            } => *organization_id,
        }
    }

    /// Key that pins same-device events to one worker lane, preserving
    /// publish order. Events without an entity affinity return `None`
    /// and may run on any lane.
    pub fn ordering_key(&self) -> Option<&str> {
        match self {
            EngineEvent::Telemetry(p) => Some(&p.sensor_uuid),
            EngineEvent::BatchTelemetry { points, .. } => {
                points.first().map(|p| p.sensor_uuid.as_str())
            }
            EngineEvent::DeviceStateChange { device_uuid, .. } => Some(device_uuid),
            _ => None,
        }
    }

    /// Control events mutate engine state (index, schedules) instead of
    /// executing chains.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            EngineEvent::RuleChainUpdated { .. } | EngineEvent::RuleChainDeleted { .. }
        )
    }
}

/// Metadata attached to every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event id.
    pub event_id: Uuid,
    /// Component that produced the event, e.g. `mqtt`, `scheduler`.
    pub source: String,
    /// When the event entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// Deadline budget in milliseconds for the whole event.
    pub deadline_ms: u64,
}

impl EventMetadata {
    /// Metadata with a fresh id and the default 5 s budget.
    pub fn new(source: impl Into<String>) -> Self {
        Self::with_deadline(source, crate::config::DEFAULT_EVENT_DEADLINE_MS)
    }

    /// Metadata with an explicit deadline budget.
    pub fn with_deadline(source: impl Into<String>, deadline_ms: u64) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            source: source.into(),
            enqueued_at: Utc::now(),
            deadline_ms,
        }
    }
}

/// Notification priority for the fan-out path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    /// Delivered through the buffered path.
    Normal,
    /// Bypasses buffering, flushed immediately.
    High,
}

/// Events published on the broadcast bus for subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusEvent {
    /// A device state instance was written.
    StateChanged {
        organization_id: i64,
        device_uuid: String,
        state_name: String,
        value: String,
        priority: NotificationPriority,
        timestamp: DateTime<Utc>,
    },
    /// A data stream row was persisted.
    DataStreamStored {
        organization_id: i64,
        sensor_uuid: String,
        variable_name: String,
        value: Value,
        timestamp: DateTime<Utc>,
    },
    /// A rule chain finished executing; summary for the echo topic.
    ChainExecuted {
        organization_id: i64,
        rule_chain_id: i64,
        status: String,
        filters_passed: bool,
        actions_executed: usize,
        timestamp: DateTime<Utc>,
    },
    /// Organization-wide broadcast payload.
    Broadcast {
        organization_id: i64,
        payload: Value,
        timestamp: DateTime<Utc>,
    },
}

impl BusEvent {
    /// Short variant name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            BusEvent::StateChanged { .. } => "StateChanged",
            BusEvent::DataStreamStored { .. } => "DataStreamStored",
            BusEvent::ChainExecuted { .. } => "ChainExecuted",
            BusEvent::Broadcast { .. } => "Broadcast",
        }
    }

    /// Owning organization.
    pub fn organization_id(&self) -> i64 {
        match self {
            BusEvent::StateChanged {
                organization_id, ..
            }
            | BusEvent::DataStreamStored {
                organization_id, ..
            }
            | BusEvent::ChainExecuted {
                organization_id, ..
            }
            | BusEvent::Broadcast {
                organization_id, ..
            } => *organization_id,
        }
    }

    /// Whether this is a device-state notification.
    pub fn is_state_event(&self) -> bool {
        matches!(self, BusEvent::StateChanged { .. })
    }

    /// Whether this is a data-stream notification.
    pub fn is_stream_event(&self) -> bool {
        matches!(self, BusEvent::DataStreamStored { .. })
    }
}
