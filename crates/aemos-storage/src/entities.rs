//! Persistent entity types.
//!
//! These mirror the relational rows the repository façade exposes. The
//! engine never touches the database directly; it reads and writes these
//! through the [`crate::Repository`] trait.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sensor lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Active,
    Inactive,
    Pending,
    Calibrating,
    Error,
    Disconnected,
    Retired,
}

impl SensorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorStatus::Active => "active",
            SensorStatus::Inactive => "inactive",
            SensorStatus::Pending => "pending",
            SensorStatus::Calibrating => "calibrating",
            SensorStatus::Error => "error",
            SensorStatus::Disconnected => "disconnected",
            SensorStatus::Retired => "retired",
        }
    }
}

/// A sensor owned by an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub status: SensorStatus,
    pub organization_id: i64,
}

/// Device lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Inactive,
    Error,
    Disconnected,
}

/// A device owned by an organization. Has many [`DeviceState`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub status: DeviceStatus,
    pub organization_id: i64,
}

/// Declared datatype of a telemetry channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Number,
    Boolean,
    String,
}

impl Datatype {
    /// Coerce a stored text value per the declared datatype.
    ///
    /// Numbers that fail to parse and booleans outside true/false fall back
    /// to the raw string, matching how the collection path treats dirty
    /// historical rows.
    pub fn coerce(&self, raw: &str) -> Value {
        match self {
            Datatype::Number => match raw.trim().parse::<f64>() {
                Ok(n) => serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(raw.to_string())),
                Err(_) => Value::String(raw.to_string()),
            },
            Datatype::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::String(raw.to_string()),
            },
            Datatype::String => Value::String(raw.to_string()),
        }
    }
}

/// A named channel on a sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryData {
    pub id: i64,
    pub sensor_id: i64,
    pub variable_name: String,
    pub datatype: Datatype,
}

/// A single append-only reading row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataStream {
    pub id: i64,
    pub telemetry_data_id: i64,
    /// Text value, coerced per the channel datatype at read time.
    pub value: String,
    pub received_at: DateTime<Utc>,
}

/// Declaration of a named state on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub id: i64,
    pub device_id: i64,
    pub state_name: String,
}

/// One interval record of a device state value.
///
/// The current value is the row with `to_timestamp == None`. Writing a new
/// instance closes the previous open row; at most one open interval exists
/// per [`DeviceState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStateInstance {
    pub id: i64,
    pub device_state_id: i64,
    pub value: String,
    pub from_timestamp: DateTime<Utc>,
    pub to_timestamp: Option<DateTime<Utc>>,
    /// Actor kind, e.g. `rule_chain`, `device`, `user`.
    pub initiated_by: String,
    pub initiator_id: Option<i64>,
    /// Context attached by the initiator (chain id, node id, ...).
    pub metadata: Option<Value>,
}

impl DeviceStateInstance {
    /// Whether this is the current (open) interval.
    pub fn is_open(&self) -> bool {
        self.to_timestamp.is_none()
    }
}

/// Token lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Active,
    Revoked,
    Expired,
}

/// A token authenticating a device to speak for its sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceToken {
    pub id: i64,
    /// 64 hex characters.
    pub token: String,
    pub sensor_id: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub status: TokenStatus,
}

impl DeviceToken {
    /// Whether the token is usable at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TokenStatus::Active && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Dispatch policy determining which triggers cause a chain to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionType {
    #[serde(rename = "event-triggered")]
    EventTriggered,
    #[serde(rename = "schedule-only")]
    ScheduleOnly,
    #[default]
    #[serde(rename = "hybrid")]
    Hybrid,
}

impl ExecutionType {
    /// Chains of this type run when an event (telemetry, state change,
    /// manual trigger) arrives.
    pub fn runs_on_events(&self) -> bool {
        matches!(self, ExecutionType::EventTriggered | ExecutionType::Hybrid)
    }

    /// Chains of this type run when their cron fires.
    pub fn runs_on_schedule(&self) -> bool {
        matches!(self, ExecutionType::ScheduleOnly | ExecutionType::Hybrid)
    }
}

/// A rule chain definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleChain {
    pub id: i64,
    pub name: String,
    pub organization_id: i64,
    pub schedule_enabled: bool,
    pub cron_expression: Option<String>,
    /// IANA timezone name. Defaults to UTC.
    pub timezone: String,
    /// 0..=100.
    pub priority: u8,
    /// 0..=10.
    pub max_retries: u8,
    /// 0..=60000.
    pub retry_delay_ms: u32,
    pub schedule_metadata: Option<Value>,
    pub execution_type: ExecutionType,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub execution_count: u64,
    pub failure_count: u64,
}

impl RuleChain {
    /// Compare the fields the schedule manager cares about. A change in
    /// any of them requires the schedule handle to be replaced.
    pub fn schedule_fields_eq(&self, other: &RuleChain) -> bool {
        self.cron_expression == other.cron_expression
            && self.timezone == other.timezone
            && self.priority == other.priority
            && self.max_retries == other.max_retries
            && self.retry_delay_ms == other.retry_delay_ms
            && self.schedule_metadata == other.schedule_metadata
            && self.schedule_enabled == other.schedule_enabled
    }
}

/// Node kind within a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Filter,
    Transform,
    Action,
}

impl NodeType {
    /// Default execution rank: filters before transforms before actions.
    pub fn rank(&self) -> u8 {
        match self {
            NodeType::Filter => 0,
            NodeType::Transform => 1,
            NodeType::Action => 2,
        }
    }
}

/// A node in a rule chain. Nodes form a singly-linked list; cycles are
/// rejected when the chain is parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleChainNode {
    pub id: i64,
    pub rule_chain_id: i64,
    /// Unique within the chain.
    pub name: String,
    pub node_type: NodeType,
    /// Serialized expression, parsed once when the chain is indexed.
    pub config: String,
    pub next_node_id: Option<i64>,
}
