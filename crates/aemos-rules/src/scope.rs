//! Evaluation scope: the values a chain executes against.
//!
//! The collection step (or a manual trigger payload) produces a
//! [`DataScope`]: UUID-keyed maps of entity values, each value carrying the
//! timestamp of the row it came from so the age-based operators can reason
//! about staleness.

use crate::expr::SourceType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One entity value with its source timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopedValue {
    pub value: Value,
    /// `received_at` for data streams, `from_timestamp` for state
    /// instances. Absent for manually injected values.
    pub timestamp: Option<DateTime<Utc>>,
}

impl ScopedValue {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            timestamp: None,
        }
    }

    pub fn at(value: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            timestamp: Some(timestamp),
        }
    }
}

/// UUID-keyed entity values for one evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataScope {
    /// sensor uuid -> key -> value.
    pub sensors: HashMap<String, HashMap<String, ScopedValue>>,
    /// device uuid -> state name -> value.
    pub devices: HashMap<String, HashMap<String, ScopedValue>>,
}

impl DataScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no entity has any value.
    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty() && self.devices.is_empty()
    }

    /// Insert a value for an entity key.
    pub fn insert(
        &mut self,
        source_type: SourceType,
        uuid: impl Into<String>,
        key: impl Into<String>,
        value: ScopedValue,
    ) {
        self.family_mut(source_type)
            .entry(uuid.into())
            .or_default()
            .insert(key.into(), value);
    }

    /// Look up a value for an entity key.
    pub fn get(&self, source_type: SourceType, uuid: &str, key: &str) -> Option<&ScopedValue> {
        self.family(source_type).get(uuid).and_then(|m| m.get(key))
    }

    fn family(&self, source_type: SourceType) -> &HashMap<String, HashMap<String, ScopedValue>> {
        match source_type {
            SourceType::Sensor => &self.sensors,
            SourceType::Device => &self.devices,
        }
    }

    fn family_mut(
        &mut self,
        source_type: SourceType,
    ) -> &mut HashMap<String, HashMap<String, ScopedValue>> {
        match source_type {
            SourceType::Sensor => &mut self.sensors,
            SourceType::Device => &mut self.devices,
        }
    }

    /// Overlay another scope onto this one. Values from `other` win on
    /// conflicts; used when a manual trigger supplies inline data on top
    /// of collected values.
    pub fn merge(&mut self, other: DataScope) {
        for (uuid, values) in other.sensors {
            self.sensors.entry(uuid).or_default().extend(values);
        }
        for (uuid, values) in other.devices {
            self.devices.entry(uuid).or_default().extend(values);
        }
    }

    /// Build a scope from the raw trigger shape
    /// `{"sensorData": [{"UUID": "...", "k": v, ..., "timestamp": t}],
    ///   "deviceData": [...]}`.
    ///
    /// Arrays become UUID-keyed maps; the `timestamp` member, when present,
    /// is stored alongside every value of that entry. Entries without a
    /// `UUID` are skipped.
    pub fn from_raw_json(raw: &Value) -> Self {
        let mut scope = DataScope::new();
        for (member, source_type) in [
            ("sensorData", SourceType::Sensor),
            ("deviceData", SourceType::Device),
        ] {
            let Some(entries) = raw.get(member).and_then(Value::as_array) else {
                continue;
            };
            for entry in entries {
                let Some(uuid) = entry.get("UUID").and_then(Value::as_str) else {
                    continue;
                };
                let timestamp = entry
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<DateTime<Utc>>().ok());
                let Some(object) = entry.as_object() else {
                    continue;
                };
                for (key, value) in object {
                    if key == "UUID" || key == "timestamp" {
                        continue;
                    }
                    scope.insert(
                        source_type,
                        uuid,
                        key.clone(),
                        ScopedValue {
                            value: value.clone(),
                            timestamp,
                        },
                    );
                }
            }
        }
        scope
    }
}
