//! Repository façade over the relational store.
//!
//! The engine sees persistence only through the [`Repository`] trait. A
//! production deployment backs it with a connection pool; the bundled
//! [`MemoryRepository`] is the thread-safe reference backend the test suite
//! runs against, with the same transactional semantics on the two paths
//! that matter: the open-interval transition on device states, and the
//! execution-stat bump on rule chains.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::entities::*;
use crate::error::{Result, StorageError};

/// Request to write a new device state instance.
#[derive(Debug, Clone)]
pub struct NewStateInstance {
    pub device_uuid: String,
    pub state_name: String,
    pub value: String,
    pub initiated_by: String,
    pub initiator_id: Option<i64>,
    pub metadata: Option<Value>,
}

/// Abstract persistence surface consumed by the core.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn sensor(&self, id: i64) -> Result<Option<Sensor>>;
    async fn sensor_by_uuid(&self, uuid: &str) -> Result<Option<Sensor>>;
    async fn device_by_uuid(&self, uuid: &str) -> Result<Option<Device>>;
    async fn update_device_status(&self, device_uuid: &str, status: DeviceStatus) -> Result<()>;

    async fn telemetry_data(&self, id: i64) -> Result<Option<TelemetryData>>;
    async fn insert_data_stream(&self, telemetry_data_id: i64, value: String)
        -> Result<DataStream>;
    /// Latest reading for a named channel on a sensor, joined through
    /// TelemetryData, newest `received_at` first.
    async fn latest_data_stream(
        &self,
        sensor_uuid: &str,
        variable_name: &str,
    ) -> Result<Option<(TelemetryData, DataStream)>>;

    /// Active, unexpired token joined to its sensor.
    async fn active_token(&self, token: &str) -> Result<Option<(DeviceToken, Sensor)>>;
    async fn touch_token(&self, token_id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Latest open interval for a named state on a device.
    async fn latest_open_state_instance(
        &self,
        device_uuid: &str,
        state_name: &str,
    ) -> Result<Option<DeviceStateInstance>>;
    /// All intervals for a named state, newest first.
    async fn state_instances(
        &self,
        device_uuid: &str,
        state_name: &str,
    ) -> Result<Vec<DeviceStateInstance>>;
    /// Atomically close the previous open interval and insert the new one.
    async fn create_state_instance(&self, req: NewStateInstance) -> Result<DeviceStateInstance>;

    async fn rule_chain(&self, id: i64) -> Result<Option<RuleChain>>;
    async fn rule_chain_nodes(&self, rule_chain_id: i64) -> Result<Vec<RuleChainNode>>;
    async fn rule_chains(&self) -> Result<Vec<RuleChain>>;
    async fn schedule_enabled_chains(&self) -> Result<Vec<RuleChain>>;
    /// REST-surface mutation, re-read by the engine via index rebuild and
    /// by the schedule manager via auto-sync.
    async fn update_rule_chain(&self, chain: RuleChain) -> Result<()>;
    /// Atomic stat bump: `execution_count += 1`, `last_executed_at = at`;
    /// on failure additionally `failure_count += 1`, `last_error_at = at`.
    async fn record_execution(&self, rule_chain_id: i64, success: bool, at: DateTime<Utc>)
        -> Result<()>;
}

/// Shared repository handle.
pub type SharedRepository = Arc<dyn Repository>;

/// In-memory reference backend.
#[derive(Default)]
pub struct MemoryRepository {
    next_id: AtomicI64,

    sensors: DashMap<i64, Sensor>,
    sensor_uuid_index: DashMap<String, i64>,
    devices: DashMap<i64, Device>,
    device_uuid_index: DashMap<String, i64>,

    telemetry: DashMap<i64, TelemetryData>,
    /// telemetry_data_id -> readings in insertion (= received_at) order.
    streams: DashMap<i64, Vec<DataStream>>,

    tokens: DashMap<String, DeviceToken>,

    device_states: DashMap<i64, DeviceState>,
    /// (device_id, state_name) -> device_state_id.
    state_name_index: DashMap<(i64, String), i64>,
    /// Guards the open-interval invariant across close+insert.
    instances: Mutex<HashMap<i64, Vec<DeviceStateInstance>>>,

    chains: DashMap<i64, RuleChain>,
    nodes: DashMap<i64, Vec<RuleChainNode>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Default::default()
        }
    }

    fn alloc_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // Seeding helpers for wiring fixtures; the REST surface that owns these
    // writes in production is out of scope here.

    pub fn add_sensor(
        &self,
        uuid: &str,
        name: &str,
        status: SensorStatus,
        organization_id: i64,
    ) -> Sensor {
        let sensor = Sensor {
            id: self.alloc_id(),
            uuid: uuid.to_string(),
            name: name.to_string(),
            status,
            organization_id,
        };
        self.sensor_uuid_index
            .insert(sensor.uuid.clone(), sensor.id);
        self.sensors.insert(sensor.id, sensor.clone());
        sensor
    }

    pub fn add_device(
        &self,
        uuid: &str,
        name: &str,
        status: DeviceStatus,
        organization_id: i64,
    ) -> Device {
        let device = Device {
            id: self.alloc_id(),
            uuid: uuid.to_string(),
            name: name.to_string(),
            status,
            organization_id,
        };
        self.device_uuid_index
            .insert(device.uuid.clone(), device.id);
        self.devices.insert(device.id, device.clone());
        device
    }

    pub fn add_telemetry_data(
        &self,
        sensor_id: i64,
        variable_name: &str,
        datatype: Datatype,
    ) -> TelemetryData {
        let td = TelemetryData {
            id: self.alloc_id(),
            sensor_id,
            variable_name: variable_name.to_string(),
            datatype,
        };
        self.telemetry.insert(td.id, td.clone());
        td
    }

    pub fn add_token(
        &self,
        token: &str,
        sensor_id: i64,
        status: TokenStatus,
        expires_at: Option<DateTime<Utc>>,
    ) -> DeviceToken {
        let row = DeviceToken {
            id: self.alloc_id(),
            token: token.to_string(),
            sensor_id,
            expires_at,
            last_used: None,
            status,
        };
        self.tokens.insert(row.token.clone(), row.clone());
        row
    }

    /// Flip a token's status, as the REST surface does on revocation.
    pub fn set_token_status(&self, token: &str, status: TokenStatus) {
        if let Some(mut entry) = self.tokens.get_mut(token) {
            entry.value_mut().status = status;
        }
    }

    pub fn add_device_state(&self, device_id: i64, state_name: &str) -> DeviceState {
        let state = DeviceState {
            id: self.alloc_id(),
            device_id,
            state_name: state_name.to_string(),
        };
        self.state_name_index
            .insert((device_id, state.state_name.clone()), state.id);
        self.device_states.insert(state.id, state.clone());
        state
    }

    /// Seed a chain and its nodes. Node `id`s and `next_node_id` links are
    /// assigned here so fixtures can declare links by index.
    pub fn add_rule_chain(&self, mut chain: RuleChain, mut nodes: Vec<RuleChainNode>) -> RuleChain {
        if chain.id == 0 {
            chain.id = self.alloc_id();
        }
        for node in nodes.iter_mut() {
            if node.id == 0 {
                node.id = self.alloc_id();
            }
            node.rule_chain_id = chain.id;
        }
        self.nodes.insert(chain.id, nodes);
        self.chains.insert(chain.id, chain.clone());
        chain
    }

    /// Seed an already-open interval at a specific `from_timestamp`.
    /// Used by fixtures exercising the duration operators.
    pub fn seed_state_instance(
        &self,
        device_uuid: &str,
        state_name: &str,
        value: &str,
        from_timestamp: DateTime<Utc>,
    ) -> Result<DeviceStateInstance> {
        let state_id = self.resolve_state_id(device_uuid, state_name)?;
        let mut instances = self.instances.lock();
        let rows = instances.entry(state_id).or_default();
        for row in rows.iter_mut() {
            if row.to_timestamp.is_none() {
                row.to_timestamp = Some(from_timestamp);
            }
        }
        let instance = DeviceStateInstance {
            id: self.alloc_id(),
            device_state_id: state_id,
            value: value.to_string(),
            from_timestamp,
            to_timestamp: None,
            initiated_by: "seed".to_string(),
            initiator_id: None,
            metadata: None,
        };
        rows.push(instance.clone());
        Ok(instance)
    }

    fn resolve_state_id(&self, device_uuid: &str, state_name: &str) -> Result<i64> {
        let device_id = self
            .device_uuid_index
            .get(device_uuid)
            .map(|e| *e.value())
            .ok_or_else(|| StorageError::NotFound(format!("device {device_uuid}")))?;
        self.state_name_index
            .get(&(device_id, state_name.to_string()))
            .map(|e| *e.value())
            .ok_or_else(|| {
                StorageError::NotFound(format!("state {state_name} on device {device_uuid}"))
            })
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn sensor(&self, id: i64) -> Result<Option<Sensor>> {
        Ok(self.sensors.get(&id).map(|e| e.value().clone()))
    }

    async fn sensor_by_uuid(&self, uuid: &str) -> Result<Option<Sensor>> {
        Ok(self
            .sensor_uuid_index
            .get(uuid)
            .and_then(|id| self.sensors.get(id.value()).map(|e| e.value().clone())))
    }

    async fn device_by_uuid(&self, uuid: &str) -> Result<Option<Device>> {
        Ok(self
            .device_uuid_index
            .get(uuid)
            .and_then(|id| self.devices.get(id.value()).map(|e| e.value().clone())))
    }

    async fn update_device_status(&self, device_uuid: &str, status: DeviceStatus) -> Result<()> {
        let id = self
            .device_uuid_index
            .get(device_uuid)
            .map(|e| *e.value())
            .ok_or_else(|| StorageError::NotFound(format!("device {device_uuid}")))?;
        if let Some(mut device) = self.devices.get_mut(&id) {
            device.status = status;
        }
        Ok(())
    }

    async fn telemetry_data(&self, id: i64) -> Result<Option<TelemetryData>> {
        Ok(self.telemetry.get(&id).map(|e| e.value().clone()))
    }

    async fn insert_data_stream(
        &self,
        telemetry_data_id: i64,
        value: String,
    ) -> Result<DataStream> {
        if !self.telemetry.contains_key(&telemetry_data_id) {
            return Err(StorageError::NotFound(format!(
                "telemetry data {telemetry_data_id}"
            )));
        }
        let row = DataStream {
            id: self.alloc_id(),
            telemetry_data_id,
            value,
            received_at: Utc::now(),
        };
        self.streams
            .entry(telemetry_data_id)
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn latest_data_stream(
        &self,
        sensor_uuid: &str,
        variable_name: &str,
    ) -> Result<Option<(TelemetryData, DataStream)>> {
        let Some(sensor_id) = self.sensor_uuid_index.get(sensor_uuid).map(|e| *e.value()) else {
            return Ok(None);
        };
        let channel = self.telemetry.iter().find_map(|entry| {
            let td = entry.value();
            (td.sensor_id == sensor_id && td.variable_name == variable_name).then(|| td.clone())
        });
        let Some(td) = channel else {
            return Ok(None);
        };
        let latest = self.streams.get(&td.id).and_then(|rows| {
            rows.iter()
                .max_by_key(|r| (r.received_at, r.id))
                .cloned()
        });
        Ok(latest.map(|row| (td, row)))
    }

    async fn active_token(&self, token: &str) -> Result<Option<(DeviceToken, Sensor)>> {
        let now = Utc::now();
        let Some(row) = self.tokens.get(token).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        if !row.is_valid_at(now) {
            return Ok(None);
        }
        let sensor = self.sensors.get(&row.sensor_id).map(|e| e.value().clone());
        Ok(sensor.map(|s| (row, s)))
    }

    async fn touch_token(&self, token_id: i64, at: DateTime<Utc>) -> Result<()> {
        for mut entry in self.tokens.iter_mut() {
            if entry.value().id == token_id {
                entry.value_mut().last_used = Some(at);
                return Ok(());
            }
        }
        Err(StorageError::NotFound(format!("token {token_id}")))
    }

    async fn latest_open_state_instance(
        &self,
        device_uuid: &str,
        state_name: &str,
    ) -> Result<Option<DeviceStateInstance>> {
        let state_id = match self.resolve_state_id(device_uuid, state_name) {
            Ok(id) => id,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let instances = self.instances.lock();
        Ok(instances
            .get(&state_id)
            .and_then(|rows| rows.iter().find(|r| r.is_open()).cloned()))
    }

    async fn state_instances(
        &self,
        device_uuid: &str,
        state_name: &str,
    ) -> Result<Vec<DeviceStateInstance>> {
        let state_id = match self.resolve_state_id(device_uuid, state_name) {
            Ok(id) => id,
            Err(StorageError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let instances = self.instances.lock();
        let mut rows = instances.get(&state_id).cloned().unwrap_or_default();
        rows.sort_by(|a, b| b.from_timestamp.cmp(&a.from_timestamp));
        Ok(rows)
    }

    async fn create_state_instance(&self, req: NewStateInstance) -> Result<DeviceStateInstance> {
        let state_id = self.resolve_state_id(&req.device_uuid, &req.state_name)?;
        let now = Utc::now();

        // Close-then-insert under one lock so the invariant (at most one
        // open interval per state) holds for concurrent writers.
        let mut instances = self.instances.lock();
        let rows = instances.entry(state_id).or_default();
        for row in rows.iter_mut() {
            if row.to_timestamp.is_none() {
                row.to_timestamp = Some(now);
            }
        }
        let instance = DeviceStateInstance {
            id: self.alloc_id(),
            device_state_id: state_id,
            value: req.value,
            from_timestamp: now,
            to_timestamp: None,
            initiated_by: req.initiated_by,
            initiator_id: req.initiator_id,
            metadata: req.metadata,
        };
        rows.push(instance.clone());
        Ok(instance)
    }

    async fn rule_chain(&self, id: i64) -> Result<Option<RuleChain>> {
        Ok(self.chains.get(&id).map(|e| e.value().clone()))
    }

    async fn rule_chain_nodes(&self, rule_chain_id: i64) -> Result<Vec<RuleChainNode>> {
        Ok(self
            .nodes
            .get(&rule_chain_id)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }

    async fn rule_chains(&self) -> Result<Vec<RuleChain>> {
        Ok(self.chains.iter().map(|e| e.value().clone()).collect())
    }

    async fn schedule_enabled_chains(&self) -> Result<Vec<RuleChain>> {
        Ok(self
            .chains
            .iter()
            .filter(|e| e.value().schedule_enabled)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn update_rule_chain(&self, chain: RuleChain) -> Result<()> {
        if !self.chains.contains_key(&chain.id) {
            return Err(StorageError::NotFound(format!("rule chain {}", chain.id)));
        }
        self.chains.insert(chain.id, chain);
        Ok(())
    }

    async fn record_execution(
        &self,
        rule_chain_id: i64,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut chain = self
            .chains
            .get_mut(&rule_chain_id)
            .ok_or_else(|| StorageError::NotFound(format!("rule chain {rule_chain_id}")))?;
        let chain = chain.value_mut();
        chain.execution_count += 1;
        chain.last_executed_at = Some(at);
        if !success {
            chain.failure_count += 1;
            chain.last_error_at = Some(at);
        }
        Ok(())
    }
}
