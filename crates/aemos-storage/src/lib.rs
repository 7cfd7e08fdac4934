//! Repository façade and entity model for the AEMOS core.
//!
//! The relational persistence layer itself is an external collaborator;
//! this crate defines the rows the engine reads and writes, the
//! [`Repository`] trait it does so through, and an in-memory reference
//! backend with the same transactional guarantees.

pub mod entities;
pub mod error;
pub mod repository;

pub use entities::{
    DataStream, Datatype, Device, DeviceState, DeviceStateInstance, DeviceStatus, DeviceToken,
    ExecutionType, NodeType, RuleChain, RuleChainNode, Sensor, SensorStatus, TelemetryData,
    TokenStatus,
};
pub use error::{Result, StorageError};
pub use repository::{MemoryRepository, NewStateInstance, Repository, SharedRepository};
