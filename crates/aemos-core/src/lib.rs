//! Shared kernel of the AEMOS processing core.
//!
//! This crate carries everything the other members agree on: the engine
//! event model, the broadcast bus for subscribers, deadlines, the compact
//! duration grammar, configuration, the error taxonomy, and the Prometheus
//! metrics registry.

pub mod config;
pub mod deadline;
pub mod duration;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod metrics;

pub use config::{
    AemosConfig, BackpressureConfig, EngineConfig, IngressConfig, MetricsConfig, NotifyConfig,
    SchedulerConfig, DEFAULT_COLLECTION_TIMEOUT_MS, DEFAULT_EVENT_DEADLINE_MS,
};
pub use deadline::Deadline;
pub use duration::{parse_duration, parse_duration_ms};
pub use error::{Error, Result};
pub use event::{
    BusEvent, EngineEvent, EventMetadata, NotificationPriority, TelemetryPoint,
};
pub use eventbus::{EventBus, EventBusReceiver, FilteredReceiver, SharedEventBus};
pub use metrics::{EngineMetrics, QueueHealth};
