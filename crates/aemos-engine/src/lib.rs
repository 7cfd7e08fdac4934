//! Event-driven rule engine: worker pool, backpressure, and the schedule
//! manager.
//!
//! The [`Engine`] consumes the single ordered event queue with a fixed set
//! of worker lanes (same-device events share a lane, preserving publish
//! order), gated by the [`BackpressureController`]. The [`ScheduleManager`]
//! drives cron-enabled chains by enqueuing schedule triggers onto the same
//! queue, and reconciles its schedule set against the repository with
//! periodic auto-sync.

pub mod backpressure;
pub mod effects;
pub mod engine;
pub mod scheduler;

pub use backpressure::{Admission, BackpressureController, CircuitState};
pub use effects::ActionEffects;
pub use engine::Engine;
pub use scheduler::{
    CronBackend, CronSchedule, ScheduleEntry, ScheduleManager, StandardCron, SyncSummary,
};
