//! Rule-engine manager: the worker pool over the ordered event queue.
//!
//! Events enter through [`Engine::submit`] (the router's and scheduler's
//! [`EventSink`]). Admission control runs first; admitted events are hashed
//! by their ordering key onto one of a fixed set of worker lanes, so events
//! from the same device are processed in publish order while the lanes run
//! in parallel. Each worker resolves candidate chains through the index,
//! filters them by execution type, collects inputs, runs the interpreter,
//! and applies action effects, all under the event deadline.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use aemos_core::{
    Deadline, EngineConfig, EngineEvent, EngineMetrics, Error, EventMetadata, QueueHealth, Result,
    SharedEventBus, BusEvent,
};
use aemos_ingress::EventSink;
use aemos_rules::{interpreter, ChainIndex, DataCollector, DataScope, ParsedChain};
use aemos_storage::SharedRepository;

use crate::backpressure::{Admission, BackpressureController};
use crate::effects::ActionEffects;
use crate::scheduler::ScheduleManager;

/// Schedule manager reference, wired after construction because the
/// scheduler needs the engine as its event sink.
type OptionScheduleManager = Arc<RwLock<Option<Arc<ScheduleManager>>>>;

struct QueuedEvent {
    event: EngineEvent,
    metadata: EventMetadata,
    deadline: Deadline,
    probe: bool,
}

/// The rule-engine manager.
pub struct Engine {
    repo: SharedRepository,
    index: Arc<ChainIndex>,
    collector: DataCollector,
    backpressure: BackpressureController,
    effects: ActionEffects,
    bus: SharedEventBus,
    notify: Arc<aemos_notify::NotificationManager>,
    metrics: Arc<EngineMetrics>,
    config: EngineConfig,

    lanes: parking_lot::RwLock<Vec<mpsc::Sender<QueuedEvent>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    waiting: AtomicI64,
    active: AtomicI64,
    delayed: AtomicI64,
    round_robin: AtomicUsize,
    schedule_manager: OptionScheduleManager,
    /// Self-reference for tasks (retry ladder) that outlive a worker call.
    weak_self: Weak<Engine>,
}

impl Engine {
    pub fn new(
        repo: SharedRepository,
        bus: SharedEventBus,
        notify: Arc<aemos_notify::NotificationManager>,
        metrics: Arc<EngineMetrics>,
        config: EngineConfig,
        backpressure: BackpressureController,
    ) -> Arc<Self> {
        let index = Arc::new(ChainIndex::new(Arc::clone(&repo)));
        let collector = DataCollector::new(
            Arc::clone(&repo),
            Duration::from_millis(config.collection_timeout_ms),
        );
        let effects = ActionEffects::new(
            Arc::clone(&repo),
            Arc::clone(&notify),
            Arc::clone(&bus),
        );
        metrics
            .backpressure_warning_threshold
            .set(backpressure.warning_threshold() as i64);
        metrics
            .backpressure_critical_threshold
            .set(backpressure.critical_threshold() as i64);
        Arc::new_cyclic(|weak| Self {
            repo,
            index,
            collector,
            backpressure,
            effects,
            bus,
            notify,
            metrics,
            config,
            lanes: parking_lot::RwLock::new(Vec::new()),
            workers: parking_lot::Mutex::new(Vec::new()),
            waiting: AtomicI64::new(0),
            active: AtomicI64::new(0),
            delayed: AtomicI64::new(0),
            round_robin: AtomicUsize::new(0),
            schedule_manager: Arc::new(RwLock::new(None)),
            weak_self: weak.clone(),
        })
    }

    /// Wire the schedule manager; must be called after construction since
    /// the scheduler holds the engine as its sink.
    pub async fn set_schedule_manager(&self, manager: Arc<ScheduleManager>) {
        *self.schedule_manager.write().await = Some(manager);
    }

    /// The chain index, for REST surfaces that need resolution.
    pub fn index(&self) -> Arc<ChainIndex> {
        Arc::clone(&self.index)
    }

    /// Build the index and spawn the worker lanes.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.lanes.read().is_empty() {
            return Ok(());
        }
        self.index.rebuild().await.map_err(aemos_core::Error::from)?;

        let mut senders = Vec::with_capacity(self.config.worker_count);
        let mut handles = Vec::with_capacity(self.config.worker_count);
        for lane in 0..self.config.worker_count {
            let (tx, rx) = mpsc::channel(self.config.queue_capacity);
            senders.push(tx);
            let engine = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                engine.worker_loop(lane, rx).await;
            }));
        }
        *self.lanes.write() = senders;
        self.workers.lock().extend(handles);
        self.metrics.workers.set(self.config.worker_count as i64);
        tracing::info!(workers = self.config.worker_count, "rule engine started");
        Ok(())
    }

    /// Close the queue and wait for in-flight events to finish.
    pub async fn shutdown(&self) {
        self.lanes.write().clear();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.metrics.workers.set(0);
        tracing::info!("rule engine stopped");
    }

    /// Operator-facing manual trigger for one chain.
    pub async fn trigger_chain(
        &self,
        rule_chain_id: i64,
        organization_id: i64,
        data: Option<Value>,
    ) -> Result<()> {
        self.submit(
            EngineEvent::ManualTrigger {
                rule_chain_id,
                organization_id,
                data,
            },
            EventMetadata::new("manual"),
        )
        .await
    }

    /// Depth the backpressure controller observes.
    pub fn queue_depth(&self) -> usize {
        (self.waiting.load(Ordering::Relaxed) + self.active.load(Ordering::Relaxed)).max(0) as usize
    }

    pub fn backpressure(&self) -> &BackpressureController {
        &self.backpressure
    }

    /// Pick the worker lane for an event. Keyed events hash to a stable
    /// lane; keyless events round-robin.
    fn lane_sender(&self, event: &EngineEvent) -> Option<mpsc::Sender<QueuedEvent>> {
        let lanes = self.lanes.read();
        if lanes.is_empty() {
            return None;
        }
        let index = match event.ordering_key() {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() as usize) % lanes.len()
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % lanes.len(),
        };
        Some(lanes[index].clone())
    }

    fn export_queue_metrics(&self) {
        let waiting = self.waiting.load(Ordering::Relaxed).max(0);
        let active = self.active.load(Ordering::Relaxed).max(0);
        self.metrics.queue_waiting.set(waiting);
        self.metrics.queue_active.set(active);
        self.metrics.queue_delayed.set(self.delayed.load(Ordering::Relaxed).max(0));
        self.metrics.queue_total_pending.set(waiting + active);
        self.metrics
            .backpressure_circuit_state
            .set(self.backpressure.state() as i64);

        let depth = (waiting + active) as usize;
        let health = if depth == 0 {
            QueueHealth::Idle
        } else if depth < self.backpressure.warning_threshold() / 2 {
            QueueHealth::Nominal
        } else if depth < self.backpressure.warning_threshold() {
            QueueHealth::Busy
        } else if depth < self.backpressure.critical_threshold() {
            QueueHealth::Degraded
        } else {
            QueueHealth::Saturated
        };
        self.metrics.set_queue_health(health);
    }

    async fn worker_loop(self: Arc<Self>, lane: usize, mut rx: mpsc::Receiver<QueuedEvent>) {
        tracing::debug!(lane, "worker lane started");
        while let Some(queued) = rx.recv().await {
            self.waiting.fetch_sub(1, Ordering::Relaxed);
            self.active.fetch_add(1, Ordering::Relaxed);
            self.export_queue_metrics();

            let result = self.process_event(queued.event, queued.deadline).await;

            self.active.fetch_sub(1, Ordering::Relaxed);
            match &result {
                Ok(()) => self.metrics.queue_completed.inc(),
                Err(e) => {
                    self.metrics.queue_failed.inc();
                    tracing::error!(lane, error = %e, event_id = %queued.metadata.event_id, "event processing failed");
                }
            }
            if queued.probe {
                let depth = self.queue_depth();
                match &result {
                    Ok(()) => self.backpressure.on_probe_success(depth),
                    Err(_) => self.backpressure.on_probe_failure(),
                }
            }
            self.export_queue_metrics();
        }
        tracing::debug!(lane, "worker lane drained");
    }

    async fn process_event(&self, event: EngineEvent, deadline: Deadline) -> Result<()> {
        // Control events mutate engine state instead of executing chains.
        match &event {
            EngineEvent::RuleChainUpdated { rule_chain_id, .. }
            | EngineEvent::RuleChainDeleted { rule_chain_id, .. } => {
                self.index
                    .invalidate(*rule_chain_id)
                    .await
                    .map_err(aemos_core::Error::from)?;
                if let Some(manager) = self.schedule_manager.read().await.as_ref() {
                    manager.notify_changed();
                }
                return Ok(());
            }
            _ => {}
        }

        let snapshot = self.index.snapshot();
        let schedule_kind = matches!(event, EngineEvent::ScheduleTrigger { .. });
        let mut overlay: Option<Value> = None;
        let mut attempt = 0u32;

        let candidates: Vec<Arc<ParsedChain>> = match &event {
            EngineEvent::Telemetry(point) => {
                snapshot.resolve_sensor(point.organization_id, &point.sensor_uuid)
            }
            EngineEvent::BatchTelemetry {
                organization_id,
                points,
            } => {
                let mut seen = Vec::new();
                let mut chains = Vec::new();
                for point in points {
                    for chain in snapshot.resolve_sensor(*organization_id, &point.sensor_uuid) {
                        if !seen.contains(&chain.chain.id) {
                            seen.push(chain.chain.id);
                            chains.push(chain);
                        }
                    }
                }
                chains
            }
            EngineEvent::DeviceStateChange {
                organization_id,
                device_uuid,
                ..
            } => snapshot.resolve_device(*organization_id, device_uuid),
            EngineEvent::ManualTrigger {
                rule_chain_id,
                organization_id,
                data,
            } => {
                overlay = data.clone();
                self.lookup_chain(&snapshot, *rule_chain_id, *organization_id)
            }
            EngineEvent::ScheduleTrigger {
                rule_chain_id,
                organization_id,
                attempt: a,
            } => {
                attempt = *a;
                self.lookup_chain(&snapshot, *rule_chain_id, *organization_id)
            }
            EngineEvent::RuleChainUpdated { .. } | EngineEvent::RuleChainDeleted { .. } => {
                unreachable!("control events handled above")
            }
        };

        // Dispatch policy: schedule triggers run schedule-capable chains,
        // everything else runs event-capable chains.
        let runnable = candidates.into_iter().filter(|chain| {
            if schedule_kind {
                chain.chain.execution_type.runs_on_schedule()
            } else {
                chain.chain.execution_type.runs_on_events()
            }
        });

        for chain in runnable {
            let success = self.run_chain(&chain, deadline, overlay.as_ref()).await;
            if schedule_kind {
                self.finish_schedule_attempt(&chain, success, attempt).await;
            }
        }
        Ok(())
    }

    fn lookup_chain(
        &self,
        snapshot: &aemos_rules::IndexSnapshot,
        rule_chain_id: i64,
        organization_id: i64,
    ) -> Vec<Arc<ParsedChain>> {
        match snapshot.chain(rule_chain_id) {
            Some(chain) if chain.chain.organization_id == organization_id => vec![chain],
            Some(_) => {
                tracing::warn!(
                    rule_chain_id,
                    organization_id,
                    "trigger for a chain in another organization ignored"
                );
                Vec::new()
            }
            None => {
                tracing::warn!(rule_chain_id, "trigger for unknown chain ignored");
                Vec::new()
            }
        }
    }

    /// Run one chain end to end. Returns whether the execution succeeded.
    async fn run_chain(
        &self,
        chain: &Arc<ParsedChain>,
        deadline: Deadline,
        overlay: Option<&Value>,
    ) -> bool {
        let started = tokio::time::Instant::now();

        let scope = match self.collector.collect(&chain.deps, deadline).await {
            Ok(outcome) => {
                // A collection timeout already degraded to an empty scope.
                let mut scope = outcome.scope;
                if let Some(raw) = overlay {
                    scope.merge(DataScope::from_raw_json(raw));
                }
                scope
            }
            Err(e) => {
                tracing::error!(rule_chain_id = chain.chain.id, error = %e, "data collection failed");
                self.record_outcome(chain, false, "error", started, 0).await;
                return false;
            }
        };

        let mut execution = interpreter::execute(chain, scope, deadline);
        if execution.succeeded() {
            self.effects.apply(chain, &mut execution).await;
        }

        let status = if execution.succeeded() {
            "success"
        } else if execution.error_code.as_deref() == Some("RULE_CHAIN_TIMEOUT") {
            "timeout"
        } else {
            "error"
        };
        let nodes = execution.execution_details.executed_nodes.len();
        self.record_outcome(chain, execution.succeeded(), status, started, nodes)
            .await;

        self.bus.publish_with_source(
            BusEvent::ChainExecuted {
                organization_id: chain.chain.organization_id,
                rule_chain_id: chain.chain.id,
                status: execution.status.clone(),
                filters_passed: execution.summary.filters_passed,
                actions_executed: execution.summary.actions_executed,
                timestamp: Utc::now(),
            },
            "engine",
        );
        match serde_json::to_value(&execution) {
            Ok(summary) => {
                self.notify
                    .enqueue(aemos_notify::Notification::chain_summary(
                        chain.chain.organization_id,
                        chain.chain.id,
                        summary,
                    ))
                    .await;
            }
            Err(e) => {
                tracing::error!(rule_chain_id = chain.chain.id, error = %e, "summary serialization failed");
            }
        }

        execution.succeeded()
    }

    async fn record_outcome(
        &self,
        chain: &Arc<ParsedChain>,
        success: bool,
        status: &str,
        started: tokio::time::Instant,
        nodes_executed: usize,
    ) {
        if let Err(e) = self
            .repo
            .record_execution(chain.chain.id, success, Utc::now())
            .await
        {
            tracing::error!(rule_chain_id = chain.chain.id, error = %e, "stat update failed");
        }
        self.metrics.observe_execution(
            chain.chain.id,
            status,
            started.elapsed().as_secs_f64(),
            nodes_executed,
        );
    }

    /// Schedule-trigger bookkeeping: stats on the schedule entry and the
    /// retry ladder on failure.
    async fn finish_schedule_attempt(&self, chain: &Arc<ParsedChain>, success: bool, attempt: u32) {
        let manager = self.schedule_manager.read().await.clone();
        let Some(manager) = manager else {
            return;
        };
        manager.record_result(chain.chain.id, success).await;
        if success {
            return;
        }

        let Some((max_retries, retry_delay_ms)) = manager.retry_policy(chain.chain.id).await
        else {
            return;
        };
        if attempt >= u32::from(max_retries) {
            tracing::warn!(
                rule_chain_id = chain.chain.id,
                attempt,
                "schedule execution failed past the retry limit"
            );
            return;
        }

        let Some(engine) = self.weak_self.upgrade() else {
            return;
        };
        let event = EngineEvent::ScheduleTrigger {
            rule_chain_id: chain.chain.id,
            organization_id: chain.chain.organization_id,
            attempt: attempt + 1,
        };
        let delay = Duration::from_millis(u64::from(retry_delay_ms));
        self.delayed.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.delayed.fetch_sub(1, Ordering::Relaxed);
            if let Err(e) = engine
                .submit(event, EventMetadata::new("scheduler-retry"))
                .await
            {
                tracing::warn!(error = %e, "schedule retry rejected");
            }
        });
    }
}

#[async_trait]
impl EventSink for Engine {
    async fn submit(&self, event: EngineEvent, metadata: EventMetadata) -> Result<()> {
        let depth = self.queue_depth();
        let admission = self.backpressure.admit(depth);
        self.metrics
            .backpressure_circuit_state
            .set(self.backpressure.state() as i64);

        let probe = match admission {
            Admission::Reject => {
                // Drop semantics: the event is discarded, never retried here.
                self.metrics.backpressure_rejected_total.inc();
                tracing::debug!(
                    event_type = event.type_name(),
                    depth,
                    state = ?self.backpressure.state(),
                    "event rejected by backpressure"
                );
                return Err(Error::BackpressureRejected);
            }
            Admission::Probe => true,
            Admission::Admit => false,
        };

        let deadline = Deadline::after_ms(metadata.deadline_ms);
        let Some(sender) = self.lane_sender(&event) else {
            return Err(Error::Routing("engine not started".to_string()));
        };

        self.waiting.fetch_add(1, Ordering::Relaxed);
        self.export_queue_metrics();
        let queued = QueuedEvent {
            event,
            metadata,
            deadline,
            probe,
        };
        if sender.send(queued).await.is_err() {
            self.waiting.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::Routing("engine queue closed".to_string()));
        }
        Ok(())
    }
}
