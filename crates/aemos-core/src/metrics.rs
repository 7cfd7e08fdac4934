//! Prometheus metrics for the rule engine.
//!
//! All families are registered on one registry and rendered in text format
//! for the `/metrics` endpoint. Labelled families go through a cardinality
//! guard: labels must be on the allow-list, and each family holds at most a
//! configured number of label combinations. Samples beyond either limit are
//! dropped, never registered.

use parking_lot::Mutex;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::collections::{HashMap, HashSet};

/// Execution statuses accepted as metric labels.
const STATUS_ALLOW_LIST: &[&str] = &["success", "error", "timeout", "rejected"];

/// Queue health levels exported by `rule_engine_queue_health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum QueueHealth {
    Idle = 0,
    Nominal = 1,
    Busy = 2,
    Degraded = 3,
    Saturated = 4,
}

/// Metrics registry for the engine.
pub struct EngineMetrics {
    registry: Registry,

    pub queue_waiting: IntGauge,
    pub queue_active: IntGauge,
    pub queue_completed: IntCounter,
    pub queue_failed: IntCounter,
    pub queue_delayed: IntGauge,
    pub queue_total_pending: IntGauge,
    pub workers: IntGauge,
    pub queue_health: IntGauge,

    pub backpressure_circuit_state: IntGauge,
    pub backpressure_rejected_total: IntCounter,
    pub backpressure_warning_threshold: IntGauge,
    pub backpressure_critical_threshold: IntGauge,

    execution_total: IntCounterVec,
    execution_duration_seconds: HistogramVec,
    execution_nodes: IntGaugeVec,

    /// Observed label combinations per guarded family.
    series: Mutex<HashMap<&'static str, HashSet<String>>>,
    max_series_per_metric: usize,
}

impl EngineMetrics {
    /// Create and register all families.
    pub fn new(max_series_per_metric: usize) -> Self {
        let registry = Registry::new();

        let queue_waiting = IntGauge::new("rule_engine_queue_waiting", "Events waiting in queue")
            .expect("valid metric opts");
        let queue_active =
            IntGauge::new("rule_engine_queue_active", "Events currently being processed")
                .expect("valid metric opts");
        let queue_completed =
            IntCounter::new("rule_engine_queue_completed", "Events processed successfully")
                .expect("valid metric opts");
        let queue_failed = IntCounter::new("rule_engine_queue_failed", "Events that failed")
            .expect("valid metric opts");
        let queue_delayed =
            IntGauge::new("rule_engine_queue_delayed", "Events delayed for retry")
                .expect("valid metric opts");
        let queue_total_pending = IntGauge::new(
            "rule_engine_queue_total_pending",
            "Waiting plus active events",
        )
        .expect("valid metric opts");
        let workers =
            IntGauge::new("rule_engine_workers", "Worker lanes").expect("valid metric opts");
        let queue_health = IntGauge::new(
            "rule_engine_queue_health",
            "Queue health level (0 idle .. 4 saturated)",
        )
        .expect("valid metric opts");

        let backpressure_circuit_state = IntGauge::new(
            "rule_engine_backpressure_circuit_state",
            "Circuit state (0 closed, 1 half-open, 2 open)",
        )
        .expect("valid metric opts");
        let backpressure_rejected_total = IntCounter::new(
            "rule_engine_backpressure_rejected_total",
            "Events rejected by admission control",
        )
        .expect("valid metric opts");
        let backpressure_warning_threshold = IntGauge::new(
            "rule_engine_backpressure_warning_threshold",
            "Configured warning depth",
        )
        .expect("valid metric opts");
        let backpressure_critical_threshold = IntGauge::new(
            "rule_engine_backpressure_critical_threshold",
            "Configured critical depth",
        )
        .expect("valid metric opts");

        let execution_total = IntCounterVec::new(
            Opts::new("rule_execution_total", "Rule chain executions"),
            &["rule_chain_id", "status"],
        )
        .expect("valid metric opts");
        let execution_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "rule_execution_duration_seconds",
                "Rule chain execution duration",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["rule_chain_id"],
        )
        .expect("valid metric opts");
        let execution_nodes = IntGaugeVec::new(
            Opts::new(
                "rule_execution_nodes_executed",
                "Nodes executed in the last run of a chain",
            ),
            &["rule_chain_id"],
        )
        .expect("valid metric opts");

        for collector in [
            Box::new(queue_waiting.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(queue_active.clone()),
            Box::new(queue_completed.clone()),
            Box::new(queue_failed.clone()),
            Box::new(queue_delayed.clone()),
            Box::new(queue_total_pending.clone()),
            Box::new(workers.clone()),
            Box::new(queue_health.clone()),
            Box::new(backpressure_circuit_state.clone()),
            Box::new(backpressure_rejected_total.clone()),
            Box::new(backpressure_warning_threshold.clone()),
            Box::new(backpressure_critical_threshold.clone()),
            Box::new(execution_total.clone()),
            Box::new(execution_duration_seconds.clone()),
            Box::new(execution_nodes.clone()),
        ] {
            registry.register(collector).expect("fresh registry");
        }

        Self {
            registry,
            queue_waiting,
            queue_active,
            queue_completed,
            queue_failed,
            queue_delayed,
            queue_total_pending,
            workers,
            queue_health,
            backpressure_circuit_state,
            backpressure_rejected_total,
            backpressure_warning_threshold,
            backpressure_critical_threshold,
            execution_total,
            execution_duration_seconds,
            execution_nodes,
            series: Mutex::new(HashMap::new()),
            max_series_per_metric,
        }
    }

    /// Set the exported queue health level.
    pub fn set_queue_health(&self, health: QueueHealth) {
        self.queue_health.set(health as i64);
    }

    /// Record one chain execution. Samples with a status outside the
    /// allow-list, or beyond the series cap, are dropped.
    pub fn observe_execution(
        &self,
        rule_chain_id: i64,
        status: &str,
        duration_secs: f64,
        nodes_executed: usize,
    ) {
        if !STATUS_ALLOW_LIST.contains(&status) {
            tracing::warn!(status, "dropping metric sample with unknown status label");
            return;
        }
        let chain_label = rule_chain_id.to_string();
        if !self.admit_series("rule_execution_total", &format!("{chain_label}/{status}"))
            || !self.admit_series("rule_execution_duration_seconds", &chain_label)
            || !self.admit_series("rule_execution_nodes_executed", &chain_label)
        {
            return;
        }

        self.execution_total
            .with_label_values(&[&chain_label, status])
            .inc();
        self.execution_duration_seconds
            .with_label_values(&[&chain_label])
            .observe(duration_secs);
        self.execution_nodes
            .with_label_values(&[&chain_label])
            .set(nodes_executed as i64);
    }

    fn admit_series(&self, family: &'static str, key: &str) -> bool {
        let mut series = self.series.lock();
        let set = series.entry(family).or_default();
        if set.contains(key) {
            return true;
        }
        if set.len() >= self.max_series_per_metric {
            tracing::warn!(family, key, "metric series cap reached, dropping sample");
            return false;
        }
        set.insert(key.to_string());
        true
    }

    /// Render all families in Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_queue_families() {
        let metrics = EngineMetrics::new(200);
        metrics.queue_waiting.set(3);
        metrics.workers.set(4);
        metrics.set_queue_health(QueueHealth::Nominal);

        let text = metrics.render();
        assert!(text.contains("rule_engine_queue_waiting 3"));
        assert!(text.contains("rule_engine_workers 4"));
        assert!(text.contains("rule_engine_queue_health 1"));
    }

    #[test]
    fn rejects_unknown_status_label() {
        let metrics = EngineMetrics::new(200);
        metrics.observe_execution(1, "weird", 0.1, 2);
        assert!(!metrics.render().contains("weird"));
    }

    #[test]
    fn enforces_series_cap() {
        let metrics = EngineMetrics::new(3);
        for chain_id in 0..10 {
            metrics.observe_execution(chain_id, "success", 0.01, 1);
        }
        let text = metrics.render();
        let series_count = text
            .lines()
            .filter(|l| l.starts_with("rule_execution_total{"))
            .count();
        assert!(series_count <= 3, "got {series_count} series");
    }

    #[test]
    fn records_executions_within_cap() {
        let metrics = EngineMetrics::new(200);
        metrics.observe_execution(7, "success", 0.05, 3);
        metrics.observe_execution(7, "success", 0.07, 3);
        let text = metrics.render();
        assert!(text.contains(r#"rule_execution_total{rule_chain_id="7",status="success"} 2"#));
        assert!(text.contains("rule_execution_nodes_executed"));
    }
}
