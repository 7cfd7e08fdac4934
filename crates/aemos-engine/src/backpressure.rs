//! Backpressure circuit protecting the work queue.
//!
//! The controller observes queue depth (waiting + active) and gates
//! admission through a three-state circuit:
//!
//! - `CLOSED` admits everything until depth reaches the critical threshold.
//! - `OPEN` rejects everything until the cooldown passes or depth falls
//!   back to the warning threshold.
//! - `HALF_OPEN` admits one probe per probe interval; a successful probe
//!   with depth at or below warning closes the circuit, a failed probe or
//!   critical depth reopens it.
//!
//! The circuit is monotone under load: while depth is at or above critical
//! the state is never `CLOSED`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use aemos_core::BackpressureConfig;

/// Circuit state. The numeric values are exported on
/// `rule_engine_backpressure_circuit_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

/// Admission decision for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admit normally.
    Admit,
    /// Admit as the half-open probe; the caller must report the outcome.
    Probe,
    /// Reject with `BACKPRESSURE_REJECTED`.
    Reject,
}

struct Inner {
    state: CircuitState,
    entered_at: Instant,
    last_probe: Option<Instant>,
}

/// Three-state admission controller.
pub struct BackpressureController {
    config: BackpressureConfig,
    inner: Mutex<Inner>,
    rejected: AtomicU64,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                entered_at: Instant::now(),
                last_probe: None,
            }),
            rejected: AtomicU64::new(0),
        }
    }

    /// Decide admission for one event at the given queue depth.
    pub fn admit(&self, depth: usize) -> Admission {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                if depth >= self.config.critical_threshold {
                    Self::transition(&mut inner, CircuitState::Open, depth);
                    self.count_rejection();
                    Admission::Reject
                } else {
                    Admission::Admit
                }
            }
            CircuitState::Open => {
                let cooled =
                    inner.entered_at.elapsed() >= Duration::from_millis(self.config.cooldown_ms);
                if depth <= self.config.warning_threshold || cooled {
                    Self::transition(&mut inner, CircuitState::HalfOpen, depth);
                    self.half_open_admit(&mut inner, depth)
                } else {
                    self.count_rejection();
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen => {
                if depth >= self.config.critical_threshold {
                    Self::transition(&mut inner, CircuitState::Open, depth);
                    self.count_rejection();
                    Admission::Reject
                } else {
                    self.half_open_admit(&mut inner, depth)
                }
            }
        }
    }

    fn half_open_admit(&self, inner: &mut Inner, depth: usize) -> Admission {
        if depth >= self.config.critical_threshold {
            Self::transition(inner, CircuitState::Open, depth);
            self.count_rejection();
            return Admission::Reject;
        }
        let probe_due = inner.last_probe.map_or(true, |at| {
            at.elapsed() >= Duration::from_millis(self.config.probe_interval_ms)
        });
        if probe_due {
            inner.last_probe = Some(Instant::now());
            Admission::Probe
        } else {
            self.count_rejection();
            Admission::Reject
        }
    }

    /// Report a successful probe. Closes the circuit when depth has
    /// recovered to the warning threshold.
    pub fn on_probe_success(&self, depth: usize) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && depth <= self.config.warning_threshold {
            Self::transition(&mut inner, CircuitState::Closed, depth);
        }
    }

    /// Report a failed or timed-out probe. Reopens the circuit.
    pub fn on_probe_failure(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            Self::transition(&mut inner, CircuitState::Open, 0);
        }
    }

    fn transition(inner: &mut Inner, next: CircuitState, depth: usize) {
        if inner.state != next {
            tracing::info!(
                from = ?inner.state,
                to = ?next,
                depth,
                "backpressure circuit transition"
            );
            inner.state = next;
            inner.entered_at = Instant::now();
            if next == CircuitState::HalfOpen {
                inner.last_probe = None;
            }
        }
    }

    fn count_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// How long the circuit has been in its current state.
    pub fn state_age(&self) -> Duration {
        self.inner.lock().entered_at.elapsed()
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn warning_threshold(&self) -> usize {
        self.config.warning_threshold
    }

    pub fn critical_threshold(&self) -> usize {
        self.config.critical_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackpressureConfig {
        BackpressureConfig {
            warning_threshold: 10,
            critical_threshold: 50,
            cooldown_ms: 30_000,
            probe_interval_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn closed_admits_below_critical() {
        let controller = BackpressureController::new(config());
        assert_eq!(controller.admit(0), Admission::Admit);
        assert_eq!(controller.admit(49), Admission::Admit);
        assert_eq!(controller.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn critical_depth_opens_the_circuit() {
        let controller = BackpressureController::new(config());
        assert_eq!(controller.admit(50), Admission::Reject);
        assert_eq!(controller.state(), CircuitState::Open);
        assert_eq!(controller.rejected_count(), 1);

        // Still saturated: keeps rejecting.
        assert_eq!(controller.admit(60), Admission::Reject);
        assert_eq!(controller.rejected_count(), 2);
    }

    #[tokio::test]
    async fn never_closed_while_depth_is_critical() {
        let controller = BackpressureController::new(config());
        for depth in [50, 55, 50, 100, 51] {
            let _ = controller.admit(depth);
            assert_ne!(controller.state(), CircuitState::Closed, "depth {depth}");
        }
    }

    #[tokio::test]
    async fn drained_queue_moves_to_half_open_probe() {
        let controller = BackpressureController::new(config());
        assert_eq!(controller.admit(50), Admission::Reject);

        // Depth back at warning: one probe is admitted, the next rejected.
        assert_eq!(controller.admit(5), Admission::Probe);
        assert_eq!(controller.state(), CircuitState::HalfOpen);
        assert_eq!(controller.admit(5), Admission::Reject);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_moves_to_half_open() {
        let controller = BackpressureController::new(config());
        assert_eq!(controller.admit(50), Admission::Reject);
        assert_eq!(controller.admit(40), Admission::Reject);

        tokio::time::advance(Duration::from_millis(30_001)).await;
        assert_eq!(controller.admit(40), Admission::Probe);
        assert_eq!(controller.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn probe_success_closes_when_drained() {
        let controller = BackpressureController::new(config());
        controller.admit(50);
        assert_eq!(controller.admit(5), Admission::Probe);

        controller.on_probe_success(5);
        assert_eq!(controller.state(), CircuitState::Closed);
        assert_eq!(controller.admit(5), Admission::Admit);
    }

    #[tokio::test]
    async fn probe_success_with_deep_queue_stays_half_open() {
        let controller = BackpressureController::new(config());
        controller.admit(50);
        assert_eq!(controller.admit(20), Admission::Probe);

        controller.on_probe_success(20);
        assert_eq!(controller.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn probe_failure_reopens() {
        let controller = BackpressureController::new(config());
        controller.admit(50);
        assert_eq!(controller.admit(5), Admission::Probe);

        controller.on_probe_failure();
        assert_eq!(controller.state(), CircuitState::Open);
    }
}
