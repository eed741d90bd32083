//! Model Runtime State (spec §3) and its bounded rolling histories.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Bound on every rolling metric deque (spec §3: "bounded deques of length
/// ~20").
pub const HISTORY_LEN: usize = 20;

/// Lifecycle state of one model server (spec §4.D state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeStateKind {
    Offline,
    Starting,
    Ready,
    Processing,
    Degraded,
    Stopping,
}

impl RuntimeStateKind {
    /// A model is routable only if state in {READY, PROCESSING}; caller
    /// additionally checks the consecutive-failure threshold.
    pub fn is_routable_state(self) -> bool {
        matches!(self, RuntimeStateKind::Ready | RuntimeStateKind::Processing)
    }
}

/// A fixed-capacity FIFO deque; pushing past `HISTORY_LEN` drops the oldest
/// entry. Used for every rolling metric series so all series share one
/// invariant: equal length at every observation point (spec §4.D, §8).
#[derive(Debug, Clone, Default)]
pub struct BoundedHistory<T> {
    inner: VecDeque<T>,
}

impl<T> BoundedHistory<T> {
    pub fn new() -> Self {
        Self {
            inner: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    pub fn push(&mut self, value: T) {
        if self.inner.len() == HISTORY_LEN {
            self.inner.pop_front();
        }
        self.inner.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.inner.iter()
    }

    pub fn as_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.inner.iter().cloned().collect()
    }
}

/// Runtime state for one model (spec §3 "Model Runtime State").
#[derive(Debug, Clone)]
pub struct ModelRuntimeState {
    pub state: RuntimeStateKind,
    pub last_check: Option<Instant>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub tokens_per_second: BoundedHistory<f64>,
    pub vram_gb: BoundedHistory<f64>,
    pub health_latency_ms: BoundedHistory<f64>,
    pub total_requests: u64,
    pub total_errors: u64,
    pub start_time: Option<Instant>,
    pub utilization: u32,
    /// When the current reservation (if any) was taken; used by the Fleet
    /// Manager to auto-release past the Router's reservation deadline.
    pub reserved_at: Option<Instant>,
}

impl Default for ModelRuntimeState {
    fn default() -> Self {
        Self {
            state: RuntimeStateKind::Offline,
            last_check: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            tokens_per_second: BoundedHistory::new(),
            vram_gb: BoundedHistory::new(),
            health_latency_ms: BoundedHistory::new(),
            total_requests: 0,
            total_errors: 0,
            start_time: None,
            utilization: 0,
            reserved_at: None,
        }
    }
}

impl ModelRuntimeState {
    /// Appends one observation to every rolling series at once, appending
    /// zeros to unhealthy probes so the series stay equal-length (spec
    /// §4.D: "a visualization/contract requirement").
    pub fn record_health_probe(&mut self, healthy: bool, latency_ms: f64, tps: f64, vram_gb: f64) {
        self.last_check = Some(Instant::now());
        if healthy {
            self.health_latency_ms.push(latency_ms);
            self.tokens_per_second.push(tps);
            self.vram_gb.push(vram_gb);
        } else {
            self.health_latency_ms.push(0.0);
            self.tokens_per_second.push(0.0);
            self.vram_gb.push(0.0);
        }
    }

    pub fn is_routable(&self, failure_threshold: u32) -> bool {
        self.state.is_routable_state() && self.consecutive_failures < failure_threshold
    }

    pub fn deadline_exceeded(&self, reserved_at: Instant, deadline: Duration) -> bool {
        reserved_at.elapsed() > deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_history_caps_at_len() {
        let mut h = BoundedHistory::new();
        for i in 0..(HISTORY_LEN + 5) {
            h.push(i as f64);
        }
        assert_eq!(h.len(), HISTORY_LEN);
        assert_eq!(h.as_vec().first(), Some(&5.0));
    }

    #[test]
    fn unhealthy_probe_pads_all_series_with_zero() {
        let mut state = ModelRuntimeState::default();
        state.record_health_probe(true, 10.0, 5.0, 2.0);
        state.record_health_probe(false, 999.0, 999.0, 999.0);
        assert_eq!(state.health_latency_ms.len(), state.tokens_per_second.len());
        assert_eq!(state.tokens_per_second.len(), state.vram_gb.len());
        assert_eq!(state.health_latency_ms.as_vec(), vec![10.0, 0.0]);
    }

    #[test]
    fn routable_only_in_ready_or_processing_below_threshold() {
        let mut state = ModelRuntimeState::default();
        state.state = RuntimeStateKind::Ready;
        assert!(state.is_routable(3));
        state.consecutive_failures = 3;
        assert!(!state.is_routable(3));
        state.consecutive_failures = 0;
        state.state = RuntimeStateKind::Degraded;
        assert!(!state.is_routable(3));
    }
}
