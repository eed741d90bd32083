//! Event Bus (spec §4.J) — single in-process fan-out of Events to many
//! subscribers with per-subscriber backpressure.
//!
//! Grounded on `agent/contract/session.rs`'s `subscribe_output() ->
//! broadcast::Receiver` pattern, generalized from one shared broadcast ring
//! to an explicit per-subscriber table: a plain `tokio::sync::broadcast`
//! channel drops the same way for every subscriber, but spec §4.J requires
//! each subscriber to drop independently ("the bus drops the oldest entry
//! for that subscriber"), so each subscriber gets its own bounded queue,
//! the way `agent/types/events.rs` keeps explicit per-worker identifiers
//! rather than one shared channel.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Closed vocabulary of event kinds (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    QueryReceived,
    ComplexityAssessed,
    RouteDecided,
    RetrievalComplete,
    ModelStateChange,
    DialogueTurn,
    ModeratorInterjection,
    QueryComplete,
    QueryFailed,
    CacheHit,
    CacheMiss,
    HealthCheck,
    PerformanceAlert,
}

impl EventKind {
    /// High-frequency per-model telemetry (spec §4.J): coalesced to at most
    /// `telemetry_coalesce_hz` per model. Every other kind is a lifecycle
    /// event and is never coalesced, even under load.
    fn is_telemetry(self) -> bool {
        matches!(self, EventKind::HealthCheck | EventKind::PerformanceAlert)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// The "lagged by N" marker emitted on drain when a subscriber's queue
/// overflowed (spec §4.J, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaggedFrame {
    pub kind: &'static str,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Event(Event),
    Lagged { kind: String, count: u64 },
}

struct SubscriberState {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    lagged_count: AtomicU64,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

/// A closable, bounded receiver for one subscriber.
pub struct Subscription {
    id: u64,
    state: Arc<SubscriberState>,
    bus: Arc<EventBusInner>,
}

impl Subscription {
    /// Awaits and returns the next frame for this subscriber, preserving
    /// strict sequence order and surfacing a lag marker first if frames
    /// were dropped since the last receive.
    pub async fn recv(&self) -> Option<Frame> {
        loop {
            if self.state.closed.load(Ordering::SeqCst) {
                return None;
            }
            let lagged = self.state.lagged_count.swap(0, Ordering::SeqCst);
            if lagged > 0 {
                return Some(Frame::Lagged {
                    kind: "lagged".to_string(),
                    count: lagged,
                });
            }
            {
                let mut queue = self.state.queue.lock();
                if let Some(event) = queue.pop_front() {
                    return Some(Frame::Event(event));
                }
            }
            if self.state.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.state.notify.notified().await;
        }
    }

    /// Drains its queue and releases resources deterministically; no
    /// events are emitted after close (spec §4.J cancellation contract).
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.queue.lock().clear();
        self.state.notify.notify_waiters();
        self.bus.subscribers.lock().remove(&self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

struct EventBusInner {
    seq: AtomicU64,
    subscribers: Mutex<HashMap<u64, Arc<SubscriberState>>>,
    next_id: AtomicU64,
    default_queue_size: usize,
    /// `<= 0.0` disables coalescing entirely.
    telemetry_coalesce_hz: f32,
    telemetry_last_emit: Mutex<HashMap<(EventKind, Option<String>), Instant>>,
}

/// Single in-process fan-out handle, passed by reference into components
/// per spec §9 ("prefer a single Event Bus handle ... over scattered
/// 'emit' globals").
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    /// `telemetry_coalesce_hz` caps `HealthCheck`/`PerformanceAlert` events
    /// to at most that many per model per second (spec §4.J); `<= 0.0`
    /// disables coalescing. Lifecycle event kinds are never coalesced.
    pub fn new(default_queue_size: usize, telemetry_coalesce_hz: f32) -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                seq: AtomicU64::new(0),
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                default_queue_size,
                telemetry_coalesce_hz,
                telemetry_last_emit: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers a subscriber with a bounded queue. The returned
    /// `Subscription` is the owner's handle to it; the bus itself holds
    /// only a weak-equivalent entry (removed on `close`/`drop`).
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(self.inner.default_queue_size)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(SubscriberState {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            lagged_count: AtomicU64::new(0),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        self.inner.subscribers.lock().insert(id, state.clone());
        Subscription {
            id,
            state,
            bus: self.inner.clone(),
        }
    }

    /// Publishes to every live subscriber, lock-free on the hot path per
    /// subscriber (each subscriber's own mutex, no global lock held across
    /// the fan-out). Bus-global sequence numbers are strictly monotonic
    /// across delivered events. Returns `None` without assigning a
    /// sequence number if this telemetry event was coalesced away.
    pub fn publish(&self, kind: EventKind, payload: serde_json::Value) -> Option<u64> {
        if self.should_coalesce(kind, &payload) {
            return None;
        }
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            kind,
            seq,
            ts: Utc::now(),
            payload,
        };
        let subscribers = self.inner.subscribers.lock();
        for state in subscribers.values() {
            if state.closed.load(Ordering::SeqCst) {
                continue;
            }
            let mut queue = state.queue.lock();
            if queue.len() >= state.capacity {
                queue.pop_front();
                state.lagged_count.fetch_add(1, Ordering::SeqCst);
            }
            queue.push_back(event.clone());
            drop(queue);
            state.notify.notify_one();
        }
        Some(seq)
    }

    /// Per-model-per-kind rate limit for telemetry event kinds (spec
    /// §4.J). Lifecycle kinds always pass through unconditionally.
    fn should_coalesce(&self, kind: EventKind, payload: &serde_json::Value) -> bool {
        if !kind.is_telemetry() || self.inner.telemetry_coalesce_hz <= 0.0 {
            return false;
        }
        let min_interval = Duration::from_secs_f32(1.0 / self.inner.telemetry_coalesce_hz);
        let model_id = payload.get("model_id").and_then(|v| v.as_str()).map(str::to_string);
        let key = (kind, model_id);
        let now = Instant::now();
        let mut last_emit = self.inner.telemetry_last_emit.lock();
        match last_emit.get(&key) {
            Some(&prev) if now.duration_since(prev) < min_interval => true,
            _ => {
                last_emit.insert(key, now);
                false
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}
