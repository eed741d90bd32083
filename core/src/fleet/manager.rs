//! Fleet Manager (spec §4.D) — the authoritative registry of Model
//! Descriptors and their Runtime State, plus the health-check loop.
//!
//! Grounded on three teacher pieces: the atomic load/rewrite pattern of
//! `config/store.rs`, the periodic `loop { tick().await; sleep(...).await }`
//! shape of `scheduler/daemon.rs`, and the per-key `parking_lot::Mutex`
//! single-writer discipline of `rate_limiter.rs`.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::client::ModelClient;
use crate::config::ControlPlaneConfig;
use crate::error::{Result, SynapseError};
use crate::events::{EventBus, EventKind};
use crate::fleet::state::{ModelRuntimeState, RuntimeStateKind};
use crate::model::{ModelDescriptor, ModelRegistry, Tier};

struct FleetEntry {
    descriptor: ModelDescriptor,
    state: Mutex<ModelRuntimeState>,
    client: Arc<dyn ModelClient>,
}

/// A coherent, point-in-time view of one model (spec §4.D `snapshot()`).
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    pub descriptor: ModelDescriptor,
    pub state: RuntimeStateKind,
    pub consecutive_failures: u32,
    pub utilization: u32,
    pub recent_latency_ms: Option<f64>,
}

/// The authoritative registry of models and their runtime state.
pub struct FleetManager {
    entries: RwLock<HashMap<String, FleetEntry>>,
    config: ControlPlaneConfig,
    registry_path: Option<PathBuf>,
}

impl FleetManager {
    pub fn new(config: ControlPlaneConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            registry_path: None,
        }
    }

    pub fn with_registry_path(mut self, path: impl AsRef<Path>) -> Self {
        self.registry_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Admin-plane addition of a new model. Idempotent on id.
    pub fn register(&self, descriptor: ModelDescriptor, client: Arc<dyn ModelClient>) -> Result<()> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.values().find(|e| {
            e.descriptor.enabled && descriptor.enabled && e.descriptor.port == descriptor.port
                && e.descriptor.id != descriptor.id
        }) {
            return Err(SynapseError::Validation {
                message: format!(
                    "port {} already used by enabled model {}",
                    descriptor.port, existing.descriptor.id
                ),
            });
        }
        entries.insert(
            descriptor.id.clone(),
            FleetEntry {
                descriptor,
                state: Mutex::new(ModelRuntimeState::default()),
                client,
            },
        );
        Ok(())
    }

    /// Admin-plane removal; idempotent (removing an absent id is a no-op).
    pub fn unregister(&self, id: &str) {
        self.entries.write().remove(id);
    }

    /// Idempotent lifecycle transition OFFLINE -> STARTING -> READY. Only
    /// transitions to READY after a successful health check.
    pub async fn start(&self, id: &str) -> Result<()> {
        let client = {
            let entries = self.entries.read();
            let entry = entries
                .get(id)
                .ok_or_else(|| SynapseError::NotFound { what: id.to_string() })?;
            {
                let mut state = entry.state.lock();
                if matches!(state.state, RuntimeStateKind::Ready | RuntimeStateKind::Processing) {
                    return Ok(()); // idempotent
                }
                state.state = RuntimeStateKind::Starting;
            }
            entry.client.clone()
        };

        let report = client.health().await;
        let entries = self.entries.read();
        let entry = entries
            .get(id)
            .ok_or_else(|| SynapseError::NotFound { what: id.to_string() })?;
        let mut state = entry.state.lock();
        if report.healthy {
            state.state = RuntimeStateKind::Ready;
            state.start_time = Some(Instant::now());
            state.consecutive_failures = 0;
            state.record_health_probe(true, report.latency_ms, report.tokens_per_second, report.vram_gb);
            Ok(())
        } else {
            state.state = RuntimeStateKind::Offline;
            Err(SynapseError::ModelFatal {
                model_id: id.to_string(),
                message: "start health check failed".to_string(),
            })
        }
    }

    /// Idempotent stop: READY/DEGRADED/PROCESSING -> STOPPING -> OFFLINE.
    pub fn stop(&self, id: &str) -> Result<()> {
        let entries = self.entries.read();
        let entry = entries
            .get(id)
            .ok_or_else(|| SynapseError::NotFound { what: id.to_string() })?;
        let mut state = entry.state.lock();
        state.state = RuntimeStateKind::Stopping;
        state.state = RuntimeStateKind::Offline;
        state.utilization = 0;
        state.reserved_at = None;
        Ok(())
    }

    pub async fn restart(&self, id: &str) -> Result<()> {
        self.stop(id)?;
        self.start(id).await
    }

    /// A coherent point-in-time view across all models; never yields a
    /// partially-updated deque because each entry's lock is held only for
    /// the duration of the read.
    pub fn snapshot(&self) -> Vec<ModelSnapshot> {
        let entries = self.entries.read();
        entries
            .values()
            .map(|e| {
                let state = e.state.lock();
                ModelSnapshot {
                    descriptor: e.descriptor.clone(),
                    state: state.state,
                    consecutive_failures: state.consecutive_failures,
                    utilization: state.utilization,
                    recent_latency_ms: state.health_latency_ms.iter().last().copied(),
                }
            })
            .collect()
    }

    /// Candidate ordering within a tier: lowest utilization first, tie-break
    /// lowest recent latency, tie-break stable id. Does not reserve.
    pub fn select(&self, tier: Tier) -> Vec<ModelSnapshot> {
        let mut candidates: Vec<ModelSnapshot> = self
            .snapshot()
            .into_iter()
            .filter(|s| {
                s.descriptor.enabled
                    && s.descriptor.tier == tier
                    && s.state.is_routable_state()
                    && s.consecutive_failures < self.config.consecutive_failure_threshold
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.utilization
                .cmp(&b.utilization)
                .then_with(|| {
                    a.recent_latency_ms
                        .unwrap_or(f64::MAX)
                        .partial_cmp(&b.recent_latency_ms.unwrap_or(f64::MAX))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.descriptor.id.cmp(&b.descriptor.id))
        });
        candidates
    }

    /// Marks PROCESSING and increments utilization. The caller (Router)
    /// must eventually `release`; the health loop auto-releases past the
    /// reservation deadline.
    pub fn reserve(&self, id: &str) -> Result<()> {
        let entries = self.entries.read();
        let entry = entries
            .get(id)
            .ok_or_else(|| SynapseError::NotFound { what: id.to_string() })?;
        let mut state = entry.state.lock();
        if !state.is_routable(self.config.consecutive_failure_threshold) {
            return Err(SynapseError::ModelFatal {
                model_id: id.to_string(),
                message: "model not routable at reserve time".to_string(),
            });
        }
        state.state = RuntimeStateKind::Processing;
        state.utilization += 1;
        state.reserved_at = Some(Instant::now());
        state.total_requests += 1;
        Ok(())
    }

    /// Releases a reservation on any execution path: success, error or
    /// cancellation.
    pub fn release(&self, id: &str) {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(id) {
            let mut state = entry.state.lock();
            state.utilization = state.utilization.saturating_sub(1);
            state.reserved_at = None;
            if state.utilization == 0 && state.state == RuntimeStateKind::Processing {
                state.state = RuntimeStateKind::Ready;
            }
        }
    }

    /// The registered Model Client for one model id, used by callers that
    /// need to drive generation directly (e.g. the Dialogue Engine) rather
    /// than through the Fleet's own health-probe path.
    pub fn client(&self, id: &str) -> Option<Arc<dyn ModelClient>> {
        self.entries.read().get(id).map(|e| e.client.clone())
    }

    pub fn record_error(&self, id: &str) {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(id) {
            let mut state = entry.state.lock();
            state.total_errors += 1;
        }
    }

    /// Current rolling histories for one model.
    pub fn metrics(&self, id: &str) -> Option<(Vec<f64>, Vec<f64>, Vec<f64>)> {
        let entries = self.entries.read();
        entries.get(id).map(|e| {
            let state = e.state.lock();
            (
                state.tokens_per_second.as_vec(),
                state.vram_gb.as_vec(),
                state.health_latency_ms.as_vec(),
            )
        })
    }

    /// One health-check pass across all registered models. Consecutive
    /// failures crossing the threshold transition a model to DEGRADED;
    /// DEGRADED requires `recovery_success_threshold` consecutive
    /// successes to return to READY. Also auto-releases reservations past
    /// their deadline.
    ///
    /// Returns the ids whose state actually changed, so the caller can
    /// emit exactly one `model-state-change` event per transition.
    pub async fn run_health_pass(&self) -> Vec<(String, RuntimeStateKind)> {
        let snapshot: Vec<(String, Arc<dyn ModelClient>)> = {
            let entries = self.entries.read();
            entries
                .iter()
                .map(|(id, e)| (id.clone(), e.client.clone()))
                .collect()
        };

        let mut changes = Vec::new();
        for (id, client) in snapshot {
            let report = client.health().await;
            let entries = self.entries.read();
            let Some(entry) = entries.get(&id) else { continue };
            let mut state = entry.state.lock();

            // Auto-release reservations that outlived their deadline.
            if let Some(reserved_at) = state.reserved_at {
                if state.deadline_exceeded(
                    reserved_at,
                    Duration::from_millis(self.config.reservation_deadline_ms),
                ) {
                    warn!(model_id = %id, "reservation deadline exceeded, auto-releasing");
                    state.utilization = state.utilization.saturating_sub(1);
                    state.reserved_at = None;
                }
            }

            state.record_health_probe(
                report.healthy,
                report.latency_ms,
                report.tokens_per_second,
                report.vram_gb,
            );

            let before = state.state;
            if report.healthy {
                state.consecutive_failures = 0;
                state.consecutive_successes += 1;
                if before == RuntimeStateKind::Degraded
                    && state.consecutive_successes >= self.config.recovery_success_threshold
                {
                    state.state = RuntimeStateKind::Ready;
                    info!(model_id = %id, "model recovered to READY");
                }
            } else {
                state.consecutive_successes = 0;
                state.consecutive_failures += 1;
                if before != RuntimeStateKind::Degraded
                    && state.consecutive_failures >= self.config.consecutive_failure_threshold
                    && before != RuntimeStateKind::Offline
                {
                    state.state = RuntimeStateKind::Degraded;
                    warn!(model_id = %id, "model transitioned to DEGRADED");
                }
            }

            if state.state != before {
                changes.push((id.clone(), state.state));
            }
        }
        changes
    }

    /// Spawns the background health-check scheduler. Returns a handle the
    /// caller can abort; independent of request tasks per spec §5.
    /// Spawns the periodic health-check loop, publishing a
    /// `ModelStateChange` event on `event_bus` for each DEGRADED/READY
    /// transition `run_health_pass` reports (spec §8 scenario 5: "a
    /// model-state-change event is emitted exactly once" per transition).
    pub fn spawn_health_loop(self: &Arc<Self>, event_bus: EventBus) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let interval = Duration::from_millis(self.config.health_check_interval_ms);
        tokio::spawn(async move {
            loop {
                let changes = this.run_health_pass().await;
                for (id, state) in changes {
                    event_bus.publish(
                        EventKind::ModelStateChange,
                        serde_json::json!({"model_id": id, "state": format!("{:?}", state)}),
                    );
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Rewrites the persisted registry document atomically: write-new,
    /// rename, following `config/store.rs`'s load/save discipline.
    pub fn persist_registry(&self) -> std::io::Result<()> {
        let Some(path) = &self.registry_path else {
            return Ok(());
        };
        let entries = self.entries.read();
        let registry = ModelRegistry {
            models: entries.values().map(|e| e.descriptor.clone()).collect(),
            reserved_port_range: None,
        };
        let content = toml::to_string_pretty(&registry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn load_registry_from(path: impl AsRef<Path>) -> std::io::Result<ModelRegistry> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}
