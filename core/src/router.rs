//! Router (spec §4.H) — picks exactly one Model Client per request under
//! admission rules.
//!
//! Grounded on the admission-and-selection shape of `rate_limiter.rs`
//! (per-tier quota tracking) plus the "Fleet never calls Router; Router
//! never calls Coordinator" acyclic rule from spec §9: the Router only
//! reads fleet snapshots and returns values, it never calls back upward.

use std::sync::Arc;
use std::time::Duration;

use crate::complexity::ComplexityScore;
use crate::config::ControlPlaneConfig;
use crate::error::{Result, SynapseError};
use crate::fleet::{FleetManager, ModelSnapshot};
use crate::model::Tier;

/// Per-tier in-flight counters the Router consults before admitting a new
/// request, independent of the Fleet's own per-model utilization (spec
/// §4.H admission policy: "max concurrent per tier, max queue depth").
pub struct AdmissionPolicy {
    caps: parking_lot::Mutex<std::collections::HashMap<Tier, usize>>,
    max_concurrent: std::collections::HashMap<Tier, usize>,
    allow_downgrade: bool,
}

impl AdmissionPolicy {
    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        let mut max_concurrent = std::collections::HashMap::new();
        max_concurrent.insert(Tier::Fast, config.tier_concurrency_caps.fast);
        max_concurrent.insert(Tier::Balanced, config.tier_concurrency_caps.balanced);
        max_concurrent.insert(Tier::Powerful, config.tier_concurrency_caps.powerful);
        Self {
            caps: parking_lot::Mutex::new(std::collections::HashMap::new()),
            max_concurrent,
            allow_downgrade: true,
        }
    }

    fn try_admit(&self, tier: Tier) -> bool {
        let mut caps = self.caps.lock();
        let current = caps.entry(tier).or_insert(0);
        let max = *self.max_concurrent.get(&tier).unwrap_or(&usize::MAX);
        if *current >= max {
            false
        } else {
            *current += 1;
            true
        }
    }

    fn release(&self, tier: Tier) {
        let mut caps = self.caps.lock();
        if let Some(c) = caps.get_mut(&tier) {
            *c = c.saturating_sub(1);
        }
    }
}

/// One successful routing decision: the chosen model plus the tier it was
/// admitted under (which may differ from the recommended tier after a
/// downgrade).
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub model_id: String,
    pub admitted_tier: Tier,
    pub recommended_tier: Tier,
    pub downgraded: bool,
}

/// A routing reservation; the caller must call `release` (via
/// `FleetManager::release` + `AdmissionPolicy::release`, bundled here)
/// on every execution path.
pub struct Reservation {
    pub model_id: String,
    pub tier: Tier,
    pub deadline: Duration,
}

pub struct Router {
    fleet: Arc<FleetManager>,
    admission: AdmissionPolicy,
    reservation_deadline: Duration,
}

impl Router {
    pub fn new(fleet: Arc<FleetManager>, config: &ControlPlaneConfig) -> Self {
        Self {
            fleet,
            admission: AdmissionPolicy::from_config(config),
            reservation_deadline: Duration::from_millis(config.reservation_deadline_ms),
        }
    }

    /// Implements spec §4.H's selection order: tier from override or
    /// complexity recommendation -> lowest-utilization READY model in
    /// tier -> downgrade to an adjacent tier if none -> `NoCapacity`.
    /// Reserves the chosen model before returning.
    pub fn route(
        &self,
        complexity: &ComplexityScore,
        tier_override: Option<Tier>,
    ) -> Result<(RouteDecision, Reservation)> {
        let recommended_tier = tier_override.unwrap_or(complexity.recommended_tier);
        let mut attempted = vec![recommended_tier];

        if let Some(decision) = self.try_tier(recommended_tier, recommended_tier, false) {
            return self.finalize(decision);
        }

        for &downgrade in recommended_tier.downgrade_candidates() {
            attempted.push(downgrade);
            if let Some(decision) = self.try_tier(downgrade, recommended_tier, true) {
                return self.finalize(decision);
            }
        }

        Err(SynapseError::NoCapacity { attempted })
    }

    fn try_tier(&self, tier: Tier, recommended_tier: Tier, downgraded: bool) -> Option<RouteDecision> {
        if !self.admission.try_admit(tier) {
            return None;
        }
        let candidates: Vec<ModelSnapshot> = self.fleet.select(tier);
        let Some(chosen) = candidates.into_iter().next() else {
            self.admission.release(tier);
            return None;
        };
        Some(RouteDecision {
            model_id: chosen.descriptor.id,
            admitted_tier: tier,
            recommended_tier,
            downgraded,
        })
    }

    fn finalize(&self, decision: RouteDecision) -> Result<(RouteDecision, Reservation)> {
        if let Err(e) = self.fleet.reserve(&decision.model_id) {
            self.admission.release(decision.admitted_tier);
            return Err(e);
        }
        let reservation = Reservation {
            model_id: decision.model_id.clone(),
            tier: decision.admitted_tier,
            deadline: self.reservation_deadline,
        };
        Ok((decision, reservation))
    }

    /// Releases both the admission-policy slot and the Fleet reservation;
    /// must be called on every execution path (success, error,
    /// cancellation) per spec §4.H and the testable property in §8.
    pub fn release(&self, reservation: &Reservation) {
        self.fleet.release(&reservation.model_id);
        self.admission.release(reservation.tier);
    }

    /// Releases only the tier's admission-policy slot, without touching any
    /// Fleet reservation. Used when `reselect_once` has already moved the
    /// request's Fleet reservation to a different model id, so the
    /// original `Reservation` can no longer be released via `release`
    /// without double-releasing the wrong model.
    pub fn release_admission(&self, tier: Tier) {
        self.admission.release(tier);
    }

    /// One automatic re-selection to a different instance in the same
    /// tier, at most once, on a model-level error during generation (spec
    /// §4.H failure semantics). Does not retry `NoCapacity`.
    pub fn reselect_once(&self, failed_model_id: &str, tier: Tier) -> Result<(RouteDecision, Reservation)> {
        self.fleet.release(failed_model_id);
        let candidates: Vec<ModelSnapshot> = self
            .fleet
            .select(tier)
            .into_iter()
            .filter(|s| s.descriptor.id != failed_model_id)
            .collect();
        let Some(chosen) = candidates.into_iter().next() else {
            return Err(SynapseError::NoCapacity { attempted: vec![tier] });
        };
        let decision = RouteDecision {
            model_id: chosen.descriptor.id,
            admitted_tier: tier,
            recommended_tier: tier,
            downgraded: false,
        };
        self.finalize(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StubModelClient;
    use crate::complexity::{ComplexityLabel, ContributingSignals};
    use crate::model::{ModelDescriptor, Quantization, RuntimeOverrides};

    fn score(tier: Tier) -> ComplexityScore {
        ComplexityScore {
            score: 1.0,
            label: ComplexityLabel::Simple,
            recommended_tier: tier,
            confidence: 0.9,
            signals: ContributingSignals {
                token_count: 3,
                multi_part_markers: 0,
                comparison_markers: 0,
                reasoning_markers: 0,
            },
        }
    }

    fn descriptor(id: &str, port: u16, tier: Tier) -> ModelDescriptor {
        ModelDescriptor {
            id: id.to_string(),
            display_name: id.to_string(),
            file_path: format!("{id}.gguf"),
            quantization: Quantization::Q4,
            param_count_billions: 7.0,
            tier,
            port,
            enabled: true,
            overrides: RuntimeOverrides::default(),
        }
    }

    #[tokio::test]
    async fn capacity_rejection_when_tier_saturated_and_no_downgrade() {
        let config = ControlPlaneConfig::default();
        let fleet = Arc::new(FleetManager::new(config.clone()));
        let client = Arc::new(StubModelClient::new("p1", "ok"));
        fleet.register(descriptor("p1", 9101, Tier::Powerful), client).unwrap();
        fleet.start("p1").await.unwrap();
        fleet.reserve("p1").unwrap(); // occupy the only POWERFUL model

        let router = Router::new(fleet, &config);
        let result = router.route(&score(Tier::Powerful), None);
        assert!(matches!(result, Err(SynapseError::NoCapacity { .. })));
    }

    #[tokio::test]
    async fn downgrades_fast_to_balanced_when_fast_empty() {
        let config = ControlPlaneConfig::default();
        let fleet = Arc::new(FleetManager::new(config.clone()));
        let client = Arc::new(StubModelClient::new("b1", "ok"));
        fleet.register(descriptor("b1", 9102, Tier::Balanced), client).unwrap();
        fleet.start("b1").await.unwrap();

        let router = Router::new(fleet, &config);
        let (decision, reservation) = router.route(&score(Tier::Fast), None).unwrap();
        assert!(decision.downgraded);
        assert_eq!(decision.admitted_tier, Tier::Balanced);
        router.release(&reservation);
    }

    #[tokio::test]
    async fn never_upgrades_to_powerful_on_downgrade() {
        let config = ControlPlaneConfig::default();
        let fleet = Arc::new(FleetManager::new(config.clone()));
        let client = Arc::new(StubModelClient::new("p1", "ok"));
        fleet.register(descriptor("p1", 9103, Tier::Powerful), client).unwrap();
        fleet.start("p1").await.unwrap();

        let router = Router::new(fleet, &config);
        // FAST and BALANCED both empty; POWERFUL has capacity but must
        // never be silently selected as a "downgrade" target for FAST.
        let result = router.route(&score(Tier::Fast), None);
        assert!(matches!(result, Err(SynapseError::NoCapacity { .. })));
    }

    #[tokio::test]
    async fn reselect_once_moves_the_reservation_to_a_different_same_tier_instance() {
        let config = ControlPlaneConfig::default();
        let fleet = Arc::new(FleetManager::new(config.clone()));
        let client_a = Arc::new(StubModelClient::new("f1", "ok"));
        let client_b = Arc::new(StubModelClient::new("f2", "ok"));
        fleet.register(descriptor("f1", 9104, Tier::Fast), client_a).unwrap();
        fleet.register(descriptor("f2", 9105, Tier::Fast), client_b).unwrap();
        fleet.start("f1").await.unwrap();
        fleet.start("f2").await.unwrap();

        let router = Router::new(fleet, &config);
        let (decision, reservation) = router.route(&score(Tier::Fast), None).unwrap();
        assert_eq!(decision.model_id, "f1");

        let (new_decision, new_reservation) = router.reselect_once("f1", reservation.tier).unwrap();
        assert_eq!(new_decision.model_id, "f2");

        router.release(&new_reservation);
        router.release_admission(reservation.tier);
    }
}
