//! Query Coordinator (spec §4.K) — the single entry point that wires every
//! other component together for one request.
//!
//! Grounded on `agent/v2/orchestrator/mod.rs`'s top-level
//! `handle_request` dispatcher: validate, consult state, delegate to the
//! right sub-loop, emit events at each step, always release what was
//! reserved. No component here calls back upward into the Coordinator,
//! keeping the acyclic call graph spec §9 requires.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::cache::{fingerprint, FingerprintInput, ResponseCache};
use crate::cgrag::{CgragEngine, ContextArtifact};
use crate::client::ModelClient;
use crate::complexity::ComplexityAssessor;
use crate::config::ControlPlaneConfig;
use crate::dialogue::{CouncilConfig, DialogueEngine, DialogueResult, Reselector};
use crate::error::{Result, SynapseError};
use crate::events::{EventBus, EventKind};
use crate::fleet::FleetManager;
use crate::model::Tier;
use crate::request::{Mode, QueryRequest};
use crate::router::Router;

/// Bridges the Dialogue Engine's `Reselector` seam back to the Fleet for
/// debate/council's directly-reserved pro/con/moderator models: on a
/// model-level failure it reserves a different same-tier instance and
/// records the swap so the caller can release the *final* id instead of
/// the one it started with.
struct DirectReselector<'a> {
    fleet: &'a FleetManager,
    tier: Tier,
    active_ids: parking_lot::Mutex<Vec<String>>,
}

impl<'a> DirectReselector<'a> {
    fn new(fleet: &'a FleetManager, tier: Tier, seed_ids: &[&str]) -> Self {
        Self {
            fleet,
            tier,
            active_ids: parking_lot::Mutex::new(seed_ids.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn final_ids(&self) -> Vec<String> {
        self.active_ids.lock().clone()
    }
}

impl<'a> Reselector for DirectReselector<'a> {
    fn reselect(&self, failed_model_id: &str) -> Option<(String, Arc<dyn ModelClient>)> {
        self.fleet.release(failed_model_id);
        let active = self.active_ids.lock();
        let candidate = self
            .fleet
            .select(self.tier)
            .into_iter()
            .find(|s| s.descriptor.id != failed_model_id && !active.contains(&s.descriptor.id))?;
        drop(active);
        self.fleet.reserve(&candidate.descriptor.id).ok()?;
        let client = self.fleet.client(&candidate.descriptor.id)?;
        let mut active = self.active_ids.lock();
        if let Some(slot) = active.iter_mut().find(|id| id.as_str() == failed_model_id) {
            *slot = candidate.descriptor.id.clone();
        }
        Some((candidate.descriptor.id, client))
    }
}

/// Bridges the Dialogue Engine's `Reselector` seam back to `Router` for
/// standard mode's tier-admitted reservation: on a model-level failure it
/// calls `Router::reselect_once` and records the new model id so the
/// caller releases the replacement's Fleet reservation (and the original
/// admission slot) instead of double-touching the old model.
struct RouterReselector<'a> {
    router: &'a Router,
    fleet: &'a FleetManager,
    tier: Tier,
    final_id: parking_lot::Mutex<Option<String>>,
}

impl<'a> RouterReselector<'a> {
    fn new(router: &'a Router, fleet: &'a FleetManager, tier: Tier) -> Self {
        Self {
            router,
            fleet,
            tier,
            final_id: parking_lot::Mutex::new(None),
        }
    }

    fn final_id(&self) -> Option<String> {
        self.final_id.lock().clone()
    }
}

impl<'a> Reselector for RouterReselector<'a> {
    fn reselect(&self, failed_model_id: &str) -> Option<(String, Arc<dyn ModelClient>)> {
        // `reselect_once` already releases the failed model's Fleet
        // reservation and reserves the replacement; it never touches the
        // Admission-policy tier slot, so that slot still belongs to
        // `failed_model_id`'s original reservation.
        let (decision, _reservation) = self.router.reselect_once(failed_model_id, self.tier).ok()?;
        *self.final_id.lock() = Some(decision.model_id.clone());
        let client = self.fleet.client(&decision.model_id)?;
        Some((decision.model_id, client))
    }
}

/// The full, cacheable outcome of one query (spec §3 "Query Result" /
/// §4.K step 9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub turns: Vec<crate::dialogue::DialogueTurn>,
    pub moderator_interjections: u32,
    pub completed: bool,
    pub post_hoc_analysis: Option<String>,
    pub context_used: Vec<ContextArtifact>,
    pub model_ids: Vec<String>,
    pub cache_hit: bool,
}

impl QueryOutcome {
    fn from_dialogue(result: DialogueResult, context_used: Vec<ContextArtifact>, model_ids: Vec<String>) -> Self {
        Self {
            turns: result.turns,
            moderator_interjections: result.moderator_interjections,
            completed: result.completed,
            post_hoc_analysis: result.post_hoc_analysis,
            context_used,
            model_ids,
            cache_hit: false,
        }
    }
}

pub struct QueryCoordinator {
    fleet: Arc<FleetManager>,
    router: Router,
    cache: Arc<ResponseCache>,
    cgrag: Option<Arc<CgragEngine>>,
    dialogue: DialogueEngine,
    event_bus: EventBus,
    config: ControlPlaneConfig,
}

impl QueryCoordinator {
    pub fn new(
        fleet: Arc<FleetManager>,
        cache: Arc<ResponseCache>,
        cgrag: Option<Arc<CgragEngine>>,
        event_bus: EventBus,
        config: ControlPlaneConfig,
    ) -> Self {
        let router = Router::new(fleet.clone(), &config);
        let dialogue = DialogueEngine::new(event_bus.clone());
        Self {
            fleet,
            router,
            cache,
            cgrag,
            dialogue,
            event_bus,
            config,
        }
    }

    /// Runs one request end to end. Never panics on a model or retrieval
    /// failure; those become `query-failed` events and an `Err` return, with
    /// every reservation released on every path (spec §4.K, §8).
    #[instrument(skip(self, request), fields(mode = ?request.mode))]
    pub async fn execute(
        &self,
        request: QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome> {
        request.validate().map_err(|message| SynapseError::Validation { message })?;
        self.event_bus.publish(
            EventKind::QueryReceived,
            serde_json::json!({"mode": format!("{:?}", request.mode)}),
        );

        let normalized = crate::embed::normalize_text(&request.text);
        let complexity = ComplexityAssessor::assess(&normalized);
        self.event_bus.publish(
            EventKind::ComplexityAssessed,
            serde_json::json!({
                "score": complexity.score,
                "label": format!("{:?}", complexity.label),
                "recommended_tier": complexity.recommended_tier.to_string(),
            }),
        );

        let tier = request.tier_override.unwrap_or(complexity.recommended_tier);

        let (context, context_fingerprint) = if request.use_context {
            match &self.cgrag {
                Some(engine) => {
                    let budget = request
                        .context_token_budget
                        .unwrap_or(self.config.cgrag_token_budget_default);
                    let retrieval = engine.retrieve(&normalized, budget, request.min_relevance).await;
                    self.event_bus.publish(
                        EventKind::RetrievalComplete,
                        serde_json::json!({
                            "artifact_count": retrieval.artifacts.len(),
                            "total_tokens": retrieval.total_tokens,
                            "diagnostic": retrieval.diagnostic,
                        }),
                    );
                    let fp = CgragEngine::context_fingerprint(&retrieval);
                    (retrieval.artifacts, Some(fp))
                }
                None => (Vec::new(), None),
            }
        } else {
            (Vec::new(), None)
        };

        let tier_label = tier.to_string();
        let cache_key = fingerprint(&FingerprintInput {
            normalized_query: &normalized,
            mode: mode_label(request.mode),
            tier: &tier_label,
            context_fingerprint: context_fingerprint.as_deref(),
            temperature_bucket: request.temperature_bucket(),
            max_tokens: request.max_tokens,
        });

        if request.cacheable {
            if let Some(entry) = self.cache.get(&cache_key) {
                self.event_bus
                    .publish(EventKind::CacheHit, serde_json::json!({"fingerprint": cache_key}));
                if let Ok(mut outcome) = serde_json::from_value::<QueryOutcome>(entry.response) {
                    outcome.cache_hit = true;
                    return Ok(outcome);
                }
            }
            self.event_bus
                .publish(EventKind::CacheMiss, serde_json::json!({"fingerprint": cache_key}));
        }

        let result = match request.mode {
            Mode::Auto | Mode::Standard => self.run_standard(&request, tier, &complexity, &context, cancel).await,
            Mode::Debate => self.run_debate(&request, &context, cancel).await,
            Mode::Council => self.run_council(&request, &context, cancel).await,
        };

        match result {
            Ok((dialogue_result, model_ids)) => {
                let outcome = QueryOutcome::from_dialogue(dialogue_result, context, model_ids);
                if request.cacheable {
                    if let Ok(serialized) = serde_json::to_value(&outcome) {
                        self.cache.put(
                            cache_key,
                            serialized,
                            Some(Duration::from_secs(self.config.cache_ttl_secs)),
                            outcome.model_ids.clone(),
                        );
                    }
                }
                self.event_bus.publish(
                    EventKind::QueryComplete,
                    serde_json::json!({"turn_count": outcome.turns.len()}),
                );
                Ok(outcome)
            }
            Err(e) => {
                self.event_bus
                    .publish(EventKind::QueryFailed, serde_json::json!({"error": e.kind()}));
                Err(e)
            }
        }
    }

    async fn run_standard(
        &self,
        request: &QueryRequest,
        tier: crate::model::Tier,
        complexity: &crate::complexity::ComplexityScore,
        context: &[ContextArtifact],
        cancel: &CancellationToken,
    ) -> Result<(DialogueResult, Vec<String>)> {
        let (decision, reservation) = self.router.route(complexity, Some(tier))?;
        self.event_bus.publish(
            EventKind::RouteDecided,
            serde_json::json!({
                "model_id": decision.model_id,
                "admitted_tier": decision.admitted_tier.to_string(),
                "downgraded": decision.downgraded,
            }),
        );

        let client = match self.fleet.client(&decision.model_id) {
            Some(c) => c,
            None => {
                self.router.release(&reservation);
                return Err(SynapseError::NotFound { what: decision.model_id });
            }
        };

        let reselector = RouterReselector::new(&self.router, &self.fleet, reservation.tier);
        let outcome = self
            .dialogue
            .run_standard(
                &decision.model_id,
                client,
                &request.text,
                context,
                request.max_tokens,
                request.temperature,
                Some(&reselector),
                cancel,
            )
            .await;

        let final_id = reselector.final_id();
        match &final_id {
            // Re-selection happened: the Fleet reservation already moved
            // to `final_id` via `reselect_once`, so release that one
            // directly and free only the original Admission-policy slot.
            Some(id) => {
                self.fleet.release(id);
                self.router.release_admission(reservation.tier);
            }
            None => self.router.release(&reservation),
        }
        let model_id = final_id.unwrap_or(decision.model_id);
        if outcome.is_err() {
            self.fleet.record_error(&model_id);
        }
        outcome.map(|r| (r, vec![model_id]))
    }

    async fn run_debate(
        &self,
        request: &QueryRequest,
        context: &[ContextArtifact],
        cancel: &CancellationToken,
    ) -> Result<(DialogueResult, Vec<String>)> {
        let pro_id = request
            .pro_model_id
            .clone()
            .ok_or_else(|| SynapseError::Validation { message: "missing pro_model_id".to_string() })?;
        let con_id = request
            .con_model_id
            .clone()
            .ok_or_else(|| SynapseError::Validation { message: "missing con_model_id".to_string() })?;

        self.fleet.reserve(&pro_id)?;
        if let Err(e) = self.fleet.reserve(&con_id) {
            self.fleet.release(&pro_id);
            return Err(e);
        }
        let pro_client = self.fleet.client(&pro_id).ok_or_else(|| SynapseError::NotFound { what: pro_id.clone() });
        let con_client = self.fleet.client(&con_id).ok_or_else(|| SynapseError::NotFound { what: con_id.clone() });
        let debater_tier = self.fleet.snapshot().into_iter().find(|s| s.descriptor.id == pro_id).map(|s| s.descriptor.tier);

        let reselector =
            debater_tier.map(|tier| DirectReselector::new(&self.fleet, tier, &[pro_id.as_str(), con_id.as_str()]));

        let result = async {
            let pro_client = pro_client?;
            let con_client = con_client?;
            Ok(self
                .dialogue
                .run_debate(
                    &request.text,
                    context,
                    (&pro_id, pro_client),
                    (&con_id, con_client),
                    request.dialogue.max_turns,
                    request.max_tokens,
                    request.temperature,
                    reselector.as_ref().map(|r| r as &dyn Reselector),
                    cancel,
                )
                .await)
        }
        .await;

        let final_ids = reselector.as_ref().map(|r| r.final_ids()).unwrap_or_else(|| vec![pro_id.clone(), con_id.clone()]);
        for id in &final_ids {
            self.fleet.release(id);
        }
        result.map(|r| (r, final_ids))
    }

    async fn run_council(
        &self,
        request: &QueryRequest,
        context: &[ContextArtifact],
        cancel: &CancellationToken,
    ) -> Result<(DialogueResult, Vec<String>)> {
        let pro_id = request
            .pro_model_id
            .clone()
            .ok_or_else(|| SynapseError::Validation { message: "missing pro_model_id".to_string() })?;
        let con_id = request
            .con_model_id
            .clone()
            .ok_or_else(|| SynapseError::Validation { message: "missing con_model_id".to_string() })?;
        let moderator_id = request
            .dialogue
            .moderator_model_id
            .clone()
            .ok_or_else(|| SynapseError::Validation { message: "missing moderator_model_id".to_string() })?;

        self.fleet.reserve(&pro_id)?;
        if let Err(e) = self.fleet.reserve(&con_id) {
            self.fleet.release(&pro_id);
            return Err(e);
        }
        if let Err(e) = self.fleet.reserve(&moderator_id) {
            self.fleet.release(&pro_id);
            self.fleet.release(&con_id);
            return Err(e);
        }

        let clients = (|| -> Result<_> {
            let pro_client = self.fleet.client(&pro_id).ok_or_else(|| SynapseError::NotFound { what: pro_id.clone() })?;
            let con_client = self.fleet.client(&con_id).ok_or_else(|| SynapseError::NotFound { what: con_id.clone() })?;
            let moderator_client = self
                .fleet
                .client(&moderator_id)
                .ok_or_else(|| SynapseError::NotFound { what: moderator_id.clone() })?;
            Ok((pro_client, con_client, moderator_client))
        })();

        let debater_tier = self.fleet.snapshot().into_iter().find(|s| s.descriptor.id == pro_id).map(|s| s.descriptor.tier);
        let reselector =
            debater_tier.map(|tier| DirectReselector::new(&self.fleet, tier, &[pro_id.as_str(), con_id.as_str()]));

        let result = match clients {
            Ok((pro_client, con_client, moderator_client)) => {
                let council_cfg = CouncilConfig {
                    moderator_check_frequency: request.dialogue.moderator_check_frequency,
                    max_interjections: request.dialogue.max_moderator_interjections,
                };
                Ok(self
                    .dialogue
                    .run_council(
                        &request.text,
                        context,
                        (&pro_id, pro_client),
                        (&con_id, con_client),
                        (&moderator_id, moderator_client),
                        request.dialogue.max_turns,
                        request.max_tokens,
                        request.temperature,
                        &council_cfg,
                        reselector.as_ref().map(|r| r as &dyn Reselector),
                        cancel,
                    )
                    .await)
            }
            Err(e) => Err(e),
        };

        let final_debater_ids = reselector.as_ref().map(|r| r.final_ids()).unwrap_or_else(|| vec![pro_id.clone(), con_id.clone()]);
        for id in &final_debater_ids {
            self.fleet.release(id);
        }
        self.fleet.release(&moderator_id);
        let mut model_ids = final_debater_ids;
        model_ids.push(moderator_id);
        result.map(|r| (r, model_ids))
    }
}

fn mode_label(mode: Mode) -> &'static str {
    match mode {
        Mode::Auto => "auto",
        Mode::Standard => "standard",
        Mode::Debate => "debate",
        Mode::Council => "council",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StubModelClient;
    use crate::embed::DeterministicStubEmbedder;
    use crate::model::{ModelDescriptor, Quantization, RuntimeOverrides, Tier};
    use crate::vector::VectorStore;

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

    fn coordinator_with_fast_model() -> QueryCoordinator {
        let config = ControlPlaneConfig::default();
        let fleet = Arc::new(FleetManager::new(config.clone()));
        let cache = Arc::new(ResponseCache::new(config.cache_max_entries, Duration::from_secs(config.cache_ttl_secs)));
        let store = Arc::new(VectorStore::new(crate::embed::EMBEDDING_DIM));
        let cgrag = Arc::new(CgragEngine::new(Arc::new(DeterministicStubEmbedder), store, 0.0));
        let event_bus = EventBus::new(config.event_bus_subscriber_queue_size, config.telemetry_coalesce_hz);
        QueryCoordinator::new(fleet, cache, Some(cgrag), event_bus, config)
    }

    #[tokio::test]
    async fn simple_query_routes_to_fast_tier() {
        let coordinator = coordinator_with_fast_model();
        let client = Arc::new(StubModelClient::new("f1", "a short answer"));
        coordinator.fleet.register(descriptor("f1", 9201, Tier::Fast), client).unwrap();
        coordinator.fleet.start("f1").await.unwrap();

        let request = QueryRequest {
            text: "What is 2+2?".to_string(),
            ..QueryRequest::default()
        };
        let cancel = CancellationToken::new();
        let outcome = coordinator.execute(request, &cancel).await.unwrap();
        assert_eq!(outcome.model_ids, vec!["f1".to_string()]);
        assert!(!outcome.cache_hit);
        assert_eq!(outcome.turns.len(), 1);
    }

    #[tokio::test]
    async fn second_identical_query_is_served_from_cache() {
        let coordinator = coordinator_with_fast_model();
        let client = Arc::new(StubModelClient::new("f1", "a short answer"));
        coordinator.fleet.register(descriptor("f1", 9202, Tier::Fast), client).unwrap();
        coordinator.fleet.start("f1").await.unwrap();

        let request = QueryRequest {
            text: "What is 2+2?".to_string(),
            ..QueryRequest::default()
        };
        let cancel = CancellationToken::new();
        let first = coordinator.execute(request.clone(), &cancel).await.unwrap();
        assert!(!first.cache_hit);
        let second = coordinator.execute(request, &cancel).await.unwrap();
        assert!(second.cache_hit);
    }

    #[tokio::test]
    async fn no_capacity_releases_nothing_and_fails_query() {
        let coordinator = coordinator_with_fast_model();
        // No FAST model registered at all.
        let request = QueryRequest {
            text: "What is 2+2?".to_string(),
            ..QueryRequest::default()
        };
        let cancel = CancellationToken::new();
        let result = coordinator.execute(request, &cancel).await;
        assert!(matches!(result, Err(SynapseError::NoCapacity { .. })));
    }

    #[tokio::test]
    async fn context_assisted_query_packs_only_the_matching_chunks() {
        use crate::vector::Chunk;

        let config = ControlPlaneConfig::default();
        let fleet = Arc::new(FleetManager::new(config.clone()));
        let cache = Arc::new(ResponseCache::new(config.cache_max_entries, Duration::from_secs(config.cache_ttl_secs)));
        let store = VectorStore::new(crate::embed::EMBEDDING_DIM);
        let embedder = DeterministicStubEmbedder;
        // Two chunks share the query's exact wording (distance 0 under the
        // stub embedder); the rest are unrelated filler.
        let texts = [
            ("a", "rust ownership rules"),
            ("b", "rust ownership rules"),
            ("c", "a recipe for sourdough bread"),
            ("d", "the history of steam engines"),
            ("e", "notes on migratory bird patterns"),
        ];
        let chunks: Vec<Chunk> = texts
            .iter()
            .map(|(id, text)| Chunk {
                id: id.to_string(),
                source_ref: format!("doc/{id}"),
                text: text.to_string(),
                embedding: futures::executor::block_on(embedder.embed_one(text)).unwrap(),
            })
            .collect();
        store.append(chunks).unwrap();
        let cgrag = Arc::new(CgragEngine::new(Arc::new(DeterministicStubEmbedder), Arc::new(store), 0.99));
        let event_bus = EventBus::new(config.event_bus_subscriber_queue_size, config.telemetry_coalesce_hz);
        let coordinator = QueryCoordinator::new(fleet, cache, Some(cgrag), event_bus, config);

        let client = Arc::new(StubModelClient::new("f1", "answer"));
        coordinator.fleet.register(descriptor("f1", 9210, Tier::Fast), client).unwrap();
        coordinator.fleet.start("f1").await.unwrap();

        let request = QueryRequest {
            text: "rust ownership rules".to_string(),
            use_context: true,
            context_token_budget: Some(100),
            ..QueryRequest::default()
        };
        let cancel = CancellationToken::new();
        let outcome = coordinator.execute(request, &cancel).await.unwrap();
        let ids: std::collections::HashSet<_> = outcome.context_used.iter().map(|a| a.chunk_id.clone()).collect();
        assert_eq!(ids, ["a".to_string(), "b".to_string()].into_iter().collect());
    }

    #[tokio::test]
    async fn debate_query_reserves_and_releases_both_debaters() {
        let config = ControlPlaneConfig::default();
        let fleet = Arc::new(FleetManager::new(config.clone()));
        let cache = Arc::new(ResponseCache::new(config.cache_max_entries, Duration::from_secs(config.cache_ttl_secs)));
        let event_bus = EventBus::new(config.event_bus_subscriber_queue_size, config.telemetry_coalesce_hz);
        let coordinator = QueryCoordinator::new(fleet, cache, None, event_bus, config);

        let pro = Arc::new(StubModelClient::new("pro1", "pro argument"));
        let con = Arc::new(StubModelClient::new("con1", "con argument"));
        coordinator.fleet.register(descriptor("pro1", 9211, Tier::Balanced), pro).unwrap();
        coordinator.fleet.register(descriptor("con1", 9212, Tier::Balanced), con).unwrap();
        coordinator.fleet.start("pro1").await.unwrap();
        coordinator.fleet.start("con1").await.unwrap();

        let request = QueryRequest {
            text: "should we adopt this proposal?".to_string(),
            mode: Mode::Debate,
            pro_model_id: Some("pro1".to_string()),
            con_model_id: Some("con1".to_string()),
            dialogue: crate::request::DialogueParams {
                max_turns: 2,
                ..crate::request::DialogueParams::default()
            },
            ..QueryRequest::default()
        };
        let cancel = CancellationToken::new();
        let outcome = coordinator.execute(request, &cancel).await.unwrap();
        assert_eq!(outcome.turns.len(), 2);
        assert_eq!(outcome.model_ids, vec!["pro1".to_string(), "con1".to_string()]);
        // Both reservations were released: utilization back to zero.
        let snap = coordinator.fleet.snapshot();
        assert!(snap.iter().all(|s| s.utilization == 0));
    }

    struct AlwaysFailingModel {
        id: String,
    }

    #[async_trait::async_trait]
    impl ModelClient for AlwaysFailingModel {
        fn model_id(&self) -> &str {
            &self.id
        }

        async fn health(&self) -> crate::client::HealthReport {
            crate::client::HealthReport {
                healthy: false,
                latency_ms: 0.0,
                tokens_per_second: 0.0,
                vram_gb: 0.0,
            }
        }

        async fn generate(
            &self,
            _params: crate::client::GenerateParams,
        ) -> Result<(crate::client::TokenStream, crate::client::GenerationHandle)> {
            Err(SynapseError::ModelFatal {
                model_id: self.id.clone(),
                message: "stub failure".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn standard_query_reselects_to_a_different_fast_tier_model_on_failure() {
        let coordinator = coordinator_with_fast_model();
        let failing = Arc::new(AlwaysFailingModel { id: "f1".to_string() });
        let healthy = Arc::new(StubModelClient::new("f2", "recovered answer"));
        coordinator.fleet.register(descriptor("f1", 9220, Tier::Fast), failing).unwrap();
        coordinator.fleet.register(descriptor("f2", 9221, Tier::Fast), healthy).unwrap();
        coordinator.fleet.start("f1").await.unwrap();
        coordinator.fleet.start("f2").await.unwrap();

        let request = QueryRequest {
            text: "What is 2+2?".to_string(),
            ..QueryRequest::default()
        };
        let cancel = CancellationToken::new();
        let outcome = coordinator.execute(request, &cancel).await.unwrap();
        assert_eq!(outcome.model_ids, vec!["f2".to_string()]);
        assert_eq!(outcome.turns[0].content, "recovered answer");
        // Both tiers' bookkeeping settled back to zero: no leaked
        // reservation and no leaked admission slot from the swap.
        let snap = coordinator.fleet.snapshot();
        assert!(snap.iter().all(|s| s.utilization == 0));
    }

    #[tokio::test]
    async fn debate_query_reselects_a_failed_debater_to_a_same_tier_replacement() {
        let config = ControlPlaneConfig::default();
        let fleet = Arc::new(FleetManager::new(config.clone()));
        let cache = Arc::new(ResponseCache::new(config.cache_max_entries, Duration::from_secs(config.cache_ttl_secs)));
        let event_bus = EventBus::new(config.event_bus_subscriber_queue_size, config.telemetry_coalesce_hz);
        let coordinator = QueryCoordinator::new(fleet, cache, None, event_bus, config);

        let pro = Arc::new(AlwaysFailingModel { id: "pro1".to_string() });
        let pro_backup = Arc::new(StubModelClient::new("pro2", "pro argument"));
        let con = Arc::new(StubModelClient::new("con1", "con argument"));
        coordinator.fleet.register(descriptor("pro1", 9222, Tier::Balanced), pro).unwrap();
        coordinator.fleet.register(descriptor("pro2", 9223, Tier::Balanced), pro_backup).unwrap();
        coordinator.fleet.register(descriptor("con1", 9224, Tier::Balanced), con).unwrap();
        coordinator.fleet.start("pro1").await.unwrap();
        coordinator.fleet.start("pro2").await.unwrap();
        coordinator.fleet.start("con1").await.unwrap();

        let request = QueryRequest {
            text: "should we adopt this proposal?".to_string(),
            mode: Mode::Debate,
            pro_model_id: Some("pro1".to_string()),
            con_model_id: Some("con1".to_string()),
            dialogue: crate::request::DialogueParams {
                max_turns: 2,
                ..crate::request::DialogueParams::default()
            },
            ..QueryRequest::default()
        };
        let cancel = CancellationToken::new();
        let outcome = coordinator.execute(request, &cancel).await.unwrap();
        assert_eq!(outcome.model_ids, vec!["pro2".to_string(), "con1".to_string()]);
        let speakers: Vec<&str> = outcome.turns.iter().map(|t| t.speaker_id.as_str()).collect();
        assert_eq!(speakers, vec!["pro2", "con1"]);
        let snap = coordinator.fleet.snapshot();
        assert!(snap.iter().all(|s| s.utilization == 0));
    }
}
