//! Contextually-Guided Retrieval (CGRAG) Engine (spec §4.F).
//!
//! Composes the Embedder and Vector Store into a token-bounded,
//! relevance-ordered context pack. New code — no direct teacher
//! analogue beyond "retrieval as a component" — grounded instead on
//! `context/manager.rs`'s token-budget bookkeeping style for the
//! budget-greedy packing loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::embed::{normalize_text, Embedder};
use crate::vector::VectorStore;

/// One retrievable text chunk plus its metadata and relevance (spec §3
/// "Context Artifact").
#[derive(Debug, Clone, PartialEq)]
pub struct ContextArtifact {
    pub chunk_id: String,
    pub source_ref: String,
    pub text: String,
    pub relevance: f32,
    pub token_count: u32,
}

/// Ordered, budget-bounded retrieval output (spec §3 "Retrieval Result").
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub artifacts: Vec<ContextArtifact>,
    pub total_tokens: u32,
    pub latency: Duration,
    pub diagnostic: Option<String>,
}

impl RetrievalResult {
    pub fn empty(diagnostic: impl Into<String>) -> Self {
        Self {
            artifacts: Vec::new(),
            total_tokens: 0,
            latency: Duration::ZERO,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

/// Approximate token counter shared between packing and budget math, the
/// same 1-token-per-~4-chars heuristic `context/manager.rs` uses for
/// pre-flight sizing.
pub fn estimate_tokens(text: &str) -> u32 {
    ((text.len() as f64 / 4.0).ceil() as u32).max(1)
}

/// Maximum possible Euclidean distance between two unit-length embedding
/// vectors (the antipodal case, `||a - (-a)|| = 2`). Embedders are
/// contracted to emit unit-normalized vectors (spec §4.B), so this is a
/// fixed reference rather than a property of any particular search batch:
/// a chunk's relevance is then stable regardless of what else is retrieved
/// alongside it in a given call.
const MAX_UNIT_L2_DISTANCE: f32 = 2.0;

pub struct CgragEngine {
    embedder: Arc<dyn Embedder>,
    store: Arc<VectorStore>,
    default_min_relevance: f32,
}

impl CgragEngine {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<VectorStore>, default_min_relevance: f32) -> Self {
        Self {
            embedder,
            store,
            default_min_relevance,
        }
    }

    /// Runs the full algorithm from spec §4.F:
    /// 1. normalize + embed
    /// 2. vector search with k tuned from the token budget
    /// 3. filter by minimum relevance
    /// 4. pack greedily by descending relevance, tie-break by chunk id
    ///
    /// Never raises across the component boundary: an unavailable
    /// embedder or empty/unreadable index yields an empty result with a
    /// diagnostic, per spec §4.F and the `RetrievalUnavailable` /
    /// `EmbeddingUnavailable` error-taxonomy rows.
    pub async fn retrieve(&self, query: &str, token_budget: u32, min_relevance: Option<f32>) -> RetrievalResult {
        let start = Instant::now();
        let normalized = normalize_text(query);
        let min_relevance = min_relevance.unwrap_or(self.default_min_relevance);

        if token_budget == 0 {
            return RetrievalResult {
                artifacts: Vec::new(),
                total_tokens: 0,
                latency: start.elapsed(),
                diagnostic: None,
            };
        }

        let embedding = match self.embedder.embed_one(&normalized).await {
            Ok(v) => v,
            Err(e) => return RetrievalResult::empty(format!("embedding unavailable: {e}")),
        };

        if self.store.is_empty() {
            return RetrievalResult {
                artifacts: Vec::new(),
                total_tokens: 0,
                latency: start.elapsed(),
                diagnostic: Some("vector index is empty".to_string()),
            };
        }

        // Larger budget -> larger k: roughly one candidate per ~200 tokens
        // of budget, capped to keep search bounded.
        let k = ((token_budget as usize / 200).max(10)).min(500);
        let hits = match self.store.search(&embedding, k) {
            Ok(h) => h,
            Err(e) => return RetrievalResult::empty(format!("search failed: {e}")),
        };

        let mut candidates: Vec<ContextArtifact> = hits
            .into_iter()
            .filter_map(|hit| {
                let chunk = self.store.get(&hit.chunk_id)?;
                let relevance = (1.0 - hit.distance / MAX_UNIT_L2_DISTANCE).clamp(0.0, 1.0);
                if relevance < min_relevance {
                    return None;
                }
                Some(ContextArtifact {
                    chunk_id: chunk.id,
                    source_ref: chunk.source_ref,
                    relevance,
                    token_count: estimate_tokens(&chunk.text),
                    text: chunk.text,
                })
            })
            .collect();

        // Descending relevance, tie-break by chunk id for determinism.
        candidates.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });

        let mut packed = Vec::new();
        let mut used = 0u32;
        for artifact in candidates {
            if used + artifact.token_count > token_budget {
                continue;
            }
            used += artifact.token_count;
            packed.push(artifact);
        }

        RetrievalResult {
            artifacts: packed,
            total_tokens: used,
            latency: start.elapsed(),
            diagnostic: None,
        }
    }

    /// Deterministic fingerprint over the ordered artifact ids, used by the
    /// Response Cache's context-fingerprint input (spec §3, §4.E).
    pub fn context_fingerprint(result: &RetrievalResult) -> String {
        let joined = result
            .artifacts
            .iter()
            .map(|a| a.chunk_id.as_str())
            .collect::<Vec<_>>()
            .join(",");
        crate::cache::stable_hash(&joined)
    }
}
