//! Embedder (spec §4.B) — deterministic text -> fixed-length vector.
//!
//! Grounded on `memory/store.rs`'s `fastembed::TextEmbedding` usage
//! (BGE-Small-EN-v1.5, 384 dims), behind a trait so tests can substitute a
//! deterministic stub without loading model weights.

use async_trait::async_trait;
use unicode_normalization::UnicodeNormalization;

use crate::error::{Result, SynapseError};

pub const EMBEDDING_DIM: usize = 384;

/// Unicode-NFC, whitespace-collapsed normalization applied before both
/// embedding and vector-store comparison, so identical input always
/// produces identical vectors (spec §4.B contract).
pub fn normalize_text(input: &str) -> String {
    let nfc: String = input.nfc().collect();
    nfc.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds a batch, preserving input order (spec §4.B contract).
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        out.pop()
            .ok_or_else(|| SynapseError::EmbeddingUnavailable {
                reason: "embedder returned no vector".to_string(),
            })
    }
}

/// `fastembed`-backed embedder (default, real model weights).
pub struct FastEmbedder {
    model: parking_lot::Mutex<fastembed::TextEmbedding>,
}

impl FastEmbedder {
    pub fn new() -> anyhow::Result<Self> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("no cache directory available"))?
            .join("synapse")
            .join("models");
        std::fs::create_dir_all(&cache_dir)?;
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed::EmbeddingModel::BGESmallENV15)
                .with_cache_dir(cache_dir),
        )?;
        Ok(Self {
            model: parking_lot::Mutex::new(model),
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let normalized: Vec<String> = texts.iter().map(|t| normalize_text(t)).collect();
        let model = &self.model;
        tokio::task::block_in_place(|| {
            let mut model = model.lock();
            model
                .embed(normalized, None)
                .map_err(|e| SynapseError::EmbeddingUnavailable {
                    reason: e.to_string(),
                })
        })
    }
}

/// Deterministic hash-based embedder for tests and CGRAG-less dry runs: no
/// model weights, but still deterministic for identical input (spec §4.B
/// contract) and fixed-length.
pub struct DeterministicStubEmbedder;

#[async_trait]
impl Embedder for DeterministicStubEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let normalized = normalize_text(t);
                let mut vec = vec![0.0f32; EMBEDDING_DIM];
                for (i, byte) in normalized.bytes().enumerate() {
                    vec[i % EMBEDDING_DIM] += byte as f32 / 255.0;
                }
                let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for v in vec.iter_mut() {
                        *v /= norm;
                    }
                }
                vec
            })
            .collect())
    }
}
