//! Structured error types for the control plane
//!
//! One variant per row of the error taxonomy: source, recoverability and
//! surfaced form are encoded in the variant shape itself so callers can
//! match instead of re-deriving policy from a string.

use std::time::Duration;
use thiserror::Error;

use crate::model::Tier;

/// Primary error type for control-plane operations.
#[derive(Error, Debug, Clone)]
pub enum SynapseError {
    /// Request failed validation at the coordinator or router boundary.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// No READY model was available under the admission policy.
    #[error("no capacity in tiers {attempted:?}")]
    NoCapacity { attempted: Vec<Tier> },

    /// Transient connection error to a model server; the router may
    /// re-select once.
    #[error("transient model error on {model_id}: {message}")]
    ModelTransient { model_id: String, message: String },

    /// Model-level error (bad params, oversized context, 4xx other than 429).
    #[error("fatal model error on {model_id}: {message}")]
    ModelFatal { model_id: String, message: String },

    /// CGRAG retrieval unavailable; caller proceeds with empty context.
    #[error("retrieval unavailable: {reason}")]
    RetrievalUnavailable { reason: String },

    /// Embedder unavailable; caller proceeds with empty context.
    #[error("embedding unavailable: {reason}")]
    EmbeddingUnavailable { reason: String },

    /// Cache read/write failed; caller bypasses the cache.
    #[error("cache error: {reason}")]
    Cache { reason: String },

    /// Moderator call failed or returned something unparsable; dialogue
    /// continues without an interjection.
    #[error("moderator error: {reason}")]
    Moderator { reason: String },

    /// Operation was cancelled via its cancellation token.
    #[error("cancelled")]
    Cancelled,

    /// Operation exceeded its deadline; treated as cancellation with a
    /// distinct kind so callers can tell the two apart.
    #[error("timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// A documented invariant was violated; always a bug, never retried.
    #[error("internal invariant violated: {message}")]
    InternalInvariant { message: String },

    /// The requested model, session or dialogue id does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },
}

impl SynapseError {
    /// Whether the coordinator may proceed (possibly degraded) rather than
    /// fail the whole query outright.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SynapseError::RetrievalUnavailable { .. }
                | SynapseError::EmbeddingUnavailable { .. }
                | SynapseError::Cache { .. }
                | SynapseError::Moderator { .. }
        )
    }

    /// A short machine-stable tag for event payloads and telemetry, distinct
    /// from the `Display` message (which is for humans/logs).
    pub fn kind(&self) -> &'static str {
        match self {
            SynapseError::Validation { .. } => "validation_error",
            SynapseError::NoCapacity { .. } => "no_capacity",
            SynapseError::ModelTransient { .. } => "model_transient",
            SynapseError::ModelFatal { .. } => "model_fatal",
            SynapseError::RetrievalUnavailable { .. } => "retrieval_unavailable",
            SynapseError::EmbeddingUnavailable { .. } => "embedding_unavailable",
            SynapseError::Cache { .. } => "cache_error",
            SynapseError::Moderator { .. } => "moderator_error",
            SynapseError::Cancelled => "cancelled",
            SynapseError::Timeout { .. } => "timeout",
            SynapseError::InternalInvariant { .. } => "internal_invariant",
            SynapseError::NotFound { .. } => "not_found",
        }
    }
}

/// Convenience alias for core component APIs.
pub type Result<T> = std::result::Result<T, SynapseError>;
