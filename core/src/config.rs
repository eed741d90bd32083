//! Control-plane configuration (spec §6 "Configuration (enumerated)").
//!
//! Loading YAML/env and merging CLI flags is out of scope (§1); this is
//! only the in-process type and its defaults. Readers must tolerate
//! missing fields, so every field carries a `serde(default = ...)`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub profile: String,
    pub health_check_interval_ms: u64,
    pub consecutive_failure_threshold: u32,
    pub recovery_success_threshold: u32,
    pub reservation_deadline_ms: u64,
    pub tier_concurrency_caps: TierConcurrencyCaps,
    pub cache_max_entries: usize,
    pub cache_ttl_secs: u64,
    pub cgrag_token_budget_default: u32,
    pub cgrag_min_relevance_default: f32,
    pub moderator_check_frequency_default: u32,
    pub moderator_check_frequency_min: u32,
    pub moderator_check_frequency_max: u32,
    pub max_moderator_interjections_default: u32,
    pub event_bus_subscriber_queue_size: usize,
    pub telemetry_coalesce_hz: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConcurrencyCaps {
    pub fast: usize,
    pub balanced: usize,
    pub powerful: usize,
    pub max_queue_depth: usize,
}

impl Default for TierConcurrencyCaps {
    fn default() -> Self {
        Self {
            fast: 8,
            balanced: 4,
            powerful: 2,
            max_queue_depth: 64,
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            health_check_interval_ms: 1000,
            consecutive_failure_threshold: 3,
            recovery_success_threshold: 2,
            reservation_deadline_ms: 120_000,
            tier_concurrency_caps: TierConcurrencyCaps::default(),
            cache_max_entries: 10_000,
            cache_ttl_secs: 30 * 60,
            cgrag_token_budget_default: 4096,
            cgrag_min_relevance_default: 0.7,
            moderator_check_frequency_default: 2,
            moderator_check_frequency_min: 1,
            moderator_check_frequency_max: 10,
            max_moderator_interjections_default: 3,
            event_bus_subscriber_queue_size: 256,
            telemetry_coalesce_hz: 2.0,
        }
    }
}

impl ControlPlaneConfig {
    /// Load from a TOML document, falling back to defaults for any field
    /// the document omits (serde `default` handles per-field fallback; a
    /// fully absent document still yields `Self::default()`).
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn clamp_moderator_check_frequency(&self, requested: u32) -> Option<u32> {
        if requested < self.moderator_check_frequency_min
            || requested > self.moderator_check_frequency_max
        {
            None
        } else {
            Some(requested)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg = ControlPlaneConfig::from_toml_str("profile = \"custom\"").unwrap();
        assert_eq!(cfg.profile, "custom");
        assert_eq!(cfg.health_check_interval_ms, 1000);
        assert_eq!(cfg.cache_ttl_secs, 1800);
    }

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = ControlPlaneConfig::from_toml_str("").unwrap();
        let default = ControlPlaneConfig::default();
        assert_eq!(cfg.profile, default.profile);
    }

    #[test]
    fn moderator_frequency_clamped_to_bounds() {
        let cfg = ControlPlaneConfig::default();
        assert_eq!(cfg.clamp_moderator_check_frequency(0), None);
        assert_eq!(cfg.clamp_moderator_check_frequency(11), None);
        assert_eq!(cfg.clamp_moderator_check_frequency(5), Some(5));
    }
}
