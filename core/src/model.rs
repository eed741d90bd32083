//! Model Descriptor, quantization and tier types (§3 Data Model).

use serde::{Deserialize, Deserializer, Serialize};
use std::cmp::Ordering;

/// Quality/latency band a model belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Fast,
    Balanced,
    Powerful,
    Unknown,
}

impl Tier {
    /// Tiers adjacent to `self` for router downgrade, nearest first.
    /// Downgrade is allowed FAST<->BALANCED; POWERFUL never silently
    /// downgrades or upgrades into, per spec §4.H.
    pub fn downgrade_candidates(self) -> &'static [Tier] {
        match self {
            Tier::Fast => &[Tier::Balanced],
            Tier::Balanced => &[Tier::Fast],
            Tier::Powerful => &[],
            Tier::Unknown => &[],
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Fast => write!(f, "FAST"),
            Tier::Balanced => write!(f, "BALANCED"),
            Tier::Powerful => write!(f, "POWERFUL"),
            Tier::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Compression level, ordered from most-compressed to least.
///
/// Accepted on boundaries either as the enum's own name or as a canonical
/// tag string (`q4_k_m`); readers must accept both, per spec §3's
/// invariant. Internally everything normalizes to this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Quantization {
    Q2,
    Q3,
    Q4,
    Q5,
    Q6,
    Q8,
    F16,
}

impl Quantization {
    const TAGS: &'static [(&'static str, Quantization)] = &[
        ("q2_k", Quantization::Q2),
        ("q3_k_m", Quantization::Q3),
        ("q4_k_m", Quantization::Q4),
        ("q5_k_m", Quantization::Q5),
        ("q6_k", Quantization::Q6),
        ("q8_0", Quantization::Q8),
        ("f16", Quantization::F16),
    ];

    pub fn canonical_tag(self) -> &'static str {
        Self::TAGS
            .iter()
            .find(|(_, q)| *q == self)
            .map(|(tag, _)| *tag)
            .unwrap_or("q4_k_m")
    }

    fn from_tag(tag: &str) -> Option<Quantization> {
        let lower = tag.to_lowercase();
        Self::TAGS
            .iter()
            .find(|(t, _)| *t == lower)
            .map(|(_, q)| *q)
    }

    fn from_enum_name(name: &str) -> Option<Quantization> {
        match name.to_uppercase().as_str() {
            "Q2" => Some(Quantization::Q2),
            "Q3" => Some(Quantization::Q3),
            "Q4" => Some(Quantization::Q4),
            "Q5" => Some(Quantization::Q5),
            "Q6" => Some(Quantization::Q6),
            "Q8" => Some(Quantization::Q8),
            "F16" => Some(Quantization::F16),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for Quantization {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Quantization::from_enum_name(&raw)
            .or_else(|| Quantization::from_tag(&raw))
            .ok_or_else(|| serde::de::Error::custom(format!("unknown quantization: {raw}")))
    }
}

/// Per-model runtime overrides an admin may set (spec §3, §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeOverrides {
    #[serde(default, alias = "gpuLayers")]
    pub gpu_layers: Option<u32>,
    #[serde(default, alias = "contextWindow")]
    pub context_window: Option<u32>,
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default, alias = "batchSize")]
    pub batch_size: Option<u32>,
    #[serde(default, alias = "thinkingMode")]
    pub thinking_mode: Option<bool>,
}

/// Static identity and declared capacity of one model file (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub file_path: String,
    pub quantization: Quantization,
    pub param_count_billions: f64,
    pub tier: Tier,
    pub port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub overrides: RuntimeOverrides,
}

fn default_true() -> bool {
    true
}

impl ModelDescriptor {
    pub fn context_window(&self) -> u32 {
        self.overrides.context_window.unwrap_or(4096)
    }
}

/// Ordered list of descriptors plus the reserved port range, the persisted
/// "model registry document" of spec §6.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelRegistry {
    pub models: Vec<ModelDescriptor>,
    #[serde(default)]
    pub reserved_port_range: Option<(u16, u16)>,
}

impl ModelRegistry {
    /// Validates the "port unique across enabled models" invariant.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for m in self.models.iter().filter(|m| m.enabled) {
            if !seen.insert(m.port) {
                return Err(format!("duplicate port {} across enabled models", m.port));
            }
        }
        Ok(())
    }
}

impl Ord for Tier {
    fn cmp(&self, other: &Self) -> Ordering {
        fn rank(t: &Tier) -> u8 {
            match t {
                Tier::Unknown => 0,
                Tier::Fast => 1,
                Tier::Balanced => 2,
                Tier::Powerful => 3,
            }
        }
        rank(self).cmp(&rank(other))
    }
}
impl PartialOrd for Tier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantization_accepts_enum_name_or_tag() {
        let from_tag: Quantization = serde_json::from_str("\"q4_k_m\"").unwrap();
        let from_name: Quantization = serde_json::from_str("\"Q4\"").unwrap();
        assert_eq!(from_tag, Quantization::Q4);
        assert_eq!(from_name, Quantization::Q4);
    }

    #[test]
    fn quantization_ordered_smallest_first() {
        assert!(Quantization::Q2 < Quantization::Q4);
        assert!(Quantization::Q4 < Quantization::F16);
    }

    #[test]
    fn registry_rejects_duplicate_enabled_ports() {
        let mut reg = ModelRegistry::default();
        let base = ModelDescriptor {
            id: "a".into(),
            display_name: "A".into(),
            file_path: "a.gguf".into(),
            quantization: Quantization::Q4,
            param_count_billions: 7.0,
            tier: Tier::Fast,
            port: 8001,
            enabled: true,
            overrides: RuntimeOverrides::default(),
        };
        let mut dup = base.clone();
        dup.id = "b".into();
        reg.models.push(base);
        reg.models.push(dup);
        assert!(reg.validate().is_err());
    }

    #[test]
    fn registry_allows_duplicate_port_when_disabled() {
        let mut reg = ModelRegistry::default();
        let base = ModelDescriptor {
            id: "a".into(),
            display_name: "A".into(),
            file_path: "a.gguf".into(),
            quantization: Quantization::Q4,
            param_count_billions: 7.0,
            tier: Tier::Fast,
            port: 8001,
            enabled: true,
            overrides: RuntimeOverrides::default(),
        };
        let mut dup = base.clone();
        dup.id = "b".into();
        dup.enabled = false;
        reg.models.push(base);
        reg.models.push(dup);
        assert!(reg.validate().is_ok());
    }
}
