//! Query Request surface (spec §3, §6) — the external-facing input to the
//! Query Coordinator.
//!
//! Grounded on `agent/contract/session.rs`'s request struct, which accepts
//! both camelCase and snake_case field names for the same boundary
//! tolerance reason.

use serde::{Deserialize, Serialize};

use crate::model::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Auto,
    Standard,
    Debate,
    Council,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueParams {
    #[serde(alias = "maxTurns")]
    pub max_turns: u32,
    #[serde(alias = "moderatorCheckFrequency")]
    pub moderator_check_frequency: u32,
    #[serde(alias = "moderatorModelId")]
    pub moderator_model_id: Option<String>,
    #[serde(alias = "maxModeratorInterjections")]
    pub max_moderator_interjections: u32,
}

impl Default for DialogueParams {
    fn default() -> Self {
        Self {
            max_turns: crate::dialogue::DEFAULT_MAX_TURNS,
            moderator_check_frequency: crate::dialogue::DEFAULT_MODERATOR_CHECK_FREQUENCY,
            moderator_model_id: None,
            max_moderator_interjections: crate::dialogue::DEFAULT_MAX_MODERATOR_INTERJECTIONS,
        }
    }
}

/// One incoming query (spec §3 "Query Request"). Boundary-tolerant: most
/// fields are optional and default, mirroring §6's "readers must tolerate
/// absent optional fields."
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryRequest {
    pub text: String,
    pub mode: Mode,
    #[serde(alias = "tierOverride")]
    pub tier_override: Option<Tier>,
    #[serde(alias = "useContext")]
    pub use_context: bool,
    #[serde(alias = "contextTokenBudget")]
    pub context_token_budget: Option<u32>,
    #[serde(alias = "minRelevance")]
    pub min_relevance: Option<f32>,
    #[serde(alias = "maxTokens")]
    pub max_tokens: u32,
    pub temperature: f32,
    pub dialogue: DialogueParams,
    #[serde(alias = "proModelId")]
    pub pro_model_id: Option<String>,
    #[serde(alias = "conModelId")]
    pub con_model_id: Option<String>,
    #[serde(alias = "cacheable")]
    pub cacheable: bool,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            text: String::new(),
            mode: Mode::Auto,
            tier_override: None,
            use_context: false,
            context_token_budget: None,
            min_relevance: None,
            max_tokens: 1024,
            temperature: 0.7,
            dialogue: DialogueParams::default(),
            pro_model_id: None,
            con_model_id: None,
            cacheable: true,
        }
    }
}

impl QueryRequest {
    /// Validation per spec §4.K step 1: empty text, out-of-range
    /// temperature, or a zero token budget are rejected before any
    /// component is touched.
    pub fn validate(&self) -> Result<(), String> {
        if self.text.trim().is_empty() {
            return Err("text must not be empty".to_string());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err("temperature must be within [0.0, 2.0]".to_string());
        }
        if self.max_tokens == 0 {
            return Err("max_tokens must be greater than zero".to_string());
        }
        if matches!(self.mode, Mode::Debate | Mode::Council)
            && (self.pro_model_id.is_none() || self.con_model_id.is_none())
        {
            return Err("debate and council modes require pro_model_id and con_model_id".to_string());
        }
        if matches!(self.mode, Mode::Council) && self.dialogue.moderator_model_id.is_none() {
            return Err("council mode requires dialogue.moderator_model_id".to_string());
        }
        Ok(())
    }

    /// Temperature bucketed to one decimal place, used only for cache
    /// fingerprinting so near-identical temperatures still hit the same
    /// entry (spec §4.E).
    pub fn temperature_bucket(&self) -> u32 {
        (self.temperature * 10.0).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_text() {
        let req = QueryRequest {
            text: "   ".to_string(),
            ..QueryRequest::default()
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_temperature() {
        let req = QueryRequest {
            text: "hi".to_string(),
            temperature: 3.0,
            ..QueryRequest::default()
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn debate_mode_requires_both_model_ids() {
        let req = QueryRequest {
            text: "hi".to_string(),
            mode: Mode::Debate,
            ..QueryRequest::default()
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn accepts_camel_case_aliases() {
        let json = r#"{"text": "hi", "maxTokens": 512, "useContext": true}"#;
        let req: QueryRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.max_tokens, 512);
        assert!(req.use_context);
    }
}
