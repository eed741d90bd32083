//! Dialogue Turn and Dialogue Result (spec §3).

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// The literal speaker identity used for synthetic moderator turns (spec
/// §3: "a model id or the literal MODERATOR").
pub const MODERATOR_SPEAKER: &str = "MODERATOR";

#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Persona {
    Pro,
    Con,
    Moderator,
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Persona::Pro => write!(f, "PRO"),
            Persona::Con => write!(f, "CON"),
            Persona::Moderator => write!(f, "MODERATOR"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub sequence: u32,
    pub speaker_id: String,
    pub persona: Persona,
    pub content: String,
    pub timestamp: SystemTime,
    pub tokens_used: u32,
}

/// An ordered non-empty sequence of turns plus interjection bookkeeping
/// (spec §3). `turns` is only non-empty once at least one turn completed;
/// a zero-turn debate (T=0) still produces a result with an empty list and
/// `completed: true` (spec §8 boundary behavior) — enforced by callers,
/// not by this type, since `Vec` cannot express non-emptiness for the
/// legitimate T=0 case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueResult {
    pub turns: Vec<DialogueTurn>,
    pub moderator_interjections: u32,
    pub completed: bool,
    pub post_hoc_analysis: Option<String>,
}

impl DialogueResult {
    pub fn empty_completed() -> Self {
        Self {
            turns: Vec::new(),
            moderator_interjections: 0,
            completed: true,
            post_hoc_analysis: None,
        }
    }

    pub fn total_debater_tokens(&self) -> u32 {
        self.turns
            .iter()
            .filter(|t| t.persona != Persona::Moderator)
            .map(|t| t.tokens_used)
            .sum()
    }

    pub fn elapsed_since_first_turn(&self) -> Option<Duration> {
        let first = self.turns.first()?.timestamp;
        SystemTime::now().duration_since(first).ok()
    }
}

impl PartialEq for Persona {
    fn eq(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Persona::Pro, Persona::Pro) | (Persona::Con, Persona::Con) | (Persona::Moderator, Persona::Moderator)
        )
    }
}
impl Eq for Persona {}
