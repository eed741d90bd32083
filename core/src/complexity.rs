//! Complexity Assessor (spec §4.G) — pure heuristic classification, no I/O.
//!
//! Grounded on the teacher's lightweight text-scanning style in
//! `agent/cognition/parser/short_key.rs` (regex/string-marker scanning).

use serde::{Deserialize, Serialize};

use crate::model::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLabel {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributingSignals {
    pub token_count: u32,
    pub multi_part_markers: u32,
    pub comparison_markers: u32,
    pub reasoning_markers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityScore {
    pub score: f32,
    pub label: ComplexityLabel,
    pub recommended_tier: Tier,
    pub confidence: f32,
    pub signals: ContributingSignals,
}

mod regex_cache {
    use regex::Regex;
    use std::sync::OnceLock;

    pub fn multi_part() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"(?i)\b(and also|as well as|additionally|furthermore|then |after that|first.*then)\b").unwrap())
    }

    pub fn comparison() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"(?i)\b(versus|vs\.?|compare|compared to|better than|worse than|difference between)\b").unwrap())
    }

    pub fn reasoning() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"(?i)\b(why|explain|how does|how do|justify|reasoning|walk me through)\b").unwrap())
    }
}

/// Thresholds mapping score to (label, tier): half-open intervals,
/// resolving spec §9's Open Question ("score < 3 -> Q2, < 7 -> Q3, else
/// Q4" generalized to SIMPLE/MODERATE/COMPLEX).
const SIMPLE_UPPER_BOUND: f32 = 3.0;
const MODERATE_UPPER_BOUND: f32 = 7.0;

/// Weights applied additively to each signal (spec §4.G: "order of
/// weight" token count > multi-part > comparison > reasoning).
const TOKEN_COUNT_WEIGHT: f32 = 0.02;
const MULTI_PART_WEIGHT: f32 = 1.5;
const COMPARISON_WEIGHT: f32 = 1.2;
const REASONING_WEIGHT: f32 = 1.0;

pub struct ComplexityAssessor;

impl ComplexityAssessor {
    /// Pure function of the request text; no side effects, no I/O.
    pub fn assess(text: &str) -> ComplexityScore {
        let token_count = text.split_whitespace().count() as u32;
        let multi_part_markers = regex_cache::multi_part().find_iter(text).count() as u32;
        let comparison_markers = regex_cache::comparison().find_iter(text).count() as u32;
        let reasoning_markers = regex_cache::reasoning().find_iter(text).count() as u32;

        let score = token_count as f32 * TOKEN_COUNT_WEIGHT
            + multi_part_markers as f32 * MULTI_PART_WEIGHT
            + comparison_markers as f32 * COMPARISON_WEIGHT
            + reasoning_markers as f32 * REASONING_WEIGHT;

        let (label, recommended_tier) = if score < SIMPLE_UPPER_BOUND {
            (ComplexityLabel::Simple, Tier::Fast)
        } else if score < MODERATE_UPPER_BOUND {
            (ComplexityLabel::Moderate, Tier::Balanced)
        } else {
            (ComplexityLabel::Complex, Tier::Powerful)
        };

        let confidence = Self::confidence_for(score);

        ComplexityScore {
            score,
            label,
            recommended_tier,
            confidence,
            signals: ContributingSignals {
                token_count,
                multi_part_markers,
                comparison_markers,
                reasoning_markers,
            },
        }
    }

    /// Confidence is 1 - distance-to-nearest-threshold, normalized into
    /// [0, 1] (spec §4.G).
    fn confidence_for(score: f32) -> f32 {
        let distance_to_nearest_threshold = [SIMPLE_UPPER_BOUND, MODERATE_UPPER_BOUND]
            .iter()
            .map(|t| (score - t).abs())
            .fold(f32::MAX, f32::min);
        let span = MODERATE_UPPER_BOUND - SIMPLE_UPPER_BOUND;
        (1.0 - (distance_to_nearest_threshold / span)).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_simple_question_maps_to_fast() {
        let score = ComplexityAssessor::assess("What is 2+2?");
        assert_eq!(score.label, ComplexityLabel::Simple);
        assert_eq!(score.recommended_tier, Tier::Fast);
    }

    #[test]
    fn reasoning_and_comparison_markers_push_to_complex() {
        let score = ComplexityAssessor::assess(
            "Why does TCP perform worse than QUIC under packet loss, and can you explain the congestion control differences, and also cover head-of-line blocking?",
        );
        assert_eq!(score.label, ComplexityLabel::Complex);
        assert_eq!(score.recommended_tier, Tier::Powerful);
    }

    /// `n` single-character tokens, none of which match any marker regex,
    /// so `assess()`'s score is exactly `n as f32 * TOKEN_COUNT_WEIGHT`.
    fn tokens(n: u32) -> String {
        vec!["w"; n as usize].join(" ")
    }

    #[test]
    fn threshold_boundaries_are_half_open() {
        // 150 tokens lands just under the SIMPLE/MODERATE boundary, 151 just at/over it.
        let below = ComplexityAssessor::assess(&tokens(150));
        assert!(below.score < SIMPLE_UPPER_BOUND);
        assert_eq!(below.label, ComplexityLabel::Simple);
        assert_eq!(below.recommended_tier, Tier::Fast);

        let at_bound = ComplexityAssessor::assess(&tokens(151));
        assert!(at_bound.score >= SIMPLE_UPPER_BOUND);
        assert_eq!(at_bound.label, ComplexityLabel::Moderate);
        assert_eq!(at_bound.recommended_tier, Tier::Balanced);

        // 350 tokens lands just under the MODERATE/COMPLEX boundary, 351 just at/over it.
        let below_upper = ComplexityAssessor::assess(&tokens(350));
        assert!(below_upper.score < MODERATE_UPPER_BOUND);
        assert_eq!(below_upper.label, ComplexityLabel::Moderate);
        assert_eq!(below_upper.recommended_tier, Tier::Balanced);

        let at_upper_bound = ComplexityAssessor::assess(&tokens(351));
        assert!(at_upper_bound.score >= MODERATE_UPPER_BOUND);
        assert_eq!(at_upper_bound.label, ComplexityLabel::Complex);
        assert_eq!(at_upper_bound.recommended_tier, Tier::Powerful);
    }
}
