//! Moderator response parsing (spec §4.I, §9).
//!
//! "If the moderator returns text that neither matches 'CONTINUE' nor
//! begins with 'INTERJECT:', the conservative policy is no-interjection;
//! implementers must not infer intent." This is specified, not defaulted,
//! so the parser has exactly three outcomes and no fallback heuristics.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeratorVerdict {
    Continue,
    Interject { guidance: String },
    Ambiguous,
}

pub fn parse_moderator_response(raw: &str) -> ModeratorVerdict {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("CONTINUE") {
        return ModeratorVerdict::Continue;
    }
    if let Some(rest) = trimmed
        .strip_prefix("INTERJECT:")
        .or_else(|| trimmed.strip_prefix("interject:"))
    {
        return ModeratorVerdict::Interject {
            guidance: rest.trim().to_string(),
        };
    }
    ModeratorVerdict::Ambiguous
}
