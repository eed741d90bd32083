mod engine;
mod moderator;
mod turn;

pub use engine::{
    CouncilConfig, DialogueEngine, Reselector, DEFAULT_MAX_MODERATOR_INTERJECTIONS, DEFAULT_MAX_TURNS,
    DEFAULT_MODERATOR_CHECK_FREQUENCY,
};
pub use moderator::{parse_moderator_response, ModeratorVerdict};
pub use turn::{DialogueResult, DialogueTurn, Persona, MODERATOR_SPEAKER};
