//! Dialogue Engine (spec §4.I) — orchestrates standard, debate and council
//! modes.
//!
//! Grounded on `agent/v2/orchestrator/loops.rs::run_agent_loop_v1`'s flat
//! `loop { ... }` driver (no recursive awaits) and on
//! `agent/contract/session.rs`'s explicit event-emission-per-step style.
//! Per spec §9 ("Cross-component coroutines"): dialogue turns look
//! recursive in narrative but are a linear sequence, implemented as an
//! explicit loop over a state struct so cancellation stays simple.

use std::sync::Arc;
use std::time::SystemTime;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::cgrag::ContextArtifact;
use crate::client::{GenerateParams, ModelClient};
use crate::dialogue::moderator::{parse_moderator_response, ModeratorVerdict};
use crate::dialogue::turn::{DialogueResult, DialogueTurn, Persona, MODERATOR_SPEAKER};
use crate::error::{Result, SynapseError};
use crate::events::{EventBus, EventKind};

/// Default turn cap for debate/council (spec §4.I).
pub const DEFAULT_MAX_TURNS: u32 = 6;
pub const DEFAULT_MODERATOR_CHECK_FREQUENCY: u32 = 2;
pub const DEFAULT_MAX_MODERATOR_INTERJECTIONS: u32 = 3;

#[derive(Debug, Clone)]
pub struct CouncilConfig {
    pub moderator_check_frequency: u32,
    pub max_interjections: u32,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self {
            moderator_check_frequency: DEFAULT_MODERATOR_CHECK_FREQUENCY,
            max_interjections: DEFAULT_MAX_MODERATOR_INTERJECTIONS,
        }
    }
}

/// Enables one automatic re-selection to a different model instance when a
/// debater's generation call fails mid-dialogue (spec §4.H failure
/// semantics: "one automatic re-selection to a different instance in the
/// same tier on model-level failure"). The Dialogue Engine has no
/// Fleet/Router access of its own; the Query Coordinator implements this
/// to bridge back to `Router::reselect_once`.
pub trait Reselector: Send + Sync {
    /// Returns a replacement model id and client for `failed_model_id`, or
    /// `None` if no other instance in its tier is available.
    fn reselect(&self, failed_model_id: &str) -> Option<(String, Arc<dyn ModelClient>)>;
}

pub struct DialogueEngine {
    event_bus: EventBus,
}

impl DialogueEngine {
    pub fn new(event_bus: EventBus) -> Self {
        Self { event_bus }
    }

    /// Standard mode: one turn, pass-through to a single Model Client.
    /// Shares the prompt-assembly/event-emission path with debate/council
    /// so all three modes are one code path at different turn counts
    /// (spec §4.I: "included here only to share the ... code path").
    pub async fn run_standard(
        &self,
        model_id: &str,
        client: Arc<dyn ModelClient>,
        query: &str,
        context: &[ContextArtifact],
        max_tokens: u32,
        temperature: f32,
        reselect: Option<&dyn Reselector>,
        cancel: &CancellationToken,
    ) -> Result<DialogueResult> {
        let prompt = assemble_prompt(query, context, &[]);
        let mut speaker_id = model_id.to_string();
        let mut client = client;
        let content = self
            .generate_turn_with_reselect(&mut speaker_id, &mut client, &prompt, max_tokens, temperature, reselect, cancel)
            .await?;
        let turn = DialogueTurn {
            sequence: 0,
            speaker_id,
            persona: Persona::Pro,
            content: content.clone(),
            timestamp: SystemTime::now(),
            tokens_used: crate::cgrag::estimate_tokens(&content),
        };
        self.emit_turn(&turn);
        Ok(DialogueResult {
            turns: vec![turn],
            moderator_interjections: 0,
            completed: true,
            post_hoc_analysis: None,
        })
    }

    /// Debate mode: two models, PRO and CON, strictly alternating, PRO
    /// first. CGRAG context is inserted only in turn 1 of each side
    /// (spec §4.I). A model never sees itself labeled as the opposite
    /// persona: each side's prompt always says "You are <persona>" for
    /// itself and names the other side only by its own persona label.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_debate(
        &self,
        original_query: &str,
        context: &[ContextArtifact],
        pro: (&str, Arc<dyn ModelClient>),
        con: (&str, Arc<dyn ModelClient>),
        max_turns: u32,
        max_tokens: u32,
        temperature: f32,
        reselect: Option<&dyn Reselector>,
        cancel: &CancellationToken,
    ) -> DialogueResult {
        let (pro_id, pro_client) = pro;
        let (con_id, con_client) = con;
        let mut pro_id = pro_id.to_string();
        let mut con_id = con_id.to_string();
        let mut pro_client = pro_client;
        let mut con_client = con_client;
        let mut turns: Vec<DialogueTurn> = Vec::new();
        let mut completed = true;

        for turn_index in 0..max_turns {
            if cancel.is_cancelled() {
                completed = false;
                break;
            }
            let is_pro_turn = turn_index % 2 == 0;
            let persona = if is_pro_turn { Persona::Pro } else { Persona::Con };
            let is_first_for_side = turn_index < 2;

            let turn_context: &[ContextArtifact] = if is_first_for_side { context } else { &[] };
            let prompt = assemble_debate_prompt(original_query, persona, turn_context, &turns);

            let (id, client) = if is_pro_turn {
                (&mut pro_id, &mut pro_client)
            } else {
                (&mut con_id, &mut con_client)
            };

            match self
                .generate_turn_with_reselect(id, client, &prompt, max_tokens, temperature, reselect, cancel)
                .await
            {
                Ok(content) => {
                    let turn = DialogueTurn {
                        sequence: turns.len() as u32,
                        speaker_id: id.clone(),
                        persona,
                        content: content.clone(),
                        timestamp: SystemTime::now(),
                        tokens_used: crate::cgrag::estimate_tokens(&content),
                    };
                    self.emit_turn(&turn);
                    turns.push(turn);
                }
                Err(SynapseError::Cancelled) => {
                    completed = false;
                    break;
                }
                Err(_) => {
                    // A debater failure that could not be re-selected to a
                    // different instance terminates the dialogue with a
                    // partial transcript.
                    completed = false;
                    break;
                }
            }
        }

        DialogueResult {
            turns,
            moderator_interjections: 0,
            completed,
            post_hoc_analysis: None,
        }
    }

    /// Council mode: debate plus an optional active Moderator probing
    /// every `check_frequency` turns.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_council(
        &self,
        original_query: &str,
        context: &[ContextArtifact],
        pro: (&str, Arc<dyn ModelClient>),
        con: (&str, Arc<dyn ModelClient>),
        moderator: (&str, Arc<dyn ModelClient>),
        max_turns: u32,
        max_tokens: u32,
        temperature: f32,
        council: &CouncilConfig,
        reselect: Option<&dyn Reselector>,
        cancel: &CancellationToken,
    ) -> DialogueResult {
        let (pro_id, pro_client) = pro;
        let (con_id, con_client) = con;
        let (_moderator_id, moderator_client) = moderator;
        let mut pro_id = pro_id.to_string();
        let mut con_id = con_id.to_string();
        let mut pro_client = pro_client;
        let mut con_client = con_client;

        let check_frequency = council.moderator_check_frequency.clamp(1, 10);
        let mut turns: Vec<DialogueTurn> = Vec::new();
        let mut interjections = 0u32;
        let mut completed = true;
        let mut debater_turn_count = 0u32;

        loop {
            if debater_turn_count >= max_turns || cancel.is_cancelled() {
                if cancel.is_cancelled() {
                    completed = false;
                }
                break;
            }

            let is_pro_turn = debater_turn_count % 2 == 0;
            let persona = if is_pro_turn { Persona::Pro } else { Persona::Con };
            let is_first_for_side = debater_turn_count < 2;
            let turn_context: &[ContextArtifact] = if is_first_for_side { context } else { &[] };
            let debater_turns_only: Vec<&DialogueTurn> =
                turns.iter().filter(|t| t.persona != Persona::Moderator).collect();
            let prompt = assemble_debate_prompt_from_refs(original_query, persona, turn_context, &debater_turns_only);

            let (id, client) = if is_pro_turn {
                (&mut pro_id, &mut pro_client)
            } else {
                (&mut con_id, &mut con_client)
            };

            match self
                .generate_turn_with_reselect(id, client, &prompt, max_tokens, temperature, reselect, cancel)
                .await
            {
                Ok(content) => {
                    let turn = DialogueTurn {
                        sequence: turns.len() as u32,
                        speaker_id: id.clone(),
                        persona,
                        content: content.clone(),
                        timestamp: SystemTime::now(),
                        tokens_used: crate::cgrag::estimate_tokens(&content),
                    };
                    self.emit_turn(&turn);
                    turns.push(turn);
                    debater_turn_count += 1;
                }
                Err(SynapseError::Cancelled) => {
                    completed = false;
                    break;
                }
                Err(_) => {
                    completed = false;
                    break;
                }
            }

            let should_probe = debater_turn_count > 0
                && debater_turn_count % check_frequency == 0
                && interjections < council.max_interjections
                && debater_turn_count < max_turns;

            if should_probe {
                let window: Vec<&DialogueTurn> = turns
                    .iter()
                    .rev()
                    .take((check_frequency * 2) as usize)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                let probe_prompt = assemble_moderator_probe(original_query, &window);

                match self
                    .generate_turn(&moderator_client, &probe_prompt, max_tokens, temperature, cancel)
                    .await
                {
                    Ok(response) => match parse_moderator_response(&response) {
                        ModeratorVerdict::Interject { guidance } => {
                            let turn = DialogueTurn {
                                sequence: turns.len() as u32,
                                speaker_id: MODERATOR_SPEAKER.to_string(),
                                persona: Persona::Moderator,
                                content: guidance,
                                timestamp: SystemTime::now(),
                                tokens_used: 0, // zero tokens counted toward debater budgets
                            };
                            self.emit_interjection(&turn);
                            turns.push(turn);
                            interjections += 1;
                        }
                        ModeratorVerdict::Continue | ModeratorVerdict::Ambiguous => {
                            // Conservative default: no interjection on
                            // ambiguous responses (spec §9).
                        }
                    },
                    Err(_) => {
                        // Moderator error is non-fatal; dialogue continues.
                        tracing::warn!("moderator probe failed, continuing without interjection");
                    }
                }
            }
        }

        let post_hoc_analysis = if completed && !turns.is_empty() {
            match self
                .generate_turn(
                    &moderator_client,
                    &assemble_post_hoc_prompt(original_query, &turns),
                    max_tokens,
                    temperature,
                    cancel,
                )
                .await
            {
                Ok(analysis) => Some(analysis),
                Err(_) => None,
            }
        } else {
            None
        };

        DialogueResult {
            turns,
            moderator_interjections: interjections,
            completed,
            post_hoc_analysis,
        }
    }

    async fn generate_turn(
        &self,
        client: &Arc<dyn ModelClient>,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let (mut stream, handle) = client
            .generate(GenerateParams {
                prompt: prompt.to_string(),
                max_tokens,
                temperature,
            })
            .await?;

        let mut content = String::new();
        loop {
            tokio::select! {
                next = stream.next() => {
                    match next {
                        Some(Ok(token)) => {
                            content.push_str(&token.text);
                            if token.is_final {
                                break;
                            }
                        }
                        Some(Err(e)) => return Err(e),
                        None => break,
                    }
                }
                _ = cancel.cancelled() => {
                    client.cancel(&handle);
                    return Err(SynapseError::Cancelled);
                }
            }
        }
        Ok(content.trim().to_string())
    }

    /// Runs one turn; on a model-level failure (not cancellation), asks
    /// `reselect` for a different instance and retries exactly once before
    /// giving up (spec §4.H: "one automatic re-selection ... on
    /// model-level failure during generation"). `id`/`client` are updated
    /// in place so the caller's subsequent turns for this speaker keep
    /// using the replacement.
    async fn generate_turn_with_reselect(
        &self,
        id: &mut String,
        client: &mut Arc<dyn ModelClient>,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        reselect: Option<&dyn Reselector>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        match self.generate_turn(client, prompt, max_tokens, temperature, cancel).await {
            Ok(content) => Ok(content),
            Err(SynapseError::Cancelled) => Err(SynapseError::Cancelled),
            Err(e) => match reselect.and_then(|r| r.reselect(id)) {
                Some((new_id, new_client)) => {
                    *id = new_id;
                    *client = new_client;
                    self.generate_turn(client, prompt, max_tokens, temperature, cancel).await
                }
                None => Err(e),
            },
        }
    }

    fn emit_turn(&self, turn: &DialogueTurn) {
        self.event_bus.publish(
            EventKind::DialogueTurn,
            serde_json::json!({
                "sequence": turn.sequence,
                "speaker_id": turn.speaker_id,
                "persona": turn.persona.to_string(),
                "tokens_used": turn.tokens_used,
            }),
        );
    }

    fn emit_interjection(&self, turn: &DialogueTurn) {
        self.event_bus.publish(
            EventKind::ModeratorInterjection,
            serde_json::json!({
                "sequence": turn.sequence,
                "guidance": turn.content,
            }),
        );
    }
}

fn render_context(context: &[ContextArtifact]) -> String {
    if context.is_empty() {
        return String::new();
    }
    let body = context
        .iter()
        .map(|a| format!("[{}] {}", a.chunk_id, a.text))
        .collect::<Vec<_>>()
        .join("\n");
    format!("\n\nContext:\n{body}")
}

fn assemble_prompt(query: &str, context: &[ContextArtifact], _transcript: &[DialogueTurn]) -> String {
    format!("Query: {query}{}", render_context(context))
}

fn render_transcript_for(persona: Persona, transcript: &[&DialogueTurn]) -> String {
    transcript
        .iter()
        .map(|t| {
            let label = if t.persona == persona {
                "You".to_string()
            } else {
                t.persona.to_string()
            };
            format!("{label}: {}", t.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn assemble_debate_prompt(
    original_query: &str,
    persona: Persona,
    context: &[ContextArtifact],
    transcript: &[DialogueTurn],
) -> String {
    let refs: Vec<&DialogueTurn> = transcript.iter().collect();
    assemble_debate_prompt_from_refs(original_query, persona, context, &refs)
}

fn assemble_debate_prompt_from_refs(
    original_query: &str,
    persona: Persona,
    context: &[ContextArtifact],
    transcript: &[&DialogueTurn],
) -> String {
    let system = format!("You are arguing the {persona} position in a structured debate.");
    let history = render_transcript_for(persona, transcript);
    format!(
        "{system}\n\nOriginal query: {original_query}{}\n\nTranscript so far:\n{history}\n\nYour turn:",
        render_context(context)
    )
}

fn assemble_moderator_probe(original_query: &str, window: &[&DialogueTurn]) -> String {
    let history = window
        .iter()
        .map(|t| format!("{}: {}", t.persona, t.content))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You are moderating a debate on: {original_query}\n\nRecent turns:\n{history}\n\n\
Respond with exactly \"CONTINUE\" if the debate should proceed unchanged, or \
\"INTERJECT: <guidance>\" if you want to redirect it."
    )
}

fn assemble_post_hoc_prompt(original_query: &str, turns: &[DialogueTurn]) -> String {
    let history = turns
        .iter()
        .map(|t| format!("{}: {}", t.persona, t.content))
        .collect::<Vec<_>>()
        .join("\n");
    format!("Provide a post-hoc analysis of this debate on: {original_query}\n\nFull transcript:\n{history}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StubModelClient;

    fn token_cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn debate_alternates_pro_first_with_no_moderator_turns() {
        let engine = DialogueEngine::new(EventBus::new(64, 0.0));
        let pro = Arc::new(StubModelClient::new("m1", "pro argument")) as Arc<dyn ModelClient>;
        let con = Arc::new(StubModelClient::new("m2", "con argument")) as Arc<dyn ModelClient>;
        let cancel = token_cancel();

        let result = engine
            .run_debate("topic?", &[], ("m1", pro), ("m2", con), 4, 256, 0.7, None, &cancel)
            .await;

        assert_eq!(result.turns.len(), 4);
        assert!(result.completed);
        let speakers: Vec<&str> = result.turns.iter().map(|t| t.speaker_id.as_str()).collect();
        assert_eq!(speakers, vec!["m1", "m2", "m1", "m2"]);
        let personas: Vec<Persona> = result.turns.iter().map(|t| t.persona).collect();
        assert_eq!(personas, vec![Persona::Pro, Persona::Con, Persona::Pro, Persona::Con]);
        assert!(result.turns.iter().all(|t| t.persona != Persona::Moderator));
    }

    #[tokio::test]
    async fn zero_turn_debate_returns_empty_completed_transcript() {
        let engine = DialogueEngine::new(EventBus::new(64, 0.0));
        let pro = Arc::new(StubModelClient::new("m1", "x")) as Arc<dyn ModelClient>;
        let con = Arc::new(StubModelClient::new("m2", "y")) as Arc<dyn ModelClient>;
        let cancel = token_cancel();
        let result = engine
            .run_debate("topic?", &[], ("m1", pro), ("m2", con), 0, 256, 0.7, None, &cancel)
            .await;
        assert!(result.turns.is_empty());
        assert!(result.completed);
    }

    #[tokio::test]
    async fn council_interjects_on_explicit_directive() {
        let engine = DialogueEngine::new(EventBus::new(64, 0.0));
        let pro = Arc::new(StubModelClient::new("m1", "pro says something")) as Arc<dyn ModelClient>;
        let con = Arc::new(StubModelClient::new("m2", "con says something")) as Arc<dyn ModelClient>;
        let moderator =
            Arc::new(StubModelClient::new("mod", "INTERJECT: refocus")) as Arc<dyn ModelClient>;
        let cancel = token_cancel();
        let council_cfg = CouncilConfig {
            moderator_check_frequency: 2,
            max_interjections: 3,
        };

        let result = engine
            .run_council(
                "topic?",
                &[],
                ("m1", pro),
                ("m2", con),
                ("mod", moderator),
                4,
                256,
                0.7,
                &council_cfg,
                None,
                &cancel,
            )
            .await;

        assert_eq!(result.moderator_interjections, 1);
        assert!(result.turns.iter().any(|t| t.persona == Persona::Moderator));
        // Moderator turns count zero tokens toward debater budgets.
        let moderator_turn = result.turns.iter().find(|t| t.persona == Persona::Moderator).unwrap();
        assert_eq!(moderator_turn.tokens_used, 0);
    }

    #[tokio::test]
    async fn council_ambiguous_response_never_interjects() {
        let engine = DialogueEngine::new(EventBus::new(64, 0.0));
        let pro = Arc::new(StubModelClient::new("m1", "pro says something")) as Arc<dyn ModelClient>;
        let con = Arc::new(StubModelClient::new("m2", "con says something")) as Arc<dyn ModelClient>;
        let moderator =
            Arc::new(StubModelClient::new("mod", "maybe continue, not sure")) as Arc<dyn ModelClient>;
        let cancel = token_cancel();
        let council_cfg = CouncilConfig::default();

        let result = engine
            .run_council(
                "topic?",
                &[],
                ("m1", pro),
                ("m2", con),
                ("mod", moderator),
                4,
                256,
                0.7,
                &council_cfg,
                None,
                &cancel,
            )
            .await;

        assert_eq!(result.moderator_interjections, 0);
        assert!(result.turns.iter().all(|t| t.persona != Persona::Moderator));
    }

    struct AlwaysFailingClient {
        id: String,
    }

    #[async_trait::async_trait]
    impl ModelClient for AlwaysFailingClient {
        fn model_id(&self) -> &str {
            &self.id
        }

        async fn health(&self) -> crate::client::HealthReport {
            crate::client::HealthReport {
                healthy: false,
                latency_ms: 0.0,
                tokens_per_second: 0.0,
                vram_gb: 0.0,
            }
        }

        async fn generate(&self, _params: GenerateParams) -> Result<(crate::client::TokenStream, crate::client::GenerationHandle)> {
            Err(SynapseError::ModelFatal {
                model_id: self.id.clone(),
                message: "stub failure".to_string(),
            })
        }
    }

    struct StaticReselector {
        replacement_id: String,
        replacement: Arc<dyn ModelClient>,
    }

    impl Reselector for StaticReselector {
        fn reselect(&self, _failed_model_id: &str) -> Option<(String, Arc<dyn ModelClient>)> {
            Some((self.replacement_id.clone(), self.replacement.clone()))
        }
    }

    #[tokio::test]
    async fn run_standard_reselects_to_a_different_instance_on_model_failure() {
        let engine = DialogueEngine::new(EventBus::new(64, 0.0));
        let failing = Arc::new(AlwaysFailingClient { id: "m1".to_string() }) as Arc<dyn ModelClient>;
        let replacement = Arc::new(StubModelClient::new("m2", "recovered answer")) as Arc<dyn ModelClient>;
        let reselect = StaticReselector {
            replacement_id: "m2".to_string(),
            replacement,
        };
        let cancel = token_cancel();

        let result = engine
            .run_standard("m1", failing, "query", &[], 256, 0.7, Some(&reselect), &cancel)
            .await
            .unwrap();

        assert_eq!(result.turns.len(), 1);
        assert_eq!(result.turns[0].speaker_id, "m2");
        assert_eq!(result.turns[0].content, "recovered answer");
    }

    #[tokio::test]
    async fn run_debate_reselects_failed_debater_and_continues_under_new_id() {
        let engine = DialogueEngine::new(EventBus::new(64, 0.0));
        let failing_pro = Arc::new(AlwaysFailingClient { id: "m1".to_string() }) as Arc<dyn ModelClient>;
        let con = Arc::new(StubModelClient::new("m2", "con argument")) as Arc<dyn ModelClient>;
        let replacement = Arc::new(StubModelClient::new("m3", "pro argument")) as Arc<dyn ModelClient>;
        let reselect = StaticReselector {
            replacement_id: "m3".to_string(),
            replacement,
        };
        let cancel = token_cancel();

        let result = engine
            .run_debate("topic?", &[], ("m1", failing_pro), ("m2", con), 2, 256, 0.7, Some(&reselect), &cancel)
            .await;

        assert!(result.completed);
        assert_eq!(result.turns.len(), 2);
        let speakers: Vec<&str> = result.turns.iter().map(|t| t.speaker_id.as_str()).collect();
        assert_eq!(speakers, vec!["m3", "m2"]);
    }

    #[tokio::test]
    async fn run_debate_gives_up_with_partial_transcript_when_no_reselector_is_available() {
        let engine = DialogueEngine::new(EventBus::new(64, 0.0));
        let failing_pro = Arc::new(AlwaysFailingClient { id: "m1".to_string() }) as Arc<dyn ModelClient>;
        let con = Arc::new(StubModelClient::new("m2", "con argument")) as Arc<dyn ModelClient>;
        let cancel = token_cancel();

        let result = engine
            .run_debate("topic?", &[], ("m1", failing_pro), ("m2", con), 4, 256, 0.7, None, &cancel)
            .await;

        assert!(!result.completed);
        assert!(result.turns.is_empty());
    }
}
