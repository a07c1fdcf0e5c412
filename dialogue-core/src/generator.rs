//! The content generator boundary.
//!
//! The builder never writes prose or invents choices itself. It asks a
//! [`ContentGenerator`] for both, and falls back to fixed content when the
//! generator fails, times out or comes back empty. Generators that speak
//! JSON can deserialize into [`RawChoice`] and let [`parse_choices`] do the
//! consequence parsing.

use crate::blueprint::Beat;
use crate::consequence::{Consequence, ConsequenceError};
use crate::node::{Choice, ChoiceType, NodeId, Preconditions};
use crate::state::{Meter, StateSnapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Narrative used when the generator cannot produce one.
pub const FALLBACK_NARRATIVE: &str =
    "The moment stretches on in silence, and the night waits for your next move.";

/// Errors a generator may report.
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("Generation failed: {0}")]
    Failed(String),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed generator output: {0}")]
    Malformed(String),

    #[error("Consequence error: {0}")]
    Consequence(#[from] ConsequenceError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// What the builder knows when it asks for content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationContext {
    /// The node choices are requested for, when it already exists.
    pub node_id: Option<NodeId>,

    /// Depth of the node the content belongs to.
    pub depth: usize,

    /// How many choices the builder will use at most.
    pub max_choices: usize,

    /// The most recent narrative on the path.
    pub preceding_narrative: Option<String>,

    /// Beat governing this depth (guided builds only).
    pub beat: Option<Beat>,

    /// 0 for the first pass, then the extension round number.
    pub extension_round: u32,

    /// Whether an ending may be reached from here.
    pub ending_allowed: bool,
}

/// Source of narrative text and candidate choices.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Candidate choices for a node in `scene` with the given state.
    async fn choices(
        &self,
        scene: &str,
        state: &StateSnapshot,
        context: &GenerationContext,
    ) -> Result<Vec<Choice>, GeneratorError>;

    /// Narrative for the node reached by taking `choice`, whose state is
    /// `state`.
    async fn narrative(
        &self,
        choice: &Choice,
        state: &StateSnapshot,
        context: &GenerationContext,
    ) -> Result<String, GeneratorError>;
}

/// A choice as a generator emits it, before consequence parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChoice {
    #[serde(default)]
    pub id: Option<String>,

    pub text: String,

    #[serde(default, alias = "type")]
    pub choice_type: ChoiceType,

    #[serde(default)]
    pub preconditions: Option<Preconditions>,

    /// Loosely typed deltas, e.g. `{"pr": "+5", "time": "03:10"}`.
    #[serde(default, alias = "effects", alias = "state_delta")]
    pub consequences: Map<String, Value>,
}

impl RawChoice {
    /// Parse into a typed choice. `index` names the choice when it has no id.
    pub fn into_choice(self, index: usize) -> Result<Choice, GeneratorError> {
        let text = self.text.trim();
        if text.is_empty() {
            return Err(GeneratorError::Malformed(format!(
                "choice {} has no text",
                index + 1
            )));
        }
        let id = self
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("choice_{}", index + 1));

        Ok(Choice {
            id,
            text: text.to_string(),
            choice_type: self.choice_type,
            preconditions: self.preconditions,
            consequences: Consequence::parse_map(&self.consequences)?,
            next_node_id: None,
        })
    }
}

/// Parse a generator's JSON reply.
///
/// Accepts either a bare array of choices or an object with a `choices`
/// array. Repeated ids get a numeric suffix so ids stay unique per node.
pub fn parse_choices(json: &str) -> Result<Vec<Choice>, GeneratorError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Reply {
        Bare(Vec<RawChoice>),
        Wrapped { choices: Vec<RawChoice> },
    }

    let raw = match serde_json::from_str::<Reply>(json)? {
        Reply::Bare(choices) | Reply::Wrapped { choices } => choices,
    };

    let mut seen = HashSet::new();
    let mut choices = Vec::with_capacity(raw.len());
    for (index, raw_choice) in raw.into_iter().enumerate() {
        let mut choice = raw_choice.into_choice(index)?;
        if !seen.insert(choice.id.clone()) {
            let mut suffix = 2;
            while seen.contains(&format!("{}_{suffix}", choice.id)) {
                suffix += 1;
            }
            choice.id = format!("{}_{suffix}", choice.id);
            seen.insert(choice.id.clone());
        }
        choices.push(choice);
    }
    Ok(choices)
}

/// The two choices used when the generator has nothing to offer.
///
/// Both move the clock forward, so they never loop back onto the state they
/// were taken from.
pub fn fallback_choices() -> Vec<Choice> {
    vec![
        Choice::new("fallback_press_on", "Press on into the dark.")
            .with_type(ChoiceType::Normal)
            .with_consequence(Consequence::AdjustClock { minutes: 10 })
            .with_consequence(Consequence::adjust(Meter::GlobalResonance, 5)),
        Choice::new("fallback_hold_back", "Hold back and steady yourself.")
            .with_type(ChoiceType::Micro)
            .with_consequence(Consequence::AdjustClock { minutes: 5 })
            .with_consequence(Consequence::adjust(Meter::PersonalResonance, -5)),
    ]
}
