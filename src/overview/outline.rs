//! Outline construction with a fallback ladder.
//!
//! Attempt `n` (0-based) sends the transcript cut to `input_tokens >> n`.
//! From the second half of the ladder on, diagrams are dropped from the
//! requested shape to keep the response small. Terminal generation errors
//! stop the ladder at once; anything else moves to the next rung.

use std::collections::HashSet;

use condense_common::{ConversationInput, Importance, Outline, OutlineSection};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chunking::format_turn;
use crate::errors::OverviewError;
use crate::generation::{GenerationFacade, GenerationRequest, ModelRole, OutputSchema};
use crate::overview::OverviewSettings;
use crate::tokens::TokenEstimator;

/// Outline as models actually return it: most fields optional.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOutline {
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    sections: Vec<RawSection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSection {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default, rename = "type")]
    section_type: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    importance: Option<String>,
    #[serde(default, alias = "relevant_turn_indices", alias = "turns")]
    relevant_turn_indices: Vec<usize>,
}

/// An accepted outline and the rung that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutlineOutcome {
    pub outline: Outline,
    pub diagrams_enabled: bool,
    /// 1-based attempt that succeeded.
    pub attempt: u32,
}

/// Input budget for attempt `attempt` (0-based).
pub fn attempt_budget(input_tokens: usize, attempt: u32) -> usize {
    input_tokens.checked_shr(attempt).unwrap_or(0).max(1)
}

/// Whether diagrams are still requested on attempt `attempt` (0-based).
pub fn diagrams_allowed(enabled: bool, attempt: u32, attempts: u32) -> bool {
    enabled && (attempt == 0 || attempt < attempts / 2)
}

pub fn outline_schema(diagrams: bool) -> OutputSchema {
    let mut section = json!({
        "type": "object",
        "required": ["id", "title", "type", "description", "importance", "relevantTurnIndices"],
        "properties": {
            "id": {"type": "string"},
            "title": {"type": "string"},
            "type": {"type": "string"},
            "description": {"type": "string"},
            "importance": {"type": "string", "enum": ["high", "medium", "low"]},
            "relevantTurnIndices": {"type": "array", "items": {"type": "integer"}}
        }
    });
    if diagrams {
        section["properties"]["diagram"] = json!({
            "type": "string",
            "description": "Kind of mermaid diagram that would help, or empty"
        });
    }
    OutputSchema::new(
        "outline",
        "a structured outline of the conversation",
        json!({
            "type": "object",
            "required": ["title", "summary", "sections"],
            "properties": {
                "title": {"type": "string"},
                "summary": {"type": "string"},
                "sections": {"type": "array", "items": section}
            }
        }),
    )
}

/// Fewest characters of a turn worth showing once the transcript is cut.
const MIN_TURN_CHARS: usize = 48;
const TURN_SEPARATOR: &str = "\n\n";
const CUT_MARKER: &str = " […]";

/// Transcript with turn numbers whose estimate fits in `budget` tokens.
///
/// When the whole conversation does not fit, turns are sampled evenly from
/// first to last and each gets an equal share of the budget, so the outline
/// still sees the full arc rather than just the opening. The kept turns keep
/// their original numbers.
pub fn numbered_transcript(
    input: &ConversationInput,
    budget: usize,
    estimator: &TokenEstimator,
) -> String {
    let rendered: Vec<String> = input
        .turns
        .iter()
        .enumerate()
        .map(|(i, turn)| format!("#{} {}", i, format_turn(turn)))
        .collect();
    let full = rendered.join(TURN_SEPARATOR);
    let budget_chars = estimator.chars_for_tokens(budget);
    if full.chars().count() <= budget_chars || rendered.is_empty() {
        return estimator.truncate_to_budget(&full, budget).to_string();
    }

    let overhead = TURN_SEPARATOR.len() + CUT_MARKER.chars().count();
    let keep = (budget_chars / (MIN_TURN_CHARS + overhead)).clamp(1, rendered.len());
    let share = (budget_chars / keep).saturating_sub(overhead);

    let cut = sample_indices(rendered.len(), keep)
        .into_iter()
        .map(|i| {
            let turn = &rendered[i];
            match turn.char_indices().nth(share) {
                Some((byte_idx, _)) => format!("{}{}", &turn[..byte_idx], CUT_MARKER),
                None => turn.clone(),
            }
        })
        .collect::<Vec<_>>()
        .join(TURN_SEPARATOR);
    estimator.truncate_to_budget(&cut, budget).to_string()
}

/// `keep` indices spread evenly over `0..len`, always including both ends
/// when `keep > 1`.
fn sample_indices(len: usize, keep: usize) -> Vec<usize> {
    if keep >= len {
        return (0..len).collect();
    }
    if keep <= 1 {
        return vec![0];
    }
    (0..keep).map(|j| j * (len - 1) / (keep - 1)).collect()
}

fn outline_prompt(input: &ConversationInput, transcript: &str, diagrams: bool) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "Plan a structured overview of the conversation below. Return an outline with a \
         title, a two or three sentence summary and between 3 and 12 sections. Each section \
         needs a short id, a title, a type (topic, decision, process, code, issue or reference), \
         a one-sentence description, an importance (high, medium or low) and the numbers of \
         the turns it draws on.\n\n",
    );
    if diagrams {
        prompt.push_str(
            "For sections where a flowchart or sequence diagram would help, name the diagram \
             kind in a `diagram` field.\n\n",
        );
    }
    if let Some(title) = &input.title {
        prompt.push_str(&format!("Conversation title: {}\n\n", title));
    }
    prompt.push_str("<conversation>\n");
    prompt.push_str(transcript);
    prompt.push_str("\n</conversation>");
    prompt
}

fn normalize(raw: RawOutline, turn_count: usize, fallback_title: Option<&str>) -> Outline {
    let mut seen = HashSet::new();
    let mut sections = Vec::new();

    for (i, section) in raw.sections.into_iter().enumerate() {
        let title = section.title.trim().to_string();
        if title.is_empty() {
            continue;
        }
        let mut id = section
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("section-{}", i + 1));
        if !seen.insert(id.clone()) {
            id = format!("{}-{}", id, i + 1);
            seen.insert(id.clone());
        }

        let importance = section
            .importance
            .and_then(|s| s.parse::<Importance>().ok())
            .unwrap_or_default();
        let mut turns: Vec<usize> = section
            .relevant_turn_indices
            .into_iter()
            .filter(|&t| t < turn_count)
            .collect();
        turns.sort_unstable();
        turns.dedup();

        sections.push(OutlineSection {
            id,
            title,
            section_type: section
                .section_type
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| "topic".to_string()),
            description: section.description.trim().to_string(),
            importance,
            relevant_turn_indices: turns,
        });
    }

    let title = Some(raw.title.trim())
        .filter(|t| !t.is_empty())
        .or(fallback_title)
        .unwrap_or("Conversation overview")
        .to_string();

    Outline {
        title,
        summary: raw.summary.trim().to_string(),
        sections,
    }
}

/// Run the outline ladder.
pub async fn build_outline(
    facade: &GenerationFacade,
    input: &ConversationInput,
    settings: &OverviewSettings,
    estimator: &TokenEstimator,
    cancel: &CancellationToken,
) -> Result<OutlineOutcome, OverviewError> {
    let attempts = settings.outline_attempts.max(1);
    let mut last_error = String::from("no attempt made");

    for attempt in 0..attempts {
        let budget = attempt_budget(settings.outline_input_tokens, attempt);
        let diagrams = diagrams_allowed(settings.diagrams, attempt, attempts);
        let transcript = numbered_transcript(input, budget, estimator);

        let request = GenerationRequest::text(outline_prompt(input, &transcript, diagrams))
            .with_role(ModelRole::Outline)
            .with_temperature(settings.temperature)
            .with_max_output_tokens(settings.max_output_tokens)
            .with_policy(&settings.retry)
            .with_feature("overview_outline", Some(input.conversation_id.clone()))
            .with_cancellation(cancel.clone());

        match facade
            .generate_structured::<RawOutline>(&request, &outline_schema(diagrams))
            .await
        {
            Ok(generated) => {
                let outline = normalize(generated.value, input.turns.len(), input.title.as_deref());
                if outline.sections.is_empty() {
                    warn!(attempt = attempt + 1, budget, "Outline had no usable sections");
                    last_error = OverviewError::EmptyOutline.to_string();
                    continue;
                }
                info!(
                    attempt = attempt + 1,
                    sections = outline.sections.len(),
                    diagrams,
                    "Outline ready"
                );
                return Ok(OutlineOutcome {
                    outline,
                    diagrams_enabled: diagrams,
                    attempt: attempt + 1,
                });
            }
            Err(err) if err.is_terminal() => return Err(err.into()),
            Err(err) => {
                warn!(attempt = attempt + 1, budget, error = %err, "Outline attempt failed");
                last_error = err.to_string();
            }
        }
    }

    Err(OverviewError::OutlineFailed {
        attempts,
        last_error,
    })
}
