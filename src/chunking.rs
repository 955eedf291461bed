//! Token-bounded partitioning of conversation turns.
//!
//! The chunker is a single greedy pass: turns are appended to the open chunk
//! until the next one would overflow the target, at which point the chunk is
//! closed. Turns are never split, so a chunk boundary can only fall between
//! turns. A turn carrying a fenced code block may overflow the target by up to
//! half again before the chunk is closed.

use condense_common::{Chunk, Role, Turn};

use crate::tokens::TokenEstimator;

/// Separator placed between formatted turns.
pub const TURN_SEPARATOR: &str = "\n\n---\n\n";

/// How far past the target a code-bearing turn may push a chunk.
pub const CODE_OVERFLOW_FACTOR: f64 = 1.5;

const CODE_FENCE: &str = "```";

/// Render one turn the way it appears in prompts: `[ROLE]: text`.
pub fn format_turn(turn: &Turn) -> String {
    format!("[{}]: {}", turn.role.label(), turn.text)
}

/// Render a full turn list as one transcript.
pub fn format_transcript(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(format_turn)
        .collect::<Vec<_>>()
        .join(TURN_SEPARATOR)
}

pub fn contains_code_fence(text: &str) -> bool {
    text.contains(CODE_FENCE)
}

/// Greedy chunker with a fixed target size.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    target_tokens: usize,
    estimator: TokenEstimator,
}

impl Chunker {
    pub fn new(target_tokens: usize, estimator: TokenEstimator) -> Self {
        Self {
            target_tokens: target_tokens.max(1),
            estimator,
        }
    }

    pub fn target_tokens(&self) -> usize {
        self.target_tokens
    }

    /// Token cost of a turn including its separator.
    pub fn turn_cost(&self, turn: &Turn) -> usize {
        self.estimator
            .estimate_chars(format_turn(turn).chars().count() + TURN_SEPARATOR.chars().count())
    }

    /// Partition `turns` into ordered, contiguous chunks covering every turn once.
    pub fn chunk(&self, turns: &[Turn]) -> Vec<Chunk> {
        let overflow_limit = (self.target_tokens as f64 * CODE_OVERFLOW_FACTOR) as usize;
        let mut chunks = Vec::new();
        let mut start = 0usize;
        let mut running = 0usize;
        let mut open = false;

        for (idx, turn) in turns.iter().enumerate() {
            let cost = self.turn_cost(turn);

            if !open {
                start = idx;
                running = cost;
                open = true;
                continue;
            }

            let fits = running + cost <= self.target_tokens;
            let absorb = contains_code_fence(&turn.text) && running < overflow_limit;

            if fits || absorb {
                running += cost;
            } else {
                chunks.push(self.build_chunk(chunks.len(), turns, start, idx - 1));
                start = idx;
                running = cost;
            }
        }

        if open {
            chunks.push(self.build_chunk(chunks.len(), turns, start, turns.len() - 1));
        }

        chunks
    }

    fn build_chunk(&self, index: usize, turns: &[Turn], start: usize, end: usize) -> Chunk {
        let content = format_transcript(&turns[start..=end]);
        let token_estimate = self.estimator.estimate(&content);
        Chunk {
            index,
            start_turn: start,
            end_turn: end,
            content,
            token_estimate,
        }
    }
}

/// Convenience wrapper around [`Chunker::chunk`].
pub fn chunk_turns(turns: &[Turn], target_tokens: usize, estimator: TokenEstimator) -> Vec<Chunk> {
    Chunker::new(target_tokens, estimator).chunk(turns)
}

/// Split free text into paragraph segments so it can be re-chunked.
///
/// Paragraphs break on blank lines, except inside fenced code blocks, which
/// always stay in one segment. Segments are attributed to the assistant.
pub fn segment_text(text: &str) -> Vec<Turn> {
    let mut segments = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut in_fence = false;

    for line in text.lines() {
        if line.trim_start().starts_with(CODE_FENCE) {
            in_fence = !in_fence;
        }
        if line.trim().is_empty() && !in_fence {
            if !current.is_empty() {
                segments.push(Turn::new(Role::Assistant, current.join("\n")));
                current.clear();
            }
            continue;
        }
        current.push(line);
    }
    if !current.is_empty() {
        segments.push(Turn::new(Role::Assistant, current.join("\n")));
    }

    segments
}
