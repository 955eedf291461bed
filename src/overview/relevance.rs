//! Per-section source selection.
//!
//! Every section gets its own slice of the transcript, capped at a token
//! budget that depends on the section's importance. Candidates are ranked:
//!
//! 1. turns the outline cites for this section,
//! 2. every other turn.
//!
//! Within each group, turns cited by more (and more important) sections rank
//! first, ties broken by position. Selection is greedy: a turn that does not
//! fit is skipped and the next one is tried.

use std::collections::HashMap;

use condense_common::{Outline, OutlineSection, Turn};

use crate::chunking::format_turn;
use crate::tokens::TokenEstimator;

/// One turn chosen for a section, possibly cut to fit.
#[derive(Debug, Clone, PartialEq)]
pub struct Excerpt {
    pub index: usize,
    pub text: String,
    pub truncated: bool,
}

/// Turn weights derived from an outline: the summed importance of every
/// section citing the turn.
#[derive(Debug, Clone, Default)]
pub struct RelevanceIndex {
    weights: HashMap<usize, u32>,
}

impl RelevanceIndex {
    pub fn new(outline: &Outline) -> Self {
        let mut weights = HashMap::new();
        for section in &outline.sections {
            for &index in &section.relevant_turn_indices {
                *weights.entry(index).or_insert(0) += section.importance.weight();
            }
        }
        Self { weights }
    }

    pub fn weight(&self, index: usize) -> u32 {
        self.weights.get(&index).copied().unwrap_or(0)
    }

    /// Candidate order for `section` over `turn_count` turns.
    pub fn ranked(&self, section: &OutlineSection, turn_count: usize) -> Vec<usize> {
        let mut cited: Vec<usize> = section
            .relevant_turn_indices
            .iter()
            .copied()
            .filter(|&i| i < turn_count)
            .collect();
        cited.sort_unstable();
        cited.dedup();

        let mut rest: Vec<usize> = (0..turn_count)
            .filter(|i| cited.binary_search(i).is_err())
            .collect();

        let by_weight = |a: &usize, b: &usize| self.weight(*b).cmp(&self.weight(*a)).then(a.cmp(b));
        cited.sort_by(by_weight);
        rest.sort_by(by_weight);

        cited.extend(rest);
        cited
    }

    /// Pick turns for `section` within `budget` tokens, returned in
    /// conversation order.
    ///
    /// If not even the top-ranked turn fits, it is truncated to the budget so
    /// a section never starts with no source at all.
    pub fn select(
        &self,
        turns: &[Turn],
        section: &OutlineSection,
        budget: usize,
        estimator: &TokenEstimator,
    ) -> Vec<Excerpt> {
        let ranked = self.ranked(section, turns.len());
        let mut used = 0usize;
        let mut picked: Vec<Excerpt> = Vec::new();

        for &index in &ranked {
            let text = format_turn(&turns[index]);
            let cost = estimator.estimate(&text);
            if used + cost > budget {
                continue;
            }
            used += cost;
            picked.push(Excerpt {
                index,
                text,
                truncated: false,
            });
            if used >= budget {
                break;
            }
        }

        if picked.is_empty()
            && let Some(&index) = ranked.first()
        {
            let text = format_turn(&turns[index]);
            picked.push(Excerpt {
                index,
                text: estimator.truncate_to_budget(&text, budget).to_string(),
                truncated: true,
            });
        }

        picked.sort_by_key(|e| e.index);
        picked
    }
}

/// Render excerpts for a prompt, keeping the original turn numbers so the
/// model can cite them.
pub fn render_excerpts(excerpts: &[Excerpt]) -> String {
    let mut out = String::new();
    for excerpt in excerpts {
        out.push_str(&format!("<turn index=\"{}\">\n", excerpt.index));
        out.push_str(&excerpt.text);
        if excerpt.truncated {
            out.push_str("\n[...truncated]");
        }
        out.push_str("\n</turn>\n");
    }
    out
}
