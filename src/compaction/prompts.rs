//! Prompt text for the compaction passes.

pub const SYSTEM_PROMPT: &str = "You compress long AI-assistant conversations into compact, \
information-preserving reports. Keep decisions, conclusions, code identifiers, file paths, \
commands, error messages and open questions. Drop pleasantries and repetition. \
Never invent facts that are not in the conversation.";

const REPORT_SHAPE: &str = "Structure the report in markdown:\n\
# <short descriptive title>\n\
## Overview\n\
## Key Decisions\n\
## Technical Details\n\
## Code & Commands\n\
## Open Questions\n\
Omit a section only when there is nothing to put in it.";

/// Single call over the whole transcript.
pub fn full_context_prompt(title: Option<&str>, transcript: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str("Compact the following conversation into a single report.\n\n");
    if let Some(title) = title {
        prompt.push_str(&format!("Conversation title: {}\n\n", title));
    }
    prompt.push_str(REPORT_SHAPE);
    prompt.push_str("\n\n<conversation>\n");
    prompt.push_str(transcript);
    prompt.push_str("\n</conversation>");
    prompt
}

/// Per-chunk summary. `index` is 1-based.
pub fn map_prompt(index: usize, total: usize, content: &str) -> String {
    format!(
        "This is segment {index} of {total} of a longer conversation. Summarize this segment \
         only. Keep every decision, code identifier, file path, command and error message it \
         mentions, in the order they occur. Do not write an introduction or a conclusion; \
         later segments continue where this one stops.\n\n\
         <segment index=\"{index}\" total=\"{total}\">\n{content}\n</segment>"
    )
}

/// Combine ordered segment summaries into one report.
pub fn reduce_prompt(title: Option<&str>, summaries: &[String], pass: u32) -> String {
    let mut prompt = format!(
        "Combine the following {} segment summaries into one coherent report. The summaries \
         are in conversation order. Merge duplicates, keep the latest decision where later \
         segments revise earlier ones, and keep every concrete detail.\n\n",
        summaries.len()
    );
    if pass > 1 {
        prompt.push_str(
            "These summaries were produced from an earlier report that was still too long; \
             be more aggressive about merging.\n\n",
        );
    }
    if let Some(title) = title {
        prompt.push_str(&format!("Conversation title: {}\n\n", title));
    }
    prompt.push_str(REPORT_SHAPE);
    prompt.push_str("\n\n");
    for (i, summary) in summaries.iter().enumerate() {
        prompt.push_str(&format!(
            "<summary segment=\"{}\">\n{}\n</summary>\n\n",
            i + 1,
            summary.trim()
        ));
    }
    prompt
}
