//! XML-like tag and fenced-block extraction.
//!
//! Section responses come back as loosely tagged text:
//!
//! ```text
//! <content>
//! ## Setup
//! ...
//! </content>
//! <citations>[3, 7]</citations>
//! ```
//!
//! Models occasionally drop the closing tag when they run out of output
//! budget. The repair rule is: an unclosed tag runs until the next opening tag
//! or the end of the text.

use regex::Regex;

use crate::errors::ParseError;

fn open_tag(tag: &str) -> String {
    format!("<{}>", tag)
}

fn close_tag(tag: &str) -> String {
    format!("</{}>", tag)
}

/// Extract the body of the first `<tag>...</tag>` block, trimmed.
pub fn extract_tag(text: &str, tag: &str) -> Result<String, ParseError> {
    let open = open_tag(tag);
    let close = close_tag(tag);
    let missing = || ParseError::MissingTag {
        tag: tag.to_string(),
    };

    let start = text.find(&open).ok_or_else(missing)? + open.len();
    let rest = &text[start..];

    let end = match rest.find(&close) {
        Some(end) => end,
        None => next_open_tag(rest).unwrap_or(rest.len()),
    };
    Ok(rest[..end].trim().to_string())
}

/// Like [`extract_tag`], but a missing tag yields `None`.
pub fn extract_optional_tag(text: &str, tag: &str) -> Option<String> {
    extract_tag(text, tag).ok().filter(|body| !body.is_empty())
}

/// Every closed `<tag>...</tag>` block, in order.
pub fn extract_all_tags(text: &str, tag: &str) -> Vec<String> {
    let pattern = format!(
        r"(?s)<{t}>(.*?)</{t}>",
        t = regex::escape(tag)
    );
    match Regex::new(&pattern) {
        Ok(re) => re
            .captures_iter(text)
            .filter_map(|cap| cap.get(1))
            .map(|m| m.as_str().trim().to_string())
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn next_open_tag(text: &str) -> Option<usize> {
    let re = Regex::new(r"<[A-Za-z][A-Za-z0-9_-]*>").ok()?;
    re.find(text).map(|m| m.start())
}

/// Bodies of every fenced block with the given info string (e.g. `mermaid`).
///
/// An unterminated final fence is kept when it has content.
pub fn extract_fenced_blocks(text: &str, lang: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        match current.as_mut() {
            None => {
                if let Some(info) = trimmed.strip_prefix("```")
                    && info.trim().eq_ignore_ascii_case(lang)
                {
                    current = Some(Vec::new());
                }
            }
            Some(lines) => {
                if trimmed == "```" {
                    blocks.push(lines.join("\n"));
                    current = None;
                } else {
                    lines.push(line);
                }
            }
        }
    }

    if let Some(lines) = current
        && !lines.is_empty()
    {
        blocks.push(lines.join("\n"));
    }

    blocks
        .into_iter()
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .collect()
}

/// Parse turn indices out of a citation list such as `[3, 7]` or `3, 7, 12`.
///
/// Non-numeric tokens are ignored.
pub fn parse_index_list(text: &str) -> Vec<usize> {
    let mut indices: Vec<usize> = text
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}
