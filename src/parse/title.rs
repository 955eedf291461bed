//! Title and heading extraction from markdown model output.

use crate::errors::ParseError;

const MAX_TITLE_CHARS: usize = 120;

/// A markdown ATX heading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    pub level: usize,
    pub text: String,
}

/// All ATX headings in `text`, skipping fenced code.
pub fn markdown_headings(text: &str) -> Vec<Heading> {
    let mut headings = Vec::new();
    let mut in_fence = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let level = trimmed.chars().take_while(|c| *c == '#').count();
        if level == 0 || level > 6 {
            continue;
        }
        let rest = &trimmed[level..];
        if !rest.starts_with(' ') {
            continue;
        }
        let text = rest.trim().trim_end_matches('#').trim();
        if !text.is_empty() {
            headings.push(Heading {
                level,
                text: text.to_string(),
            });
        }
    }

    headings
}

/// Parse a title from model output.
///
/// Accepts a `Title:` prefixed line, a markdown heading, or a bare first line.
/// Surrounding quotes and emphasis markers are stripped and the result is
/// capped at a fixed length on a char boundary.
pub fn parse_title(text: &str) -> Result<String, ParseError> {
    let raw = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or(ParseError::EmptyTitle)?;

    let raw = strip_prefix_ci(raw, "title:").unwrap_or(raw);
    let raw = raw.trim_start_matches('#').trim();
    let cleaned = raw
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '`')
        .trim();

    if cleaned.is_empty() {
        return Err(ParseError::EmptyTitle);
    }
    Ok(cleaned.chars().take(MAX_TITLE_CHARS).collect())
}

/// Title of a markdown report: its first heading.
pub fn report_title(report: &str) -> Option<String> {
    markdown_headings(report)
        .into_iter()
        .next()
        .and_then(|h| parse_title(&h.text).ok())
}

fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| text[prefix.len()..].trim())
}
