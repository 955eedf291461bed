//! JSON extraction and repair for model output.
//!
//! Models wrap JSON in prose, markdown fences, or cut it off mid-object when
//! they hit their output limit. Parsing is two-stage: a strict parse of the
//! extracted candidate, then a syntactic repair pass (trailing commas,
//! unterminated strings, unclosed brackets) followed by a second strict parse.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::ParseError;

/// A parsed value plus whether the repair pass was needed to get it.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub value: T,
    pub repaired: bool,
}

/// Locate the JSON payload inside `text`.
///
/// Prefers the body of a ```json fence, then falls back to the span starting
/// at the first `{` or `[`. When the payload is balanced, the span ends at the
/// matching close bracket; otherwise it runs to the end of the text.
pub fn extract_json_candidate(text: &str) -> Option<&str> {
    let body = fenced_body(text).unwrap_or(text);
    let start = body.find(['{', '['])?;
    let rest = &body[start..];
    let end = balanced_end(rest).unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn fenced_body(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let newline = after_open.find('\n')?;
    let lang = after_open[..newline].trim();
    if !(lang.is_empty() || lang.eq_ignore_ascii_case("json")) {
        return None;
    }
    let body = &after_open[newline + 1..];
    match body.find("```") {
        Some(close) => Some(&body[..close]),
        None => Some(body),
    }
}

/// Byte offset one past the bracket closing the value that opens `text`.
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(idx + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Best-effort syntactic repair of a JSON candidate.
pub fn repair_json(candidate: &str) -> String {
    let mut out = String::with_capacity(candidate.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in candidate.chars() {
        if in_string {
            out.push(ch);
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '{' => {
                stack.push('}');
                out.push(ch);
            }
            '[' => {
                stack.push(']');
                out.push(ch);
            }
            '}' | ']' => {
                strip_trailing_comma(&mut out);
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }

    if escaped {
        out.pop();
    }
    if in_string {
        out.push('"');
    }
    trim_dangling(&mut out);
    while let Some(close) = stack.pop() {
        strip_trailing_comma(&mut out);
        out.push(close);
    }
    out
}

fn strip_trailing_comma(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    if out[..trimmed_len].ends_with(',') {
        out.truncate(trimmed_len - 1);
    }
}

/// Drop a dangling `"key":` or `,` left behind by truncated output.
fn trim_dangling(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(':') {
        out.pop();
        let trimmed_len = out.trim_end().len();
        out.truncate(trimmed_len);
        if out.ends_with('"')
            && let Some(open) = out[..out.len() - 1].rfind('"')
        {
            out.truncate(open);
        }
    }
    strip_trailing_comma(out);
}

/// Strict parse of the extracted candidate, with no repair.
pub fn parse_json_strict(text: &str) -> Result<Value, ParseError> {
    let candidate = extract_json_candidate(text).ok_or(ParseError::NoJson)?;
    serde_json::from_str(candidate).map_err(|e| ParseError::InvalidJson {
        message: e.to_string(),
    })
}

/// Parse `text` as JSON, running the repair pass if the strict parse fails.
pub fn parse_json_value(text: &str) -> Result<Parsed<Value>, ParseError> {
    let candidate = extract_json_candidate(text).ok_or(ParseError::NoJson)?;
    match serde_json::from_str(candidate) {
        Ok(value) => Ok(Parsed {
            value,
            repaired: false,
        }),
        Err(strict_err) => {
            let repaired = repair_json(candidate);
            serde_json::from_str(&repaired)
                .map(|value| Parsed {
                    value,
                    repaired: true,
                })
                .map_err(|_| ParseError::InvalidJson {
                    message: strict_err.to_string(),
                })
        }
    }
}

/// Parse `text` into `T`, repairing syntax first when needed.
///
/// `schema` names the target shape in the error when the JSON is well formed
/// but does not deserialize into `T`.
pub fn parse_json<T: DeserializeOwned>(text: &str, schema: &str) -> Result<Parsed<T>, ParseError> {
    let Parsed { value, repaired } = parse_json_value(text)?;
    let value = serde_json::from_value(value).map_err(|e| ParseError::Schema {
        schema: schema.to_string(),
        message: e.to_string(),
    })?;
    Ok(Parsed { value, repaired })
}
