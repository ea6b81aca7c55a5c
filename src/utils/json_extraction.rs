//! JSON extraction from free-form model replies.
//!
//! Generation endpoints are asked for a single JSON object, but replies often
//! arrive wrapped in markdown fences or preceded by prose. Extraction tries,
//! in order:
//! 1. The whole reply as JSON
//! 2. A ```json fenced block
//! 3. Any fenced block containing an object
//! 4. The largest balanced object in the reply, preferring later ones
//!
//! ```
//! use story_forge::utils::json_extraction::extract_json_value;
//!
//! let reply = "Sure! ```json\n{\"verdict\": \"APPROVED\"}\n```";
//! let value = extract_json_value(reply).expect("object present");
//! assert_eq!(value["verdict"], "APPROVED");
//! ```

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Why no JSON value could be pulled out of a reply.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed_braces} unclosed braces. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed_braces: usize,
    },
    #[error("No JSON content found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
}

fn json_fence() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```json\s*\n?([\s\S]*?)\n?```").ok())
        .as_ref()
}

fn any_fence() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```").ok())
        .as_ref()
}

/// Returns the first `len` characters of `s`, respecting char boundaries.
fn preview(s: &str, len: usize) -> String {
    s.chars().take(len).collect()
}

/// Finds the index of the `}` matching the `{` at the start of `s`.
///
/// String literals and escapes are honored.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Counts braces left open at the end of `s`.
fn unclosed_braces(s: &str) -> usize {
    let mut depth: isize = 0;
    let mut in_string = false;
    let mut escape_next = false;
    for c in s.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }
    depth.max(0) as usize
}

fn parse_object(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn from_fence(re: Option<&Regex>, content: &str) -> Option<Value> {
    re?.captures_iter(content).find_map(|caps| {
        let block = caps.get(1)?.as_str().trim();
        let start = block.find('{')?;
        let end = find_matching_brace(&block[start..])?;
        parse_object(&block[start..=start + end])
    })
}

/// The largest valid object in `content`; ties go to the later one.
fn largest_object(content: &str) -> Option<Value> {
    content
        .char_indices()
        .filter(|(_, c)| *c == '{')
        .filter_map(|(start, _)| {
            let end = find_matching_brace(&content[start..])?;
            let candidate = &content[start..=start + end];
            parse_object(candidate).map(|value| (start, candidate.len(), value))
        })
        .max_by(|(pos_a, len_a, _), (pos_b, len_b, _)| len_a.cmp(len_b).then(pos_a.cmp(pos_b)))
        .map(|(_, _, value)| value)
}

/// Extracts a single JSON object from a model reply.
pub fn extract_json_value(content: &str) -> Result<Value, JsonExtractionError> {
    let trimmed = content.trim();

    if let Some(value) = parse_object(trimmed) {
        return Ok(value);
    }
    if let Some(value) = from_fence(json_fence(), trimmed) {
        return Ok(value);
    }
    if let Some(value) = from_fence(any_fence(), trimmed) {
        return Ok(value);
    }
    if let Some(value) = largest_object(trimmed) {
        return Ok(value);
    }

    if let Some(start) = trimmed.find('{') {
        let partial = &trimmed[start..];
        let open = unclosed_braces(partial);
        if open > 0 {
            return Err(JsonExtractionError::Truncated {
                partial_preview: preview(partial, 100),
                unclosed_braces: open,
            });
        }
    }

    Err(JsonExtractionError::NotFound {
        content_preview: preview(trimmed, 50),
    })
}
