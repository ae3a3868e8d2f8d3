//! Parsing helpers for possibly-polluted model output.
//!
//! Models regularly wrap JSON in prose, append commentary after a closing
//! brace, or emit slightly malformed argument strings. The helpers here:
//!
//! 1. **Balanced extraction**: walk the text and return every balanced
//!    `{...}` span that parses as JSON, with its byte offsets.
//! 2. **Text tool calls**: recover `{"name": ..., "arguments": ...}` objects
//!    a model wrote into its text instead of the native tool-call channel.
//! 3. **Repair**: fix the malformations seen in practice (trailing commas,
//!    missing closing braces, stray control characters).

use serde::Serialize;
use uuid::Uuid;

use super::types::ToolCall;

// ─── Balanced Extraction ─────────────────────────────────────────────────────

/// A JSON object found inside a larger string.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedJson {
    pub parsed: serde_json::Value,
    /// Byte offset of the opening `{`.
    pub start: usize,
    /// Byte offset one past the closing `}`.
    pub end: usize,
}

/// Extract every balanced, parseable JSON object from `raw`.
///
/// Braces inside JSON strings (including escaped quotes) are ignored while
/// tracking depth. A balanced span that fails to parse is skipped and the
/// scan resumes after it. An unterminated `{` is skipped and the scan
/// resumes at the next byte, so a stray brace in prose does not hide a later
/// object.
pub fn extract_balanced_json_objects(raw: &str) -> Vec<ExtractedJson> {
    let bytes = raw.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }

        let Some(close) = find_matching_brace(bytes, i) else {
            i += 1;
            continue;
        };

        let span = &raw[i..=close];
        match serde_json::from_str::<serde_json::Value>(span) {
            Ok(parsed) => found.push(ExtractedJson {
                parsed,
                start: i,
                end: close + 1,
            }),
            Err(e) => {
                tracing::debug!(start = i, end = close + 1, error = %e, "skipping unparseable JSON span");
            }
        }
        i = close + 1;
    }

    found
}

/// Find the `}` matching the `{` at `start`, ignoring braces inside strings.
fn find_matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the first JSON object in `raw`, tolerating leading and trailing prose.
pub fn parse_first_json_object(raw: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(raw.trim()) {
        if v.is_object() {
            return Some(v);
        }
    }
    extract_balanced_json_objects(raw)
        .into_iter()
        .next()
        .map(|e| e.parsed)
}

// ─── Text Tool Calls ─────────────────────────────────────────────────────────

/// Recover tool calls that a model wrote as JSON inside its text response.
///
/// Accepts `{"name": ..., "arguments": {...}}` (also `input` / `parameters`)
/// and the nested `{"function": {"name": ..., "arguments": ...}}` shape.
/// String-encoded arguments are parsed, with repair on failure.
pub fn parse_text_tool_calls(text: &str) -> Vec<ToolCall> {
    extract_balanced_json_objects(text)
        .into_iter()
        .filter_map(|e| tool_call_from_object(&e.parsed))
        .collect()
}

fn tool_call_from_object(value: &serde_json::Value) -> Option<ToolCall> {
    let obj = value.get("function").unwrap_or(value);
    let name = obj.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }

    let raw_args = ["arguments", "input", "parameters"]
        .iter()
        .find_map(|k| obj.get(*k))?;

    let arguments = match raw_args {
        serde_json::Value::Object(_) => raw_args.clone(),
        serde_json::Value::String(s) => repair_malformed_tool_call_json(s)?,
        _ => return None,
    };

    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));

    Some(ToolCall {
        id,
        name: name.to_string(),
        arguments,
    })
}

// ─── Malformed JSON Repair ──────────────────────────────────────────────────

/// Attempt to repair malformed JSON arguments from a model tool call.
///
/// Returns `Some(value)` if the input parses as-is or after repair,
/// `None` if irreparable. Empty input is treated as `{}`.
pub fn repair_malformed_tool_call_json(raw: &str) -> Option<serde_json::Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(serde_json::Value::Object(serde_json::Map::new()));
    }
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(v);
    }

    let mut repaired = repair_trailing_commas(trimmed);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&repaired) {
        return Some(v);
    }

    repaired = repair_unbalanced_braces(&repaired);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&repaired) {
        return Some(v);
    }

    repaired = repair_control_characters(&repaired);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&repaired) {
        return Some(v);
    }

    // Prose around an otherwise valid object.
    parse_first_json_object(trimmed)
}

/// Remove trailing commas before `}` or `]`.
fn repair_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut result = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }
        result.push(chars[i]);
        i += 1;
    }

    result
}

/// Append closing braces to balance unmatched opening braces.
fn repair_unbalanced_braces(input: &str) -> String {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for ch in input.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }

    let mut result = input.to_string();
    for _ in 0..depth.max(0) {
        result.push('}');
    }
    result
}

/// Remove control characters other than `\n`, `\r`, `\t`.
fn repair_control_characters(input: &str) -> String {
    input
        .chars()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\r' || c == '\t')
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
