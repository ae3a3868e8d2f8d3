//! Token estimation and size budgets.
//!
//! Character-based heuristics stand in for a tokenizer when a provider
//! response carries no usage block:
//! - English prose: ~3.2 chars/token (conservative)
//! - JSON/structured content: ~2.8 chars/token

// ─── Constants ──────────────────────────────────────────────────────────────

/// Average characters per token for English prose.
const CHARS_PER_TOKEN_PROSE: f64 = 3.2;

/// Average characters per token for JSON/structured content.
const CHARS_PER_TOKEN_JSON: f64 = 2.8;

/// Marker appended to truncated tool results.
pub const TRUNCATION_MARKER: &str = "\n…[truncated]";

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// The first `max_chars` characters of `s`.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ─── Estimation ─────────────────────────────────────────────────────────────

pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as f64 / CHARS_PER_TOKEN_PROSE).ceil() as u64
}

pub fn estimate_json_tokens(json_text: &str) -> u64 {
    (json_text.chars().count() as f64 / CHARS_PER_TOKEN_JSON).ceil() as u64
}

// ─── Result Budget ──────────────────────────────────────────────────────────

/// Render a tool result for history, capped at `max_chars` characters.
///
/// Returns the text and whether it was cut.
pub fn render_tool_result(result: &serde_json::Value, max_chars: usize) -> (String, bool) {
    let text = match result {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= max_chars {
        return (text, false);
    }
    let mut cut = truncate_chars(&text, max_chars).to_string();
    cut.push_str(TRUNCATION_MARKER);
    (cut, true)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
