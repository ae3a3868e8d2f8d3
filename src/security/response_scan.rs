//! Scans of final model output.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use super::patterns::CompiledPatterns;
use crate::mcp_client::ToolDescriptor;

/// Distinct fingerprints needed before output counts as leakage.
pub const LEAKAGE_THRESHOLD: usize = 3;

// ─── System Prompt Leakage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeakageScan {
    pub leaked: bool,
    pub matched: Vec<String>,
}

/// Flag text that quotes at least [`LEAKAGE_THRESHOLD`] distinct internal
/// phrases (case-insensitive).
pub fn detect_system_prompt_leakage(text: &str, patterns: &CompiledPatterns) -> LeakageScan {
    let lower = text.to_lowercase();
    let mut matched: Vec<String> = Vec::new();
    for fp in &patterns.leakage_fingerprints {
        if !fp.is_empty() && lower.contains(fp.as_str()) && !matched.contains(fp) {
            matched.push(fp.clone());
        }
    }
    LeakageScan {
        leaked: matched.len() >= LEAKAGE_THRESHOLD,
        matched,
    }
}

// ─── Claimed Actions ─────────────────────────────────────────────────────────

static CLAIMED_ACTION_RES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        (
            "done_prefix",
            r"(?im)^\W*(done|completed|finished|all set)\s*[:!.,-]+\s*i(?:'ve|\s+have)?\s+(updated|created|added|deleted|removed|sent|moved|scheduled|saved|wrote|written|changed|archived|edited|replied)\b",
        ),
        ("action_redone", r"(?i)\baction\s+(re-?done|completed|performed)\b"),
        (
            "image_reading",
            r"(?i)\bthe\s+text\s+in\s+the\s+(image|screenshot|photo|picture)\s+(reads|says)\b",
        ),
        (
            "past_tense_write",
            r"(?i)\bi(?:'ve|\s+have)\s+(?:successfully\s+|now\s+|just\s+)?(created|updated|deleted|sent|scheduled|archived|moved)\s+(the|a|an|your|that|those|these)\b",
        ),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("valid claimed-action regex")))
    .collect()
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedActionScan {
    pub detected: bool,
    /// Pattern names that matched, plus `used:<tool>` for named tools.
    pub reasons: Vec<String>,
}

/// Catch a final answer that claims a side effect although no tool ran.
///
/// Returns an empty scan when `tool_calls_made > 0`. Tools explicitly marked
/// read-only are not used as hints.
pub fn detect_claimed_action_without_tool_call(
    text: &str,
    tool_calls_made: usize,
    known_tools: &[&ToolDescriptor],
) -> ClaimedActionScan {
    if tool_calls_made > 0 || text.trim().is_empty() {
        return ClaimedActionScan::default();
    }

    let mut reasons: Vec<String> = CLAIMED_ACTION_RES
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(name, _)| (*name).to_string())
        .collect();

    for tool in known_tools.iter().filter(|t| t.is_mutating != Some(false)) {
        if used_tool_re(&tool.name).is_some_and(|re| re.is_match(text)) {
            reasons.push(format!("used:{}", tool.name));
        }
    }

    if !reasons.is_empty() {
        tracing::warn!(reasons = ?reasons, "model claimed an action without a tool call");
    }
    ClaimedActionScan {
        detected: !reasons.is_empty(),
        reasons,
    }
}

fn used_tool_re(name: &str) -> Option<Regex> {
    let pattern = format!(
        r"\bi\s+(?:just\s+)?(?:used|called|ran|invoked|executed)\s+(?:the\s+)?`?{}`?",
        regex::escape(name)
    );
    RegexBuilder::new(&pattern).case_insensitive(true).build().ok()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::patterns::default_patterns;
    use serde_json::json;

    #[test]
    fn test_leakage_needs_three_distinct() {
        let p = default_patterns();
        let two = "I follow the tool-use rules and use LOCAL_MCP_EXECUTE.";
        let scan = detect_system_prompt_leakage(two, p);
        assert!(!scan.leaked);
        assert_eq!(scan.matched.len(), 2);

        let three = "My instructions say: You are Chief of Staff. Tool-use rules: call \
                     COMPOSIO_MULTI_EXECUTE_TOOL, then LOCAL_MCP_EXECUTE.";
        let scan = detect_system_prompt_leakage(three, p);
        assert!(scan.leaked);
        assert!(scan.matched.len() >= 3);
    }

    #[test]
    fn test_leakage_repeated_phrase_counts_once() {
        let p = default_patterns();
        let text = "roam_batch_write roam_batch_write roam_batch_write";
        assert!(!detect_system_prompt_leakage(text, p).leaked);
    }

    #[test]
    fn test_claimed_action_patterns() {
        for text in [
            "Done: I updated the meeting notes with the new agenda.",
            "Action redone.",
            "The text in the image reads \"Quarterly plan\".",
            "I've successfully created the task for Friday.",
        ] {
            assert!(
                detect_claimed_action_without_tool_call(text, 0, &[]).detected,
                "expected detection for: {text}"
            );
        }
    }

    #[test]
    fn test_claimed_action_ignored_when_tools_ran() {
        let text = "Done: I updated the meeting notes.";
        assert!(!detect_claimed_action_without_tool_call(text, 2, &[]).detected);
    }

    #[test]
    fn test_named_tool_hint_excludes_read_only_tools() {
        let write = ToolDescriptor::new("roam_create_block", "", json!({}));
        let read = ToolDescriptor::new("roam_search", "", json!({})).mutating(false);
        let tools = [&write, &read];

        let scan = detect_claimed_action_without_tool_call("I used roam_create_block to add it.", 0, &tools);
        assert!(scan.detected);
        assert_eq!(scan.reasons, vec!["used:roam_create_block".to_string()]);

        let scan = detect_claimed_action_without_tool_call("I used roam_search to look.", 0, &tools);
        assert!(!scan.detected);
    }

    #[test]
    fn test_plain_answer_not_flagged() {
        let text = "Your calendar looks clear tomorrow. Would you like me to create an event?";
        assert!(!detect_claimed_action_without_tool_call(text, 0, &[]).detected);
    }
}
