//! Prompt-injection scanning and prompt-boundary sanitisation.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::patterns::CompiledPatterns;
use crate::usage::UsageTracker;

/// Outcome of an injection scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionScan {
    pub flagged: bool,
    /// Names of every pattern that matched, in table order.
    pub matched_patterns: Vec<String>,
}

fn scan(text: &str, tables: &[&[(String, Regex)]]) -> InjectionScan {
    let mut matched: Vec<String> = Vec::new();
    for table in tables {
        for (name, re) in table.iter() {
            if re.is_match(text) && !matched.contains(name) {
                matched.push(name.clone());
            }
        }
    }
    InjectionScan {
        flagged: !matched.is_empty(),
        matched_patterns: matched,
    }
}

/// Scan text against the general injection table.
pub fn detect_injection_patterns(text: &str, patterns: &CompiledPatterns) -> InjectionScan {
    scan(text, &[&patterns.injection])
}

/// Scan text destined for persistent memory against both tables.
pub fn detect_memory_injection(text: &str, patterns: &CompiledPatterns) -> InjectionScan {
    scan(text, &[&patterns.injection, &patterns.memory_injection])
}

// ─── Memory Write Guard ──────────────────────────────────────────────────────

/// Verdict on a memory write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryGuardResult {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub matched_patterns: Vec<String>,
}

/// Block memory writes that carry injection-shaped directives.
///
/// A block is counted under the `memoryWriteBlocks` usage stat.
pub fn guard_memory_write_core(
    content: &str,
    page: &str,
    action: &str,
    patterns: &CompiledPatterns,
    usage: &UsageTracker,
) -> MemoryGuardResult {
    let scan = detect_memory_injection(content, patterns);
    if !scan.flagged {
        return MemoryGuardResult {
            allowed: true,
            reason: None,
            matched_patterns: Vec::new(),
        };
    }

    tracing::warn!(
        page = %page,
        action = %action,
        patterns = ?scan.matched_patterns,
        "blocked memory write with injection patterns"
    );
    usage.record_usage_stat("memoryWriteBlocks", None);

    MemoryGuardResult {
        allowed: false,
        reason: Some(format!(
            "Memory {action} to \"{page}\" was blocked: the content looks like an instruction \
             to change assistant behaviour ({}). Rephrase it as a plain fact or preference.",
            scan.matched_patterns.join(", ")
        )),
        matched_patterns: scan.matched_patterns,
    }
}

// ─── Prompt Boundary Sanitisation ────────────────────────────────────────────

static BOUNDARY_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)<\s*/?\s*\|?\s*(system|human|assistant|user|tool_use|tool_result|function_call|function_response|instructions|prompt|messages|anthropic|openai|im_start|im_end|endoftext)\b[^<>]*>",
    )
    .expect("valid boundary tag regex")
});

/// Defang chat-boundary tags in user-supplied content.
///
/// `<system>`, `</tool_result>`, `<|im_start|>` and friends have their angle
/// brackets swapped for fullwidth `＜` `＞`; all other text is untouched.
pub fn sanitise_user_content_for_prompt(text: &str) -> String {
    BOUNDARY_TAG_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            caps[0].replace('<', "＜").replace('>', "＞")
        })
        .into_owned()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
