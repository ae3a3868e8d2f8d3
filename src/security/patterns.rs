//! Security data tables and their compiled form.
//!
//! The tables are plain data. [`PatternConfig`] carries them (defaults from
//! this module, optionally overridden from YAML) and [`CompiledPatterns`] is
//! the compiled, ready-to-match form every scanner takes by reference.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};

use crate::config::{ConfigError, NamedPattern, PatternConfig};

// ─── Default Tables ──────────────────────────────────────────────────────────

const INJECTION: &[(&str, &str)] = &[
    (
        "ignore_previous",
        r"\b(ignore|disregard|forget)\s+(all\s+)?(the\s+)?(previous|prior|above|earlier)\s+(instructions|prompts|rules|directions)",
    ),
    ("you_are_now", r"\byou\s+are\s+now\s+(a|an|the|in)\b"),
    (
        "act_as",
        r"\b(act|pretend)\s+(as|to\s+be)\s+(an?\s+)?(unrestricted|jailbroken|different|new|admin|system|root)\b",
    ),
    ("new_instructions", r"\bnew\s+(system\s+)?instructions?\s*:"),
    ("system_prompt_override", r"\bsystem\s+(prompt|message)\s*(override|:)"),
    ("admin_override", r"\b(admin|administrator|developer)\s+(override|mode|access)\b"),
    ("emergency_override", r"\bemergency\s+(override|protocol|mode)\b"),
    (
        "begin_response_with",
        r"\b(begin|start)\s+(your\s+)?(response|reply|answer)\s+with\b",
    ),
    ("hidden_text", r"\b(hidden|invisible)\s+(text|instructions?|message)\b"),
    (
        "must_call_tool",
        r"\byou\s+must\s+(call|use|invoke|run)\s+(the\s+)?(\w+\s+)?tool\b",
    ),
    (
        "send_to_url",
        r"\b(send|post|forward|upload|exfiltrate)\b[^.\n]{0,60}\bto\s+https?://",
    ),
    (
        "do_not_tell_user",
        r"\b(do\s+not|don't|never)\s+(tell|inform|alert|notify)\s+the\s+user\b",
    ),
    (
        "reveal_system_prompt",
        r"\b(reveal|print|output|repeat)\s+(your\s+)?(system\s+prompt|hidden\s+prompt|initial\s+instructions)\b",
    ),
];

const MEMORY_INJECTION: &[(&str, &str)] = &[
    (
        "always_directive",
        r"\balways\s+(skip|ignore|approve|send|execute|run|call|forward|delete|bypass|allow|trust|include|respond|reply)\b",
    ),
    (
        "never_directive",
        r"\bnever\s+(ask|request|require|check|confirm|verify|mention|tell|show|prompt|warn)\b",
    ),
    (
        "default_behaviour",
        r"\b(by\s+default|default\s+behaviou?r)\b[^.\n]{0,40}\b(should|must|is\s+to|will)\b",
    ),
    (
        "skip_approval",
        r"\b(skip|bypass|disable|ignore|without)\s+(the\s+|any\s+|all\s+)?(approval|confirmation|permission|consent)s?\b",
    ),
    ("pre_approved", r"\b(pre-?approved|auto-?approved|already\s+approved)\b"),
    (
        "when_you_see",
        r"\bwhen(ever)?\s+you\s+(see|encounter|read|receive|notice)\b",
    ),
    (
        "secret_instruction",
        r"\b(secret|hidden|covert)\s+(instruction|directive|command|rule)s?\b",
    ),
    ("on_trigger", r"\b(on|upon)\s+trigger\b|\btrigger\s+(word|phrase)\b"),
    (
        "send_data_to",
        r"\b(send|forward|post|upload|share|transmit)\s+(all\s+|the\s+|any\s+)?(data|notes|contents?|information|memory|memories|credentials|keys)\s+to\b",
    ),
    (
        "include_in_response",
        r"\b(include|insert|append|embed)\b[^.\n]{0,40}\bin\s+(every|all|each|your)\s+(responses?|repl(y|ies)|answers?|outputs?)\b",
    ),
    (
        "tool_override",
        r"\b(override|replace|redefine)\s+(the\s+)?(\w+\s+)?tool\b|\btool\s+override\b",
    ),
    (
        "capability_grant",
        r"\byou\s+(now\s+)?(have|are\s+granted|are\s+allowed|are\s+permitted)\s+(full\s+|unrestricted\s+|admin\s+|root\s+)?(access|permissions?|capabilit(y|ies))\b",
    ),
    (
        "ignore_safety",
        r"\b(ignore|disable|turn\s+off|bypass)\s+(all\s+)?(safety|security|guardrails?|filters?|restrictions)\b",
    ),
];

/// Phrases from the assistant's internal instructions.
pub const LEAKAGE_FINGERPRINTS: &[&str] = &[
    "you are chief of staff",
    "chief of staff/memory",
    "chief of staff/skills",
    "cos_update_memory",
    "cos_get_skill",
    "composio_multi_execute_tool",
    "local_mcp_execute",
    "local_mcp_route",
    "tool-use rules",
    "approval gating",
    "untrusted content boundary",
    "never fabricate tool results",
    "scoped page approval",
    "roam_batch_write",
];

/// Tokens that mark a Composio slug as a read.
pub const READ_ONLY_SLUG_TOKENS: &[&str] = &[
    "GET", "LIST", "SEARCH", "FIND", "FETCH", "READ", "QUERY", "LOOKUP", "RETRIEVE", "VIEW",
    "DESCRIBE", "DETAILS", "SHOW",
];

/// Tokens that disqualify a Composio slug from being a read.
pub const WRITE_SLUG_TOKENS: &[&str] = &[
    "DELETE", "REMOVE", "SEND", "CREATE", "UPDATE", "MODIFY", "WRITE", "POST", "TRASH", "MOVE",
    "EXECUTE",
];

/// The short read set accepted for external-extension tools.
pub const EXTENSION_READ_ONLY_TOKENS: &[&str] = &["GET", "LIST", "SEARCH", "FETCH", "STATUS", "CHECK"];

/// The extended read set accepted for local MCP tools.
pub const LOCAL_MCP_READ_ONLY_TOKENS: &[&str] = &[
    "GET", "LIST", "SEARCH", "FIND", "FETCH", "READ", "QUERY", "LOOKUP", "RETRIEVE", "VIEW",
    "DESCRIBE", "DETAILS", "SHOW", "STATUS", "CHECK", "COUNT", "INFO", "STATS", "EXPORT",
];

/// Tokens that make an otherwise unclassified tool mutating.
pub const SENSITIVE_TOKENS: &[&str] = &[
    "CREATE", "MODIFY", "UPDATE", "DELETE", "REMOVE", "SEND", "POST", "WRITE", "MUTATE",
    "DISCONNECT", "CONNECT", "EXECUTE",
];

/// Composio slugs that are always safe to run without a prompt.
pub const SAFE_COMPOSIO_SLUGS: &[&str] = &[
    "COMPOSIO_SEARCH_TOOLS",
    "COMPOSIO_GET_TOOL_SCHEMAS",
    "COMPOSIO_CHECK_ACTIVE_CONNECTION",
    "COMPOSIO_LIST_TOOLKITS",
];

/// Tools callable while dispatching in read-only mode.
pub const READ_ONLY_TOOL_ALLOWLIST: &[&str] = &[
    "roam_search",
    "roam_search_text",
    "roam_get_page",
    "roam_get_block",
    "roam_get_backlinks",
    "roam_get_daily_page",
    "cos_get_current_time",
    "cos_get_skill",
    "cos_list_skills",
    "COMPOSIO_SEARCH_TOOLS",
    "COMPOSIO_GET_TOOL_SCHEMAS",
];

pub fn default_injection_patterns() -> Vec<NamedPattern> {
    INJECTION.iter().map(|(n, p)| NamedPattern::new(n, p)).collect()
}

pub fn default_memory_injection_patterns() -> Vec<NamedPattern> {
    MEMORY_INJECTION
        .iter()
        .map(|(n, p)| NamedPattern::new(n, p))
        .collect()
}

// ─── Compiled Form ───────────────────────────────────────────────────────────

/// Pattern tables compiled for matching. Token lists are upper-cased,
/// fingerprints lower-cased.
#[derive(Debug, Clone, Default)]
pub struct CompiledPatterns {
    pub injection: Vec<(String, Regex)>,
    pub memory_injection: Vec<(String, Regex)>,
    pub leakage_fingerprints: Vec<String>,
    pub read_only_slug_tokens: Vec<String>,
    pub write_slug_tokens: Vec<String>,
    pub extension_read_only_tokens: Vec<String>,
    pub local_mcp_read_only_tokens: Vec<String>,
    pub sensitive_tokens: Vec<String>,
    pub safe_slugs: HashSet<String>,
    pub read_only_allowlist: HashSet<String>,
}

impl CompiledPatterns {
    /// Compile every table. Regexes are case-insensitive.
    pub fn compile(config: &PatternConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            injection: compile_named(&config.injection)?,
            memory_injection: compile_named(&config.memory_injection)?,
            leakage_fingerprints: config
                .leakage_fingerprints
                .iter()
                .map(|f| f.to_lowercase())
                .collect(),
            read_only_slug_tokens: upper(&config.read_only_slug_tokens),
            write_slug_tokens: upper(&config.write_slug_tokens),
            extension_read_only_tokens: upper(&config.extension_read_only_tokens),
            local_mcp_read_only_tokens: upper(&config.local_mcp_read_only_tokens),
            sensitive_tokens: upper(&config.sensitive_tokens),
            safe_slugs: config.safe_slugs.iter().map(|s| s.to_uppercase()).collect(),
            read_only_allowlist: config.read_only_allowlist.iter().cloned().collect(),
        })
    }

    /// Whether a Composio slug passes the read-only slug heuristic: it carries
    /// at least one read token and no write token.
    pub fn is_read_only_slug(&self, slug: &str) -> bool {
        has_any_token(slug, &self.read_only_slug_tokens)
            && !has_any_token(slug, &self.write_slug_tokens)
    }
}

fn compile_named(patterns: &[NamedPattern]) -> Result<Vec<(String, Regex)>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(&p.pattern)
                .case_insensitive(true)
                .build()
                .map(|re| (p.name.clone(), re))
                .map_err(|e| ConfigError::Invalid {
                    reason: format!("pattern '{}' does not compile: {e}", p.name),
                })
        })
        .collect()
}

fn upper(items: &[String]) -> Vec<String> {
    items.iter().map(|s| s.to_uppercase()).collect()
}

/// The compiled built-in tables, shared process-wide.
pub fn default_patterns() -> &'static CompiledPatterns {
    static DEFAULT: OnceLock<CompiledPatterns> = OnceLock::new();
    DEFAULT.get_or_init(|| {
        CompiledPatterns::compile(&PatternConfig::default()).unwrap_or_else(|e| {
            tracing::error!(error = %e, "built-in pattern tables failed to compile");
            CompiledPatterns::default()
        })
    })
}

// ─── Token Matching ──────────────────────────────────────────────────────────

/// Split a tool name into upper-cased alphanumeric tokens.
///
/// Underscores, hyphens, dots and every other non-alphanumeric character are
/// boundaries, so `GMAIL_FETCH_EMAILS` yields `GMAIL`, `FETCH`, `EMAILS`.
pub fn name_tokens(name: &str) -> impl Iterator<Item = String> + '_ {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_uppercase())
}

/// Whether `name` contains any of the (upper-case) `tokens` as a whole token.
pub fn has_any_token(name: &str, tokens: &[String]) -> bool {
    name_tokens(name).any(|t| tokens.iter().any(|tok| *tok == t))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tables_compile() {
        let p = default_patterns();
        assert_eq!(p.injection.len(), 13);
        assert_eq!(p.memory_injection.len(), 13);
        assert!(!p.leakage_fingerprints.is_empty());
    }

    #[test]
    fn test_token_boundaries_are_non_alphanumeric() {
        let tokens = vec!["GET".to_string()];
        assert!(has_any_token("roam_get_page", &tokens));
        assert!(has_any_token("linear.get-issue", &tokens));
        assert!(!has_any_token("target_budget", &tokens));
        assert!(!has_any_token("GETTER", &tokens));
    }

    #[test]
    fn test_read_only_slug_heuristic() {
        let p = default_patterns();
        assert!(p.is_read_only_slug("GMAIL_FETCH_EMAILS"));
        assert!(p.is_read_only_slug("GITHUB_LIST_ISSUES"));
        assert!(!p.is_read_only_slug("GMAIL_SEND_EMAIL"));
        assert!(!p.is_read_only_slug("GMAIL_FETCH_AND_DELETE"));
        assert!(!p.is_read_only_slug("SLACK_ARCHIVE_CHANNEL"));
    }

    #[test]
    fn test_compile_error_names_pattern() {
        let mut config = PatternConfig::default();
        config.memory_injection.push(NamedPattern::new("bad_one", "[z-a]"));
        let err = CompiledPatterns::compile(&config).unwrap_err();
        assert!(err.to_string().contains("bad_one"));
    }
}
