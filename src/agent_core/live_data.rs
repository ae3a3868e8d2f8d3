//! Prompt intent classification.
//!
//! Cheap keyword checks run before routing: does the prompt ask for fresh
//! data from a connected service, ask about the assistant itself, or ask to
//! change what the assistant remembers? The host uses the result to decide
//! whether cached context may answer the prompt.

use serde::Serialize;

/// Verbs and openers that ask to look something up.
const READ_VERBS: &[&str] = &[
    "check", "show", "list", "get", "fetch", "find", "search", "pull", "read", "see", "view", "look",
    "what's", "whats", "any", "latest", "recent", "new", "unread", "upcoming", "today's", "todays",
];

/// Things that live in connected services rather than in the graph.
const DATA_NOUNS: &[&str] = &[
    "email", "emails", "inbox", "mail", "calendar", "event", "events", "meeting", "meetings",
    "issue", "issues", "ticket", "tickets", "message", "messages", "dm", "dms", "channel", "repo",
    "repos", "pr", "prs", "pull", "task", "tasks", "todo", "todos", "file", "files", "doc", "docs",
    "document", "documents", "notification", "notifications", "thread", "threads", "schedule",
];

/// Server-name fragments that say nothing about the data behind them.
const GENERIC_SERVER_FRAGMENTS: &[&str] = &["mcp", "server", "local", "api", "tool", "tools"];

const META_PHRASES: &[&str] = &[
    "what can you do",
    "what are you able",
    "what tools",
    "which tools",
    "what skills",
    "which skills",
    "how do you work",
    "how does this work",
    "who are you",
    "what are you",
    "your memory",
    "what do you remember",
    "what do you know about me",
    "your capabilities",
    "are you connected",
    "what integrations",
    "which integrations",
];

const MEMORY_EDIT_PHRASES: &[&str] = &[
    "remember that",
    "remember this",
    "please remember",
    "don't forget",
    "dont forget",
    "forget that",
    "forget about",
    "stop remembering",
    "update your memory",
    "update memory",
    "add to memory",
    "add this to your memory",
    "remove from memory",
    "from now on",
    "note that i",
    "keep in mind",
];

/// What a prompt is asking for, as far as keywords can tell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptIntent {
    pub live_data_read: bool,
    pub meta_question: bool,
    pub memory_edit: bool,
}

pub fn classify_prompt(prompt: &str, mcp_server_names: &[&str]) -> PromptIntent {
    let intent = PromptIntent {
        live_data_read: is_likely_live_data_read_intent(prompt, mcp_server_names),
        meta_question: is_meta_question(prompt),
        memory_edit: is_memory_edit_intent(prompt),
    };
    tracing::debug!(
        live_data_read = intent.live_data_read,
        meta_question = intent.meta_question,
        memory_edit = intent.memory_edit,
        "prompt classified"
    );
    intent
}

/// A read verb plus a data noun, fixed or derived from a server name.
///
/// Server names are split on `-` and `_`; fragments longer than two
/// characters count as nouns, so `google-calendar` contributes `google` and
/// `calendar`.
pub fn is_likely_live_data_read_intent(prompt: &str, mcp_server_names: &[&str]) -> bool {
    let words = prompt_words(prompt);
    if words.is_empty() {
        return false;
    }

    let has_verb = words.iter().any(|w| READ_VERBS.contains(&w.as_str()));
    if !has_verb {
        return false;
    }

    if words.iter().any(|w| DATA_NOUNS.contains(&w.as_str())) {
        return true;
    }

    let dynamic = server_name_nouns(mcp_server_names);
    words.iter().any(|w| dynamic.iter().any(|n| n == w))
}

pub fn is_meta_question(prompt: &str) -> bool {
    let lower = prompt.to_lowercase();
    META_PHRASES.iter().any(|p| lower.contains(p))
}

pub fn is_memory_edit_intent(prompt: &str) -> bool {
    let lower = prompt.to_lowercase();
    MEMORY_EDIT_PHRASES.iter().any(|p| lower.contains(p))
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Lower-cased words, keeping apostrophes so `what's` survives.
pub(crate) fn prompt_words(prompt: &str) -> Vec<String> {
    prompt
        .to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '\u{2019}'))
        .map(|w| w.replace('\u{2019}', "'"))
        .map(|w| w.trim_matches('\'').to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

fn server_name_nouns(mcp_server_names: &[&str]) -> Vec<String> {
    let mut nouns: Vec<String> = mcp_server_names
        .iter()
        .flat_map(|name| name.split(['-', '_']))
        .map(str::to_lowercase)
        .filter(|f| f.chars().count() > 2 && !GENERIC_SERVER_FRAGMENTS.contains(&f.as_str()))
        .collect();
    nouns.sort();
    nouns.dedup();
    nouns
}

// ─── Tests ──────────────────────────────────────────────────────────────────
