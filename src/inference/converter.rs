//! Message history conversion for mid-turn provider failover.
//!
//! When the failover layer switches providers inside a turn, the history
//! accumulated so far must be re-expressed for the next provider:
//!
//! - **Cross-family** (content-block ↔ tool-calls): text, tool calls and tool
//!   results are translated one-to-one. Tool-call identifiers are remapped to
//!   short alphanumeric ids through a per-conversion dictionary, so the
//!   emitting side and the consuming side stay paired.
//! - **Same family, different vendor** (tool-calls only): ids are renumbered
//!   to `call_N` and empty `tool_calls` arrays are stripped.

use std::collections::{HashMap, HashSet};

use super::tool_call_parser::{parse_first_json_object, repair_malformed_tool_call_json};
use super::types::{
    BlockMessage, BlockRole, ChatMessage, ContentBlock, FunctionCallResponse, ProviderFamily,
    ProviderMessages, ProviderSpec, Role, ToolCallResponse,
};

// ─── Id Remapping ────────────────────────────────────────────────────────────

/// Per-conversion id dictionary. Each distinct source id maps to exactly one
/// generated id, in first-seen order.
struct IdRemapper {
    map: HashMap<String, String>,
    next: usize,
    style: IdStyle,
}

#[derive(Clone, Copy)]
enum IdStyle {
    /// Nine-character alphanumeric: `tc0000001`.
    Short,
    /// `call_1`, `call_2`, ...
    Numbered,
}

impl IdRemapper {
    fn new(style: IdStyle) -> Self {
        Self {
            map: HashMap::new(),
            next: 1,
            style,
        }
    }

    fn remap(&mut self, original: &str) -> String {
        if let Some(existing) = self.map.get(original) {
            return existing.clone();
        }
        let id = match self.style {
            IdStyle::Short => format!("tc{:07}", self.next),
            IdStyle::Numbered => format!("call_{}", self.next),
        };
        self.next += 1;
        self.map.insert(original.to_string(), id.clone());
        id
    }
}

// ─── Public API ──────────────────────────────────────────────────────────────

/// Convert `messages` so they can be sent to provider `to` after having been
/// accumulated for provider `from`.
///
/// The history's own family tag is authoritative; `from` only decides
/// whether a same-family conversion is a vendor switch.
pub fn convert_messages_for_provider(
    messages: &ProviderMessages,
    from: &ProviderSpec,
    to: &ProviderSpec,
) -> ProviderMessages {
    let converted = match (messages, to.family) {
        (ProviderMessages::ContentBlock(m), ProviderFamily::ToolCalls) => {
            ProviderMessages::ToolCalls(blocks_to_chat(m))
        }
        (ProviderMessages::ToolCalls(m), ProviderFamily::ContentBlock) => {
            ProviderMessages::ContentBlock(chat_to_blocks(m))
        }
        (ProviderMessages::ToolCalls(m), ProviderFamily::ToolCalls) if from.id != to.id => {
            ProviderMessages::ToolCalls(renumber_chat(m))
        }
        (same, _) => same.clone(),
    };

    tracing::debug!(
        from = %from.id,
        to = %to.id,
        source_family = ?messages.family(),
        target_family = ?to.family,
        messages = converted.len(),
        "converted message history for provider switch"
    );

    converted
}

/// A write tool call whose result indicates success.
#[derive(Debug, Clone, PartialEq)]
pub struct SuccessfulWrite {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Scan a history for write tool calls that already succeeded.
///
/// Each tool call is paired with its result by id. A result counts as
/// successful only when it does not carry `success: false` or
/// `successful: false` and its trimmed `error` is empty. Calls whose name
/// does not satisfy `is_write` are ignored. Used to warn a newly selected
/// provider not to repeat writes.
pub fn detect_successful_write_tool_calls_in_messages(
    messages: &ProviderMessages,
    is_write: impl Fn(&str, &serde_json::Value) -> bool,
) -> Vec<SuccessfulWrite> {
    let mut calls: Vec<(String, String, serde_json::Value)> = Vec::new();
    let mut results: HashMap<String, String> = HashMap::new();

    match messages {
        ProviderMessages::ContentBlock(history) => {
            for block in history.iter().flat_map(|m| m.content.iter()) {
                match block {
                    ContentBlock::ToolUse { id, name, input } => {
                        calls.push((id.clone(), name.clone(), input.clone()))
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        if !is_error {
                            results.insert(tool_use_id.clone(), content.clone());
                        }
                    }
                    _ => {}
                }
            }
        }
        ProviderMessages::ToolCalls(history) => {
            for message in history {
                for call in message.tool_calls.iter().flatten() {
                    let args = repair_malformed_tool_call_json(&call.function.arguments)
                        .unwrap_or_else(|| serde_json::json!({}));
                    calls.push((call.id.clone(), call.function.name.clone(), args));
                }
                if message.role == Role::Tool {
                    if let Some(id) = &message.tool_call_id {
                        results.insert(id.clone(), message.content.clone().unwrap_or_default());
                    }
                }
            }
        }
    }

    calls
        .into_iter()
        .filter(|(_, name, args)| is_write(name, args))
        .filter(|(id, _, _)| results.get(id).is_some_and(|r| is_successful_result_text(r)))
        .map(|(tool_call_id, tool_name, arguments)| SuccessfulWrite {
            tool_call_id,
            tool_name,
            arguments,
        })
        .collect()
}

/// Build the warning sent to a new provider about writes already applied.
pub fn format_completed_writes_notice(writes: &[SuccessfulWrite]) -> Option<String> {
    if writes.is_empty() {
        return None;
    }
    let lines: Vec<String> = writes
        .iter()
        .map(|w| format!("- {} {}", w.tool_name, w.arguments))
        .collect();
    Some(format!(
        "The following write operations already succeeded earlier in this turn. Do NOT repeat them:\n{}",
        lines.join("\n")
    ))
}

fn is_successful_result_text(text: &str) -> bool {
    match parse_first_json_object(text) {
        Some(value) => is_successful_result_value(&value),
        None => !text.trim_start().to_lowercase().starts_with("error"),
    }
}

/// Whether a structured tool result reports success.
pub fn is_successful_result_value(value: &serde_json::Value) -> bool {
    if value.get("success") == Some(&serde_json::Value::Bool(false))
        || value.get("successful") == Some(&serde_json::Value::Bool(false))
    {
        return false;
    }
    match value.get("error") {
        None | Some(serde_json::Value::Null) => true,
        Some(serde_json::Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

// ─── Error Envelope ──────────────────────────────────────────────────────────

/// Marker key on a tool-calls result that came from an `is_error` tool_result.
const ERROR_ENVELOPE_KEY: &str = "is_error";

/// The tool-calls family has no error flag; carry it as `{"error", "is_error"}`
/// so write detection and the reverse conversion both see the failure.
fn wrap_error_content(content: &str) -> String {
    let error = if content.trim().is_empty() {
        "tool error"
    } else {
        content
    };
    serde_json::json!({ "error": error, ERROR_ENVELOPE_KEY: true }).to_string()
}

/// Inverse of [`wrap_error_content`]. Plain `{"error": ...}` results written
/// by a tool stay as they are.
fn unwrap_error_content(content: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(content.trim()).ok()?;
    let object = value.as_object()?;
    if object.len() != 2 || object.get(ERROR_ENVELOPE_KEY) != Some(&serde_json::Value::Bool(true)) {
        return None;
    }
    object.get("error")?.as_str().map(str::to_string)
}

// ─── Content-Block → Tool-Calls ──────────────────────────────────────────────

fn blocks_to_chat(messages: &[BlockMessage]) -> Vec<ChatMessage> {
    let mut ids = IdRemapper::new(IdStyle::Short);
    let mut out = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            BlockRole::Assistant => {
                let mut texts = Vec::new();
                let mut tool_calls = Vec::new();
                for block in &message.content {
                    match block {
                        ContentBlock::Text { text } => texts.push(text.as_str()),
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_calls.push(ToolCallResponse {
                                id: ids.remap(id),
                                r#type: "function".to_string(),
                                function: FunctionCallResponse {
                                    name: name.clone(),
                                    arguments: input.to_string(),
                                },
                            })
                        }
                        _ => {}
                    }
                }
                out.push(ChatMessage {
                    role: Role::Assistant,
                    content: if texts.is_empty() {
                        None
                    } else {
                        Some(texts.join("\n"))
                    },
                    tool_call_id: None,
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                });
            }
            BlockRole::User => {
                // Tool results must directly follow the assistant message.
                let mut texts = Vec::new();
                for block in &message.content {
                    match block {
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            let content = if *is_error {
                                wrap_error_content(content)
                            } else {
                                content.clone()
                            };
                            out.push(ChatMessage::tool_result(ids.remap(tool_use_id), content))
                        }
                        ContentBlock::Text { text } => texts.push(text.as_str()),
                        _ => {}
                    }
                }
                if !texts.is_empty() {
                    out.push(ChatMessage::user(texts.join("\n")));
                }
            }
        }
    }

    out
}

// ─── Tool-Calls → Content-Block ──────────────────────────────────────────────

fn chat_to_blocks(messages: &[ChatMessage]) -> Vec<BlockMessage> {
    let mut ids = IdRemapper::new(IdStyle::Short);
    let mut out: Vec<BlockMessage> = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            Role::Assistant => {
                let mut content = Vec::new();
                if let Some(text) = message.content.as_deref().filter(|t| !t.is_empty()) {
                    content.push(ContentBlock::Text {
                        text: text.to_string(),
                    });
                }
                for call in message.tool_calls.iter().flatten() {
                    let input = repair_malformed_tool_call_json(&call.function.arguments)
                        .filter(serde_json::Value::is_object)
                        .unwrap_or_else(|| {
                            tracing::warn!(
                                tool = %call.function.name,
                                "tool arguments not an object during conversion; using {{}}"
                            );
                            serde_json::json!({})
                        });
                    content.push(ContentBlock::ToolUse {
                        id: ids.remap(&call.id),
                        name: call.function.name.clone(),
                        input,
                    });
                }
                if content.is_empty() {
                    continue;
                }
                out.push(BlockMessage {
                    role: BlockRole::Assistant,
                    content,
                });
            }
            Role::Tool => {
                let raw = message.content.clone().unwrap_or_default();
                let (content, is_error) = match unwrap_error_content(&raw) {
                    Some(inner) => (inner, true),
                    None => (raw, false),
                };
                let block = ContentBlock::ToolResult {
                    tool_use_id: ids.remap(message.tool_call_id.as_deref().unwrap_or_default()),
                    content,
                    is_error,
                };
                push_user_block(&mut out, block);
            }
            Role::User | Role::System => {
                let text = message.content.clone().unwrap_or_default();
                if text.is_empty() {
                    continue;
                }
                push_user_block(&mut out, ContentBlock::Text { text });
            }
        }
    }

    out
}

/// Content-block histories alternate roles; consecutive user-side blocks
/// (several tool results, then a follow-up text) share one user message.
fn push_user_block(out: &mut Vec<BlockMessage>, block: ContentBlock) {
    match out.last_mut() {
        Some(last) if last.role == BlockRole::User => last.content.push(block),
        _ => out.push(BlockMessage {
            role: BlockRole::User,
            content: vec![block],
        }),
    }
}

// ─── Tool-Calls → Tool-Calls (vendor switch) ─────────────────────────────────

fn renumber_chat(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut ids = IdRemapper::new(IdStyle::Numbered);
    messages
        .iter()
        .map(|message| {
            let mut copy = message.clone();
            copy.tool_calls = copy.tool_calls.and_then(|calls| {
                if calls.is_empty() {
                    None
                } else {
                    Some(
                        calls
                            .into_iter()
                            .map(|mut c| {
                                c.id = ids.remap(&c.id);
                                c
                            })
                            .collect(),
                    )
                }
            });
            if let Some(id) = copy.tool_call_id.take() {
                copy.tool_call_id = Some(ids.remap(&id));
            }
            copy
        })
        .collect()
}

/// Distinct tool names called in a history, in first-call order.
pub fn tool_names_in_messages(messages: &ProviderMessages) -> Vec<String> {
    let mut seen = HashSet::new();
    let names: Vec<String> = match messages {
        ProviderMessages::ContentBlock(history) => history
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|b| match b {
                ContentBlock::ToolUse { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect(),
        ProviderMessages::ToolCalls(history) => history
            .iter()
            .flat_map(|m| m.tool_calls.iter().flatten())
            .map(|c| c.function.name.clone())
            .collect(),
    };
    names.into_iter().filter(|n| seen.insert(n.clone())).collect()
}

/// Tool result content as text, keyed by tool-call id. Exposed for
/// diagnostics of converted histories.
pub fn tool_results_by_id(messages: &ProviderMessages) -> HashMap<String, String> {
    match messages {
        ProviderMessages::ContentBlock(history) => history
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|b| match b {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => Some((tool_use_id.clone(), content.clone())),
                _ => None,
            })
            .collect(),
        ProviderMessages::ToolCalls(history) => history
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| {
                m.tool_call_id
                    .clone()
                    .map(|id| (id, m.content.clone().unwrap_or_default()))
            })
            .collect(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
