//! Shared types for the inference layer.
//!
//! Two message-format families are modelled:
//! - **content-block** (`ContentBlock`): assistant content is an array of
//!   `{type: text | tool_use | tool_result}` blocks; tool results travel in a
//!   user message.
//! - **tool-calls** (`ToolCalls`): assistant messages carry an optional
//!   `tool_calls[]`; each result is a separate `role: "tool"` message with
//!   `tool_call_id`.

use serde::{Deserialize, Serialize};

// ─── Provider Taxonomy ───────────────────────────────────────────────────────

/// Message-format family a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    /// Anthropic-style content-block arrays.
    ContentBlock,
    /// OpenAI-style `tool_calls` + `role: "tool"` messages.
    ToolCalls,
}

/// One entry in the provider failover chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Vendor key, e.g. `"anthropic"`, `"openai"`, `"mistral"`.
    pub id: String,
    pub family: ProviderFamily,
    pub model: String,
    /// USD per million input tokens.
    #[serde(default)]
    pub input_cost_per_mtok: f64,
    /// USD per million output tokens.
    #[serde(default)]
    pub output_cost_per_mtok: f64,
}

impl ProviderSpec {
    /// Cost in USD for a request with the given token counts.
    pub fn cost_for(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_cost_per_mtok
            + output_tokens as f64 * self.output_cost_per_mtok)
            / 1_000_000.0
    }
}

// ─── Tool-Calls Family ───────────────────────────────────────────────────────

/// A single message in a tool-calls family history.
///
/// `content` serializes as `""` rather than `null`; several vendors reject a
/// `null` content on assistant messages that carry tool calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, serialize_with = "serialize_content")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallResponse>>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(text.into()),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

fn serialize_content<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(s) => serializer.serialize_str(s),
        None => serializer.serialize_str(""),
    }
}

/// Message role (tool-calls family).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Tool call as it appears inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    #[serde(default = "default_function_type")]
    pub r#type: String,
    pub function: FunctionCallResponse,
}

fn default_function_type() -> String {
    "function".to_string()
}

/// Function call details; `arguments` is a JSON-encoded string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

// ─── Content-Block Family ────────────────────────────────────────────────────

/// Role in a content-block history. System text travels outside the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockRole {
    User,
    Assistant,
}

/// A single message in a content-block family history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMessage {
    pub role: BlockRole,
    pub content: Vec<ContentBlock>,
}

impl BlockMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: BlockRole::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }
}

/// One block of content-block family content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        /// Array-of-text-blocks content is joined with newlines.
        #[serde(default, deserialize_with = "deserialize_tool_result_content")]
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    /// Block kinds this crate does not interpret (thinking, images, ...).
    #[serde(other)]
    Unsupported,
}

/// Wire forms of `tool_result.content`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ToolResultContent {
    Text(String),
    Blocks(Vec<TextPart>),
    Other(serde_json::Value),
}

#[derive(Deserialize)]
struct TextPart {
    #[serde(default)]
    text: Option<String>,
}

fn deserialize_tool_result_content<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match ToolResultContent::deserialize(deserializer)? {
        ToolResultContent::Text(text) => text,
        ToolResultContent::Blocks(parts) => parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("\n"),
        ToolResultContent::Other(serde_json::Value::Null) => String::new(),
        ToolResultContent::Other(other) => other.to_string(),
    })
}

// ─── Histories ───────────────────────────────────────────────────────────────

/// An accumulated message history tagged with its format family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", content = "messages", rename_all = "snake_case")]
pub enum ProviderMessages {
    ContentBlock(Vec<BlockMessage>),
    ToolCalls(Vec<ChatMessage>),
}

impl ProviderMessages {
    /// An empty history in the given family.
    pub fn empty(family: ProviderFamily) -> Self {
        match family {
            ProviderFamily::ContentBlock => Self::ContentBlock(Vec::new()),
            ProviderFamily::ToolCalls => Self::ToolCalls(Vec::new()),
        }
    }

    /// A history holding a single user turn.
    pub fn from_user_text(family: ProviderFamily, text: &str) -> Self {
        match family {
            ProviderFamily::ContentBlock => Self::ContentBlock(vec![BlockMessage::user_text(text)]),
            ProviderFamily::ToolCalls => Self::ToolCalls(vec![ChatMessage::user(text)]),
        }
    }

    pub fn family(&self) -> ProviderFamily {
        match self {
            Self::ContentBlock(_) => ProviderFamily::ContentBlock,
            Self::ToolCalls(_) => ProviderFamily::ToolCalls,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::ContentBlock(m) => m.len(),
            Self::ToolCalls(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total characters of text, arguments and results in the history.
    pub fn char_count(&self) -> usize {
        match self {
            Self::ContentBlock(messages) => messages
                .iter()
                .flat_map(|m| m.content.iter())
                .map(|b| match b {
                    ContentBlock::Text { text } => text.len(),
                    ContentBlock::ToolUse { name, input, .. } => {
                        name.len() + input.to_string().len()
                    }
                    ContentBlock::ToolResult { content, .. } => content.len(),
                    ContentBlock::Unsupported => 0,
                })
                .sum(),
            Self::ToolCalls(messages) => messages
                .iter()
                .map(|m| {
                    m.content.as_deref().map(str::len).unwrap_or(0)
                        + m.tool_calls
                            .iter()
                            .flatten()
                            .map(|c| c.function.name.len() + c.function.arguments.len())
                            .sum::<usize>()
                })
                .sum(),
        }
    }
}

// ─── Requests & Responses ────────────────────────────────────────────────────

/// Tool summary sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Provider-neutral request handed to the injected LLM transport.
#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    pub model: String,
    pub system: String,
    pub messages: ProviderMessages,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
}

/// Raw provider response body, in the provider's own wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub body: serde_json::Value,
}

/// A parsed tool call extracted from a model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-scoped identifier.
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
