//! Per-family provider adapters.
//!
//! Each message-format family gets a small function table instead of a
//! trait hierarchy: extract tool calls and text from a raw response body,
//! append the assistant turn to a history, and append tool results.

use super::tool_call_parser::{parse_text_tool_calls, repair_malformed_tool_call_json};
use super::types::{
    BlockMessage, BlockRole, ChatMessage, ContentBlock, ProviderFamily, ProviderMessages, Role,
    ToolCall,
};

/// Token usage reported by a provider response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Function table implementing one message-format family.
pub struct FamilyAdapter {
    pub family: ProviderFamily,
    pub extract_tool_calls: fn(&serde_json::Value) -> Vec<ToolCall>,
    pub extract_text: fn(&serde_json::Value) -> String,
    pub extract_usage: fn(&serde_json::Value) -> ResponseUsage,
    pub format_assistant: fn(&serde_json::Value, &mut ProviderMessages),
    pub format_tool_results: fn(&[(ToolCall, serde_json::Value)], &mut ProviderMessages),
}

static CONTENT_BLOCK_ADAPTER: FamilyAdapter = FamilyAdapter {
    family: ProviderFamily::ContentBlock,
    extract_tool_calls: block_extract_tool_calls,
    extract_text: block_extract_text,
    extract_usage: block_extract_usage,
    format_assistant: block_format_assistant,
    format_tool_results: block_format_tool_results,
};

static TOOL_CALLS_ADAPTER: FamilyAdapter = FamilyAdapter {
    family: ProviderFamily::ToolCalls,
    extract_tool_calls: chat_extract_tool_calls,
    extract_text: chat_extract_text,
    extract_usage: chat_extract_usage,
    format_assistant: chat_format_assistant,
    format_tool_results: chat_format_tool_results,
};

/// The adapter for a family.
pub fn adapter_for(family: ProviderFamily) -> &'static FamilyAdapter {
    match family {
        ProviderFamily::ContentBlock => &CONTENT_BLOCK_ADAPTER,
        ProviderFamily::ToolCalls => &TOOL_CALLS_ADAPTER,
    }
}

/// Render a tool result value as the string content sent back to a model.
pub fn result_to_content(result: &serde_json::Value) -> String {
    match result {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─── Content-Block Family ────────────────────────────────────────────────────

fn block_content(body: &serde_json::Value) -> Vec<ContentBlock> {
    body.get("content")
        .and_then(|c| serde_json::from_value::<Vec<ContentBlock>>(c.clone()).ok())
        .unwrap_or_default()
}

fn block_extract_tool_calls(body: &serde_json::Value) -> Vec<ToolCall> {
    block_content(body)
        .into_iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                id,
                name,
                arguments: if input.is_null() {
                    serde_json::json!({})
                } else {
                    input
                },
            }),
            _ => None,
        })
        .collect()
}

fn block_extract_text(body: &serde_json::Value) -> String {
    block_content(body)
        .into_iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn block_extract_usage(body: &serde_json::Value) -> ResponseUsage {
    let usage = &body["usage"];
    ResponseUsage {
        input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
    }
}

fn block_format_assistant(body: &serde_json::Value, history: &mut ProviderMessages) {
    let content: Vec<ContentBlock> = block_content(body)
        .into_iter()
        .filter(|b| !matches!(b, ContentBlock::Unsupported))
        .collect();
    match history {
        ProviderMessages::ContentBlock(messages) => messages.push(BlockMessage {
            role: BlockRole::Assistant,
            content,
        }),
        ProviderMessages::ToolCalls(_) => {
            tracing::warn!("content-block response appended to a tool-calls history; ignored");
        }
    }
}

fn block_format_tool_results(
    results: &[(ToolCall, serde_json::Value)],
    history: &mut ProviderMessages,
) {
    let ProviderMessages::ContentBlock(messages) = history else {
        tracing::warn!("tool results for content-block family appended to wrong history");
        return;
    };
    if results.is_empty() {
        return;
    }
    let content = results
        .iter()
        .map(|(call, result)| ContentBlock::ToolResult {
            tool_use_id: call.id.clone(),
            content: result_to_content(result),
            is_error: result.get("error").is_some(),
        })
        .collect();
    messages.push(BlockMessage {
        role: BlockRole::User,
        content,
    });
}

// ─── Tool-Calls Family ───────────────────────────────────────────────────────

fn chat_message(body: &serde_json::Value) -> Option<ChatMessage> {
    let message = body.pointer("/choices/0/message")?;
    serde_json::from_value(message.clone()).ok()
}

fn chat_extract_tool_calls(body: &serde_json::Value) -> Vec<ToolCall> {
    let Some(message) = chat_message(body) else {
        return Vec::new();
    };

    let native: Vec<ToolCall> = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|c| ToolCall {
            arguments: repair_malformed_tool_call_json(&c.function.arguments).unwrap_or_else(|| {
                tracing::warn!(tool = %c.function.name, "unparseable tool arguments; using {{}}");
                serde_json::json!({})
            }),
            id: c.id,
            name: c.function.name,
        })
        .collect();

    if !native.is_empty() {
        return native;
    }

    // Some vendors leave the call in the text channel.
    message
        .content
        .as_deref()
        .map(parse_text_tool_calls)
        .unwrap_or_default()
}

fn chat_extract_text(body: &serde_json::Value) -> String {
    chat_message(body)
        .and_then(|m| m.content)
        .unwrap_or_default()
}

fn chat_extract_usage(body: &serde_json::Value) -> ResponseUsage {
    let usage = &body["usage"];
    ResponseUsage {
        input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
    }
}

fn chat_format_assistant(body: &serde_json::Value, history: &mut ProviderMessages) {
    let ProviderMessages::ToolCalls(messages) = history else {
        tracing::warn!("tool-calls response appended to a content-block history; ignored");
        return;
    };
    let mut message = chat_message(body).unwrap_or(ChatMessage {
        role: Role::Assistant,
        content: None,
        tool_call_id: None,
        tool_calls: None,
    });
    message.role = Role::Assistant;
    if message.tool_calls.as_ref().is_some_and(Vec::is_empty) {
        message.tool_calls = None;
    }
    messages.push(message);
}

fn chat_format_tool_results(
    results: &[(ToolCall, serde_json::Value)],
    history: &mut ProviderMessages,
) {
    let ProviderMessages::ToolCalls(messages) = history else {
        tracing::warn!("tool results for tool-calls family appended to wrong history");
        return;
    };
    for (call, result) in results {
        messages.push(ChatMessage::tool_result(&call.id, result_to_content(result)));
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn anthropic_body() -> serde_json::Value {
        json!({
            "content": [
                {"type": "text", "text": "Searching."},
                {"type": "tool_use", "id": "tu_1", "name": "roam_search", "input": {"q": "x"}}
            ],
            "usage": {"input_tokens": 120, "output_tokens": 30}
        })
    }

    fn openai_body() -> serde_json::Value {
        json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_a",
                    "type": "function",
                    "function": {"name": "roam_search", "arguments": "{\"q\":\"x\",}"}
                }]
            }}],
            "usage": {"prompt_tokens": 50, "completion_tokens": 7}
        })
    }

    #[test]
    fn test_content_block_extraction() {
        let adapter = adapter_for(ProviderFamily::ContentBlock);
        let body = anthropic_body();
        let calls = (adapter.extract_tool_calls)(&body);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "tu_1");
        assert_eq!((adapter.extract_text)(&body), "Searching.");
        assert_eq!(
            (adapter.extract_usage)(&body),
            ResponseUsage {
                input_tokens: 120,
                output_tokens: 30
            }
        );
    }

    #[test]
    fn test_tool_calls_extraction_repairs_arguments() {
        let adapter = adapter_for(ProviderFamily::ToolCalls);
        let calls = (adapter.extract_tool_calls)(&openai_body());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["q"], "x");
        assert_eq!((adapter.extract_usage)(&openai_body()).output_tokens, 7);
    }

    #[test]
    fn test_tool_calls_text_fallback() {
        let adapter = adapter_for(ProviderFamily::ToolCalls);
        let body = json!({"choices": [{"message": {
            "role": "assistant",
            "content": "{\"name\": \"get_time\", \"arguments\": {}} trailing"
        }}]});
        let calls = (adapter.extract_tool_calls)(&body);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_time");
    }

    #[test]
    fn test_block_array_tool_result_does_not_blank_response() {
        let adapter = adapter_for(ProviderFamily::ContentBlock);
        let body = json!({"content": [
            {"type": "tool_result", "tool_use_id": "x", "content": [{"type": "text", "text": "r"}]},
            {"type": "text", "text": "Summary ready."}
        ]});
        assert_eq!((adapter.extract_text)(&body), "Summary ready.");
    }

    #[test]
    fn test_format_round_content_block() {
        let adapter = adapter_for(ProviderFamily::ContentBlock);
        let mut history = ProviderMessages::from_user_text(ProviderFamily::ContentBlock, "hi");
        let body = anthropic_body();
        (adapter.format_assistant)(&body, &mut history);
        let calls = (adapter.extract_tool_calls)(&body);
        let results = vec![(calls[0].clone(), json!({"ok": true}))];
        (adapter.format_tool_results)(&results, &mut history);

        let ProviderMessages::ContentBlock(messages) = history else {
            panic!("wrong family");
        };
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, BlockRole::Assistant);
        assert!(matches!(
            &messages[2].content[0],
            ContentBlock::ToolResult { tool_use_id, is_error: false, .. } if tool_use_id == "tu_1"
        ));
    }

    #[test]
    fn test_format_round_tool_calls() {
        let adapter = adapter_for(ProviderFamily::ToolCalls);
        let mut history = ProviderMessages::from_user_text(ProviderFamily::ToolCalls, "hi");
        let body = openai_body();
        (adapter.format_assistant)(&body, &mut history);
        let calls = (adapter.extract_tool_calls)(&body);
        (adapter.format_tool_results)(&[(calls[0].clone(), json!("plain"))], &mut history);

        let ProviderMessages::ToolCalls(messages) = history else {
            panic!("wrong family");
        };
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].role, Role::Tool);
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(messages[2].content.as_deref(), Some("plain"));
    }

    #[test]
    fn test_empty_tool_calls_array_stripped_on_format() {
        let adapter = adapter_for(ProviderFamily::ToolCalls);
        let mut history = ProviderMessages::empty(ProviderFamily::ToolCalls);
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "done", "tool_calls": []}}]});
        (adapter.format_assistant)(&body, &mut history);
        let ProviderMessages::ToolCalls(messages) = history else {
            panic!("wrong family");
        };
        assert!(messages[0].tool_calls.is_none());
    }
}
