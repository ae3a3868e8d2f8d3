//! Channel-backed approval prompts.
//!
//! [`ChannelApprovalPrompter`] sends a [`ConfirmationRequest`] to the UI and
//! waits for the matching [`ConfirmationResponse`]. The UI end owns the other
//! halves of both channels.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use super::meta_tools::{local_mcp_inner, multi_execute_slugs, normalise_multi_execute_args};
use super::tokens::truncate_chars;
use super::types::{ConfirmationRequest, ConfirmationResponse};
use crate::host::ApprovalPrompter;
use crate::security::patterns::name_tokens;

/// Name tokens that mark an action as destructive.
const DESTRUCTIVE_TOKENS: &[&str] = &["DELETE", "REMOVE", "TRASH", "SEND", "DISCONNECT", "ARCHIVE"];

const PREVIEW_ARGS_CHARS: usize = 100;

// ─── ChannelApprovalPrompter ────────────────────────────────────────────────

pub struct ChannelApprovalPrompter {
    confirm_tx: mpsc::Sender<ConfirmationRequest>,
    confirm_rx: Mutex<mpsc::Receiver<ConfirmationResponse>>,
}

impl ChannelApprovalPrompter {
    pub fn new(
        confirm_tx: mpsc::Sender<ConfirmationRequest>,
        confirm_rx: mpsc::Receiver<ConfirmationResponse>,
    ) -> Self {
        Self {
            confirm_tx,
            confirm_rx: Mutex::new(confirm_rx),
        }
    }

    /// A prompter plus the UI-side channel ends.
    pub fn channel(
        buffer: usize,
    ) -> (
        Self,
        mpsc::Receiver<ConfirmationRequest>,
        mpsc::Sender<ConfirmationResponse>,
    ) {
        let (req_tx, req_rx) = mpsc::channel(buffer);
        let (resp_tx, resp_rx) = mpsc::channel(buffer);
        (Self::new(req_tx, resp_rx), req_rx, resp_tx)
    }
}

#[async_trait]
impl ApprovalPrompter for ChannelApprovalPrompter {
    async fn request_approval(&self, tool_name: &str, arguments: &Value) -> bool {
        // Held across send and receive so prompts never interleave.
        let mut rx = self.confirm_rx.lock().await;

        let request = ConfirmationRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
            preview: generate_preview(tool_name, arguments),
            is_destructive: is_destructive_action(tool_name, arguments),
        };
        let request_id = request.request_id.clone();

        if self.confirm_tx.send(request).await.is_err() {
            tracing::warn!(tool = %tool_name, "confirmation channel closed before request");
            return false;
        }

        match rx.recv().await {
            Some(ConfirmationResponse::Confirmed) => true,
            Some(ConfirmationResponse::Rejected) => false,
            None => {
                tracing::warn!(tool = %tool_name, request_id = %request_id, "confirmation channel closed");
                false
            }
        }
    }
}

// ─── Previews ───────────────────────────────────────────────────────────────

/// Whether a call deletes, sends or disconnects something.
///
/// Meta-tools are judged by their inner tools.
pub fn is_destructive_action(tool_name: &str, arguments: &Value) -> bool {
    let destructive = |name: &str| name_tokens(name).any(|t| DESTRUCTIVE_TOKENS.contains(&t.as_str()));
    match tool_name {
        "COMPOSIO_MULTI_EXECUTE_TOOL" => normalise_multi_execute_args(arguments)
            .iter()
            .any(|c| destructive(&c.tool_slug)),
        "LOCAL_MCP_EXECUTE" => local_mcp_inner(arguments).0.is_some_and(|n| destructive(&n)),
        other => destructive(other),
    }
}

/// Human-readable one-line preview of a tool call.
pub fn generate_preview(tool_name: &str, arguments: &Value) -> String {
    let text = |key: &str| arguments.get(key).and_then(Value::as_str).unwrap_or("<unknown>");

    match tool_name {
        "roam_create_block" => format!(
            "Create block under {}: {}",
            text("parent_uid"),
            truncate_chars(text("string"), PREVIEW_ARGS_CHARS)
        ),
        "roam_create_blocks" | "roam_batch_write" => {
            let count = ["blocks", "actions", "batches"]
                .iter()
                .find_map(|k| arguments.get(*k).and_then(Value::as_array))
                .map_or(0, Vec::len);
            let pages = arguments
                .get("target_pages")
                .and_then(Value::as_array)
                .map(|p| p.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(", "))
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| text("parent_uid").to_string());
            format!("Write {count} block(s) to {pages}")
        }
        "cos_update_memory" => format!("Update memory page: {}", text("page")),
        "COMPOSIO_MULTI_EXECUTE_TOOL" => {
            let calls = normalise_multi_execute_args(arguments);
            format!("Run Composio tools: {}", multi_execute_slugs(&calls).join(", "))
        }
        "LOCAL_MCP_EXECUTE" => {
            let (inner, args) = local_mcp_inner(arguments);
            format!(
                "Run local tool {}: {}",
                inner.as_deref().unwrap_or("<unknown>"),
                compact(&args)
            )
        }
        _ => format!("Execute {tool_name}: {}", compact(arguments)),
    }
}

fn compact(arguments: &Value) -> String {
    let rendered = serde_json::to_string(arguments).unwrap_or_default();
    if rendered.chars().count() > PREVIEW_ARGS_CHARS {
        format!("{}...", truncate_chars(&rendered, PREVIEW_ARGS_CHARS))
    } else {
        rendered
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_destructive_action() {
        assert!(is_destructive_action("roam_delete_block", &json!({})));
        assert!(!is_destructive_action("roam_create_block", &json!({})));
        assert!(is_destructive_action(
            "COMPOSIO_MULTI_EXECUTE_TOOL",
            &json!({"tools": [{"tool_slug": "GMAIL_FETCH_EMAILS"}, {"tool_slug": "GMAIL_SEND_EMAIL"}]})
        ));
        assert!(!is_destructive_action(
            "LOCAL_MCP_EXECUTE",
            &json!({"tool_name": "add_note"})
        ));
    }

    #[test]
    fn test_generate_preview_create_block() {
        let preview = generate_preview("roam_create_block", &json!({"parent_uid": "abc", "string": "Hello"}));
        assert_eq!(preview, "Create block under abc: Hello");
    }

    #[test]
    fn test_generate_preview_batch_uses_target_pages() {
        let args = json!({"actions": [{}, {}], "target_pages": ["page-a", "page-b"]});
        assert_eq!(generate_preview("roam_batch_write", &args), "Write 2 block(s) to page-a, page-b");
    }

    #[test]
    fn test_generate_preview_meta_tools() {
        let multi = json!({"tools": [{"tool_slug": "SLACK_SEND_MESSAGE"}, {"tool_slug": "GMAIL_SEND_EMAIL"}]});
        assert_eq!(
            generate_preview("COMPOSIO_MULTI_EXECUTE_TOOL", &multi),
            "Run Composio tools: GMAIL_SEND_EMAIL, SLACK_SEND_MESSAGE"
        );
        let local = json!({"tool_name": "add_note", "arguments": {"note": "x"}});
        assert_eq!(generate_preview("LOCAL_MCP_EXECUTE", &local), r#"Run local tool add_note: {"note":"x"}"#);
    }

    #[test]
    fn test_generate_preview_generic_truncates() {
        let args = json!({"query": "x".repeat(300)});
        let preview = generate_preview("some_tool", &args);
        assert!(preview.starts_with("Execute some_tool: "));
        assert!(preview.ends_with("..."));
    }

    #[tokio::test]
    async fn test_channel_prompter_round_trip() {
        let (prompter, mut req_rx, resp_tx) = ChannelApprovalPrompter::channel(4);

        tokio::spawn(async move {
            let first = req_rx.recv().await.unwrap();
            assert_eq!(first.tool_name, "roam_create_block");
            resp_tx.send(ConfirmationResponse::Confirmed).await.unwrap();
            let second = req_rx.recv().await.unwrap();
            assert!(second.is_destructive);
            resp_tx.send(ConfirmationResponse::Rejected).await.unwrap();
        });

        assert!(prompter.request_approval("roam_create_block", &json!({"parent_uid": "p"})).await);
        assert!(!prompter.request_approval("roam_delete_block", &json!({"uid": "b"})).await);
    }

    #[tokio::test]
    async fn test_channel_prompter_closed_channel_denies() {
        let (prompter, req_rx, resp_tx) = ChannelApprovalPrompter::channel(1);
        drop(req_rx);
        drop(resp_tx);
        assert!(!prompter.request_approval("roam_create_block", &json!({})).await);
    }
}
