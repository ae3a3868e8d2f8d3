//! MCP transport seam.
//!
//! The host owns the actual connection (Composio over HTTP via the proxy,
//! local servers over their own transports). The core sees one async call
//! that takes a tool name and arguments and returns the raw MCP result,
//! `{"content": [{"type": "text", "text": "..."}, ...]}`.

use async_trait::async_trait;

use super::errors::McpError;

#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError>;

    /// Whether a connection is available. Dispatch fails fast when `false`.
    fn is_connected(&self) -> bool {
        true
    }
}

/// The first `text` block of an MCP result, if any.
pub fn first_text_block(result: &serde_json::Value) -> Option<&str> {
    result
        .get("content")?
        .as_array()?
        .iter()
        .find_map(|block| block.get("text").and_then(|t| t.as_str()))
}

/// Every `text` block of an MCP result.
pub fn text_blocks(result: &serde_json::Value) -> Vec<&str> {
    result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect()
        })
        .unwrap_or_default()
}

/// Wrap text as an MCP result.
pub fn text_result(text: impl Into<String>) -> serde_json::Value {
    serde_json::json!({"content": [{"type": "text", "text": text.into()}]})
}

// ─── Test Transport ──────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::host::lock;

    /// Records every call and answers from a per-tool table.
    ///
    /// Unknown tools answer `{"ok": true, "tool": name}` as text.
    #[derive(Default)]
    pub struct MockTransport {
        responses: Mutex<HashMap<String, serde_json::Value>>,
        failures: Mutex<HashMap<String, String>>,
        calls: Mutex<Vec<(String, serde_json::Value)>>,
        pub disconnected: bool,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn disconnected() -> Self {
            Self {
                disconnected: true,
                ..Self::default()
            }
        }

        pub fn respond(&self, tool: &str, result: serde_json::Value) {
            lock(&self.responses).insert(tool.to_string(), result);
        }

        pub fn respond_text(&self, tool: &str, text: &str) {
            self.respond(tool, text_result(text));
        }

        pub fn fail(&self, tool: &str, reason: &str) {
            lock(&self.failures).insert(tool.to_string(), reason.to_string());
        }

        pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
            lock(&self.calls).clone()
        }

        pub fn call_count(&self) -> usize {
            lock(&self.calls).len()
        }
    }

    #[async_trait]
    impl McpTransport for MockTransport {
        async fn call_tool(
            &self,
            name: &str,
            arguments: serde_json::Value,
        ) -> Result<serde_json::Value, McpError> {
            lock(&self.calls).push((name.to_string(), arguments));
            if let Some(reason) = lock(&self.failures).get(name) {
                return Err(McpError::TransportError {
                    server: "mock".into(),
                    reason: reason.clone(),
                });
            }
            Ok(lock(&self.responses).get(name).cloned().unwrap_or_else(|| {
                text_result(serde_json::json!({"ok": true, "tool": name}).to_string())
            }))
        }

        fn is_connected(&self) -> bool {
            !self.disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_text_block() {
        let result = json!({"content": [{"type": "image"}, {"type": "text", "text": "hi"}, {"text": "2"}]});
        assert_eq!(first_text_block(&result), Some("hi"));
        assert_eq!(text_blocks(&result), vec!["hi", "2"]);
        assert_eq!(first_text_block(&json!({"content": []})), None);
        assert_eq!(first_text_block(&json!("x")), None);
    }

    #[tokio::test]
    async fn test_mock_transport_records_calls() {
        let t = mock::MockTransport::new();
        t.respond_text("a", "{\"v\":1}");
        let out = t.call_tool("a", json!({"x": 1})).await.unwrap();
        assert_eq!(first_text_block(&out), Some("{\"v\":1}"));
        t.fail("b", "down");
        assert!(t.call_tool("b", json!({})).await.is_err());
        assert_eq!(t.call_count(), 2);
    }
}
