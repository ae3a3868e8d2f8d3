//! Tool registry: every tool the dispatcher can resolve.
//!
//! Four namespaces:
//! - **model tools**: what the model sees this turn (native, extension, meta)
//! - **extension tools**: tools registered by other host extensions, which
//!   `COMPOSIO_MULTI_EXECUTE_TOOL` may target by slug
//! - **local MCP tools**: keyed by bare tool name, owned by a server
//! - **Composio schemas**: input schemas for known toolkit slugs

use std::collections::{BTreeSet, HashMap, HashSet};

use super::errors::McpError;
use super::types::{McpToolDefinition, ToolDescriptor};

// ─── ToolRegistry ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
    extension_tools: HashMap<String, ToolDescriptor>,
    local_mcp: HashMap<String, ToolDescriptor>,
    composio_schemas: HashMap<String, serde_json::Value>,
    suspended_servers: HashSet<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Model tools ──

    pub fn register_tool(&mut self, tool: ToolDescriptor) {
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn get_tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// All model-visible tools, sorted by name.
    pub fn all_tools(&self) -> Vec<&ToolDescriptor> {
        let mut tools: Vec<&ToolDescriptor> = self.tools.values().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    // ── Extension tools ──

    pub fn register_extension_tool(&mut self, tool: ToolDescriptor) {
        self.extension_tools.insert(tool.name.clone(), tool);
    }

    /// Look up an extension tool by name, case-insensitively.
    pub fn extension_tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.extension_tools.get(name).or_else(|| {
            self.extension_tools
                .values()
                .find(|t| t.name.eq_ignore_ascii_case(name))
        })
    }

    pub fn is_extension_tool(&self, name: &str) -> bool {
        self.extension_tool(name).is_some()
    }

    // ── Local MCP ──

    /// Register (or replace) the tools of a local MCP server.
    pub fn register_local_server_tools(&mut self, server: &str, tools: Vec<McpToolDefinition>) {
        self.unregister_local_server(server);
        let count = tools.len();
        for def in tools {
            let desc = def.into_descriptor(server);
            self.local_mcp.insert(desc.name.clone(), desc);
        }
        self.suspended_servers.remove(server);
        tracing::info!(server = %server, count, "registered local MCP tools");
    }

    pub fn unregister_local_server(&mut self, server: &str) {
        self.local_mcp
            .retain(|_, t| t.local_server() != Some(server));
    }

    /// Drop a server's tools after schema drift and remember the suspension.
    pub fn suspend_server(&mut self, server: &str) {
        self.unregister_local_server(server);
        self.suspended_servers.insert(server.to_string());
        tracing::warn!(server = %server, "suspended MCP server");
    }

    pub fn is_suspended(&self, server: &str) -> bool {
        self.suspended_servers.contains(server)
    }

    /// Tools of one local server, sorted by name.
    pub fn local_server_tools(&self, server: &str) -> Vec<&ToolDescriptor> {
        let mut tools: Vec<&ToolDescriptor> = self
            .local_mcp
            .values()
            .filter(|t| t.local_server() == Some(server))
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Names of servers with at least one registered tool, sorted.
    pub fn local_server_names(&self) -> Vec<String> {
        self.local_mcp
            .values()
            .filter_map(|t| t.local_server().map(String::from))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn is_local_mcp_tool(&self, name: &str) -> bool {
        self.local_mcp.contains_key(name)
    }

    /// Resolve a local MCP tool name exactly, then with any `prefix.` removed.
    pub fn resolve_local_mcp(&self, name: &str) -> Option<&ToolDescriptor> {
        self.local_mcp.get(name).or_else(|| {
            let (_, bare) = name.split_once('.')?;
            self.local_mcp.get(bare)
        })
    }

    /// The local MCP tool sharing the most name words with `name`.
    ///
    /// Words are split on `_`, `-`, `.` and whitespace; ties keep the
    /// alphabetically first tool. `None` when nothing overlaps.
    pub fn nearest_local_mcp(&self, name: &str) -> Option<&str> {
        let query = name_words(name);
        if query.is_empty() {
            return None;
        }
        let mut candidates: Vec<&ToolDescriptor> = self.local_mcp.values().collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        let mut best: Option<(&str, f64)> = None;
        for tool in candidates {
            let words = name_words(&tool.name);
            let overlap = query.intersection(&words).count();
            if overlap == 0 {
                continue;
            }
            let score = overlap as f64 / query.union(&words).count() as f64;
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((tool.name.as_str(), score));
            }
        }
        best.map(|(name, _)| name)
    }

    // ── Composio ──

    pub fn register_composio_schema(&mut self, slug: &str, schema: serde_json::Value) {
        self.composio_schemas.insert(slug.to_uppercase(), schema);
    }

    pub fn composio_schema(&self, slug: &str) -> Option<&serde_json::Value> {
        self.composio_schemas.get(&slug.to_uppercase())
    }

    // ── Lookup ──

    /// Resolve a name across model, extension and local MCP tools.
    pub fn resolve(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools
            .get(name)
            .or_else(|| self.extension_tools.get(name))
            .or_else(|| self.local_mcp.get(name))
    }

    /// Check that required top-level fields are present.
    ///
    /// Full JSON Schema validation is left to the server.
    pub fn validate_tool_call(
        &self,
        tool: &ToolDescriptor,
        arguments: &serde_json::Value,
    ) -> Result<(), McpError> {
        let Some(required) = tool.input_schema.get("required").and_then(|r| r.as_array()) else {
            return Ok(());
        };
        let args_obj = arguments.as_object();
        for field_name in required.iter().filter_map(|f| f.as_str()) {
            let present = args_obj
                .map(|obj| obj.contains_key(field_name))
                .unwrap_or(false);
            if !present {
                return Err(McpError::InvalidArguments {
                    tool: tool.name.clone(),
                    reason: format!("missing required field: '{field_name}'"),
                });
            }
        }
        Ok(())
    }
}

fn name_words(name: &str) -> HashSet<String> {
    name.split(|c: char| c == '_' || c == '-' || c == '.' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::ToolProvenance;
    use serde_json::json;

    fn def(name: &str) -> McpToolDefinition {
        serde_json::from_value(json!({
            "name": name,
            "description": format!("{name} tool"),
            "inputSchema": {"type": "object", "properties": {"item_key": {"type": "string"}}, "required": ["item_key"]}
        }))
        .unwrap()
    }

    #[test]
    fn test_register_and_resolve_model_tool() {
        let mut reg = ToolRegistry::new();
        reg.register_tool(ToolDescriptor::new("roam_search", "search", json!({})).mutating(false));
        assert_eq!(reg.len(), 1);
        assert!(reg.resolve("roam_search").is_some());
        assert!(reg.resolve("roam_nothing").is_none());
    }

    #[test]
    fn test_local_mcp_prefix_stripping() {
        let mut reg = ToolRegistry::new();
        reg.register_local_server_tools("zotero", vec![def("get_item"), def("search_items")]);
        assert!(reg.resolve_local_mcp("get_item").is_some());
        assert_eq!(
            reg.resolve_local_mcp("zotero.get_item").map(|t| t.name.as_str()),
            Some("get_item")
        );
        assert!(reg.resolve_local_mcp("zotero.missing").is_none());
        assert_eq!(reg.local_server_names(), vec!["zotero".to_string()]);
    }

    #[test]
    fn test_nearest_local_mcp_by_word_overlap() {
        let mut reg = ToolRegistry::new();
        reg.register_local_server_tools(
            "zotero",
            vec![def("get_item"), def("search_items"), def("get_collection_items")],
        );
        assert_eq!(reg.nearest_local_mcp("fetch_item"), Some("get_item"));
        assert_eq!(reg.nearest_local_mcp("search-items-now"), Some("search_items"));
        assert_eq!(reg.nearest_local_mcp("unrelated"), None);
    }

    #[test]
    fn test_suspend_server_drops_tools() {
        let mut reg = ToolRegistry::new();
        reg.register_local_server_tools("docs", vec![def("search_docs")]);
        reg.suspend_server("docs");
        assert!(reg.is_suspended("docs"));
        assert!(reg.resolve_local_mcp("search_docs").is_none());

        reg.register_local_server_tools("docs", vec![def("search_docs")]);
        assert!(!reg.is_suspended("docs"));
    }

    #[test]
    fn test_extension_lookup_case_insensitive() {
        let mut reg = ToolRegistry::new();
        reg.register_extension_tool(
            ToolDescriptor::new("bt_search_tasks", "", json!({}))
                .with_provenance(ToolProvenance::Extension),
        );
        assert!(reg.is_extension_tool("BT_SEARCH_TASKS"));
        assert!(!reg.is_extension_tool("BT_CREATE_TASK"));
    }

    #[test]
    fn test_composio_schema_uppercased() {
        let mut reg = ToolRegistry::new();
        reg.register_composio_schema("gmail_fetch_emails", json!({"type": "object"}));
        assert!(reg.composio_schema("GMAIL_FETCH_EMAILS").is_some());
    }

    #[test]
    fn test_validate_required_fields() {
        let mut reg = ToolRegistry::new();
        reg.register_local_server_tools("zotero", vec![def("get_item")]);
        let tool = reg.resolve_local_mcp("get_item").unwrap().clone();
        assert!(reg.validate_tool_call(&tool, &json!({"item_key": "AB12"})).is_ok());
        let err = reg.validate_tool_call(&tool, &json!({})).unwrap_err();
        assert!(matches!(err, McpError::InvalidArguments { .. }));
    }
}
