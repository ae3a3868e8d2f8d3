//! Mutation classification for tool calls.
//!
//! Decides whether a call may change external state and therefore needs an
//! approval. Checked in priority order:
//!
//! 1. an explicit `is_mutating` on the resolved descriptor
//! 2. meta-tool argument inspection (connection manager, multi-execute,
//!    local MCP execute)
//! 3. the short read-token set for external-extension tools
//! 4. the extended read-token set for local MCP tools
//! 5. any sensitive token in the name

use serde_json::Value;

use super::meta_tools::{
    is_connection_manager, local_mcp_inner, normalise_multi_execute_args, LOCAL_MCP_EXECUTE,
    MULTI_EXECUTE_TOOL, READ_ONLY_CONNECTION_ACTIONS,
};
use crate::mcp_client::{ToolDescriptor, ToolProvenance, ToolRegistry};
use crate::security::patterns::{has_any_token, CompiledPatterns};

/// Whether dispatching `name` with `args` may mutate external state.
///
/// `tool` is the descriptor the caller already resolved, if any; otherwise
/// the registry is consulted.
pub fn is_potentially_mutating_tool(
    name: &str,
    args: &Value,
    tool: Option<&ToolDescriptor>,
    registry: &ToolRegistry,
    patterns: &CompiledPatterns,
) -> bool {
    let tool = tool.or_else(|| registry.resolve(name));
    if let Some(explicit) = tool.and_then(|t| t.is_mutating) {
        return explicit;
    }

    if is_connection_manager(name) {
        let action = args
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        return !READ_ONLY_CONNECTION_ACTIONS.contains(&action.as_str());
    }

    if name == MULTI_EXECUTE_TOOL {
        let calls = normalise_multi_execute_args(args);
        return calls.is_empty() || !calls.iter().all(|c| patterns.is_read_only_slug(&c.tool_slug));
    }

    if name == LOCAL_MCP_EXECUTE {
        let (inner, _) = local_mcp_inner(args);
        let Some(inner) = inner else {
            return true;
        };
        if let Some(explicit) = registry.resolve_local_mcp(&inner).and_then(|t| t.is_mutating) {
            return explicit;
        }
        return !looks_read_only(&inner, &patterns.local_mcp_read_only_tokens, patterns);
    }

    let is_extension = registry.is_extension_tool(name)
        || matches!(tool.and_then(|t| t.provenance.as_ref()), Some(ToolProvenance::Extension));
    if is_extension {
        return !looks_read_only(name, &patterns.extension_read_only_tokens, patterns);
    }

    let is_local = registry.is_local_mcp_tool(name) || tool.and_then(ToolDescriptor::local_server).is_some();
    if is_local {
        return !looks_read_only(name, &patterns.local_mcp_read_only_tokens, patterns);
    }

    has_any_token(name, &patterns.sensitive_tokens)
}

/// A read token is present and no sensitive token is.
fn looks_read_only(name: &str, read_tokens: &[String], patterns: &CompiledPatterns) -> bool {
    has_any_token(name, read_tokens) && !has_any_token(name, &patterns.sensitive_tokens)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
