//! MCP client side of the core.
//!
//! This module handles:
//! - Tool descriptors and their provenance
//! - The tool registry (model, extension, local MCP, Composio namespaces)
//! - The injected transport seam and MCP result helpers
//! - Key-reference extraction from tool output

pub mod errors;
pub mod key_reference;
pub mod registry;
pub mod transport;
pub mod types;

pub use errors::McpError;
pub use key_reference::{extract_mcp_key_reference, McpKeyReference};
pub use registry::ToolRegistry;
pub use transport::{first_text_block, text_blocks, text_result, McpTransport};
pub use types::{
    FnExecutor, McpToolDefinition, ToolAnnotations, ToolDescriptor, ToolExecutor, ToolProvenance,
};
