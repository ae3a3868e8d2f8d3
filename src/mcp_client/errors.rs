//! MCP client error types.

use thiserror::Error;

/// Errors from tool lookup and from the injected MCP transport.
#[derive(Debug, Error)]
pub enum McpError {
    /// The host has no live MCP connection.
    #[error("MCP client not connected")]
    NotConnected,

    /// Tool not found in the registry.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The transport failed (I/O, malformed message, proxy error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The server answered with a JSON-RPC error.
    #[error("server error [{code}]: {message}")]
    ServerError { code: i32, message: String },

    /// A tool call timed out.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// A locally executed tool failed.
    #[error("tool '{tool}' failed: {reason}")]
    ExecutionFailed { tool: String, reason: String },
}
