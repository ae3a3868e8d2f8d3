//! Agent Core error types.
//!
//! Most dispatcher failures are returned to the model as `{"error": ...}`
//! payloads. The variants here are the conditions that stop a call or a turn.

use thiserror::Error;

use crate::inference::errors::InferenceError;
use crate::mcp_client::errors::McpError;

/// Errors that end a tool call or an agent turn.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The user refused an approval prompt.
    #[error("User denied execution for {tool_name}")]
    UserDenied { tool_name: String },

    /// The host has no live MCP connection.
    #[error("MCP client not connected")]
    McpNotConnected,

    /// An LLM or MCP call failed.
    #[error("transport failure: {reason}")]
    Transport { reason: String },

    /// Today's spend reached the configured cap.
    #[error("daily spending cap reached: ${spent:.2} of ${cap:.2}")]
    CapExceeded { cap: f64, spent: f64 },

    /// The loop ran out of iterations before the model stopped calling tools.
    #[error("iteration limit reached ({limit})")]
    IterationLimit { limit: u32 },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// Every provider in the failover chain failed.
    #[error("all providers failed (tried: {})", attempted.join(", "))]
    AllProvidersFailed { attempted: Vec<String> },
}

impl AgentError {
    /// Whether the error should end the turn rather than be shown to the model.
    pub fn is_fatal_for_turn(&self) -> bool {
        !matches!(self, AgentError::UserDenied { .. })
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization {
            reason: e.to_string(),
        }
    }
}

impl From<McpError> for AgentError {
    fn from(e: McpError) -> Self {
        match e {
            McpError::NotConnected => AgentError::McpNotConnected,
            other => AgentError::Transport {
                reason: other.to_string(),
            },
        }
    }
}

impl From<InferenceError> for AgentError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::AllProvidersFailed { attempted } => {
                AgentError::AllProvidersFailed { attempted }
            }
            other => AgentError::Transport {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_denied_message() {
        let err = AgentError::UserDenied {
            tool_name: "roam_create_block".into(),
        };
        assert_eq!(err.to_string(), "User denied execution for roam_create_block");
        assert!(!err.is_fatal_for_turn());
    }

    #[test]
    fn test_mcp_not_connected_maps_through() {
        let err: AgentError = McpError::NotConnected.into();
        assert!(matches!(err, AgentError::McpNotConnected));

        let err: AgentError = McpError::UnknownTool { name: "x".into() }.into();
        assert!(matches!(err, AgentError::Transport { .. }));

        let err: AgentError = McpError::Timeout {
            tool: "GMAIL_FETCH_EMAILS".into(),
            timeout_ms: 30_000,
        }
        .into();
        assert!(err.to_string().contains("timed out after 30000ms"));

        let err: AgentError = McpError::ServerError {
            code: -32602,
            message: "bad params".into(),
        }
        .into();
        assert!(err.to_string().contains("[-32602]"));
    }

    #[test]
    fn test_cap_exceeded_display() {
        let err = AgentError::CapExceeded { cap: 5.0, spent: 5.25 };
        assert_eq!(err.to_string(), "daily spending cap reached: $5.25 of $5.00");
    }
}
