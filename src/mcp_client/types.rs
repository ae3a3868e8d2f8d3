//! Tool descriptors and the MCP tool-listing shape.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::McpError;
use crate::inference::ToolSpec;

// ─── Executors ───────────────────────────────────────────────────────────────

/// A tool that runs inside the host rather than over MCP.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, McpError>;
}

/// Adapts a synchronous closure into a [`ToolExecutor`].
pub struct FnExecutor<F>(pub F);

impl<F> FnExecutor<F>
where
    F: Fn(serde_json::Value) -> Result<serde_json::Value, McpError> + Send + Sync + 'static,
{
    /// Wrap `f` as a shareable executor.
    pub fn shared(f: F) -> Arc<dyn ToolExecutor> {
        Arc::new(FnExecutor(f))
    }
}

#[async_trait]
impl<F> ToolExecutor for FnExecutor<F>
where
    F: Fn(serde_json::Value) -> Result<serde_json::Value, McpError> + Send + Sync,
{
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, McpError> {
        (self.0)(arguments)
    }
}

// ─── Descriptors ─────────────────────────────────────────────────────────────

/// Where a tool came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolProvenance {
    /// Built into the assistant (graph reads/writes, memory, time).
    Native,
    /// Registered by another host extension.
    Extension,
    /// A tool whose arguments name another tool.
    Meta,
    /// Exposed by a local MCP server.
    LocalMcp { server: String },
    /// A Composio toolkit action.
    Composio { slug: String },
}

/// A callable tool exposed to the model.
///
/// `is_mutating` is tri-state: `None` means unknown and falls through to the
/// name heuristics. `executor = None` means the call goes over MCP.
#[derive(Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_mutating: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<ToolProvenance>,
    #[serde(skip)]
    pub executor: Option<Arc<dyn ToolExecutor>>,
}

impl ToolDescriptor {
    pub fn new(name: &str, description: &str, input_schema: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
            is_mutating: None,
            provenance: None,
            executor: None,
        }
    }

    pub fn mutating(mut self, is_mutating: bool) -> Self {
        self.is_mutating = Some(is_mutating);
        self
    }

    pub fn with_provenance(mut self, provenance: ToolProvenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// The local MCP server that owns this tool, if any.
    pub fn local_server(&self) -> Option<&str> {
        match &self.provenance {
            Some(ToolProvenance::LocalMcp { server }) => Some(server),
            _ => None,
        }
    }

    /// Top-level parameter names from the input schema.
    pub fn param_names(&self) -> Vec<String> {
        self.input_schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn to_tool_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("is_mutating", &self.is_mutating)
            .field("provenance", &self.provenance)
            .field("has_executor", &self.executor.is_some())
            .finish()
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Behaviour hints an MCP server may attach to a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
    #[serde(default)]
    pub read_only_hint: Option<bool>,
    #[serde(default)]
    pub destructive_hint: Option<bool>,
}

/// A tool as returned by an MCP server's `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub annotations: Option<ToolAnnotations>,
}

impl McpToolDefinition {
    pub fn new(name: &str, description: &str, input_schema: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
            annotations: None,
        }
    }

    /// Set the server's `readOnlyHint`.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.annotations.get_or_insert_with(ToolAnnotations::default).read_only_hint = Some(read_only);
        self
    }

    /// Convert into a descriptor owned by a local MCP server.
    ///
    /// `readOnlyHint` becomes `is_mutating = Some(!hint)`; a destructive hint
    /// without a read-only hint marks the tool mutating.
    pub fn into_descriptor(self, server: &str) -> ToolDescriptor {
        let is_mutating = self.annotations.as_ref().and_then(|a| {
            a.read_only_hint
                .map(|ro| !ro)
                .or(a.destructive_hint.filter(|d| *d))
        });
        ToolDescriptor {
            name: self.name,
            description: self.description,
            input_schema: self.input_schema,
            is_mutating,
            provenance: Some(ToolProvenance::LocalMcp {
                server: server.to_string(),
            }),
            executor: None,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
