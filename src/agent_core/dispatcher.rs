//! ToolDispatcher: the only path from a model tool call to a side effect.
//!
//! One call goes through:
//! - name normalisation (`-` → `_`) and the direct Composio slug rewrite
//! - read-only mode filtering
//! - meta-tool interception (`COMPOSIO_MULTI_EXECUTE_TOOL`, `LOCAL_MCP_EXECUTE`)
//! - mutation classification and approval gating (dry run, TTL approvals,
//!   scoped page approvals)
//! - execution through the tool's executor or the MCP transport
//! - result normalisation
//!
//! Recoverable failures come back as `{"error": ...}` payloads the model can
//! read. Only a denied approval and a missing MCP connection are `Err`.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};

use super::errors::AgentError;
use super::meta_tools::{
    is_composio_slug_shape, local_mcp_approval_key, local_mcp_inner, multi_execute_approval_key,
    multi_execute_args, multi_execute_slugs, normalise_multi_execute_args,
    validate_key_shaped_params, MultiExecuteCall, LOCAL_MCP_EXECUTE, MULTI_EXECUTE_TOOL,
};
use super::mutation::is_potentially_mutating_tool;
use super::session::Session;
use crate::host::{ApprovalPrompter, IdentityPageResolver, PageResolver};
use crate::inference::converter::is_successful_result_value;
use crate::mcp_client::{first_text_block, McpError, McpTransport, ToolDescriptor, ToolRegistry};
use crate::security::patterns::{default_patterns, CompiledPatterns};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Block-creation tools approved per target page rather than per tool.
pub const PAGE_SCOPED_TOOLS: &[&str] = &["roam_create_block", "roam_create_blocks", "roam_batch_write"];

/// Array arguments whose items may carry their own `parent_uid`.
const BATCH_KEYS: &[&str] = &["batches", "actions", "blocks"];

// ─── Options ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Restrict dispatch to the read-only allowlist and tools marked
    /// non-mutating.
    pub read_only: bool,
}

impl ExecuteOptions {
    pub fn read_only() -> Self {
        Self { read_only: true }
    }
}

// ─── ToolDispatcher ─────────────────────────────────────────────────────────

pub struct ToolDispatcher {
    registry: ToolRegistry,
    transport: Arc<dyn McpTransport>,
    prompter: Arc<dyn ApprovalPrompter>,
    pages: Arc<dyn PageResolver>,
    patterns: Arc<CompiledPatterns>,
}

impl ToolDispatcher {
    pub fn new(
        registry: ToolRegistry,
        transport: Arc<dyn McpTransport>,
        prompter: Arc<dyn ApprovalPrompter>,
    ) -> Self {
        Self {
            registry,
            transport,
            prompter,
            pages: Arc::new(IdentityPageResolver),
            patterns: Arc::new(default_patterns().clone()),
        }
    }

    pub fn with_page_resolver(mut self, pages: Arc<dyn PageResolver>) -> Self {
        self.pages = pages;
        self
    }

    pub fn with_patterns(mut self, patterns: Arc<CompiledPatterns>) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.registry
    }

    pub fn patterns(&self) -> &CompiledPatterns {
        &self.patterns
    }

    pub fn is_potentially_mutating_tool(
        &self,
        name: &str,
        args: &Value,
        tool: Option<&ToolDescriptor>,
    ) -> bool {
        is_potentially_mutating_tool(name, args, tool, &self.registry, &self.patterns)
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Dispatch one tool call.
    pub async fn execute_tool_call(
        &self,
        session: &mut Session,
        name: &str,
        args: Value,
        options: ExecuteOptions,
    ) -> Result<Value, AgentError> {
        let mut name = normalise_tool_name(name);
        let mut args = args;

        if let Some(wrapped) = self.composio_rewrite(&name, &args) {
            tracing::debug!(slug = %name, "rewrapping direct Composio slug as multi-execute");
            name = MULTI_EXECUTE_TOOL.to_string();
            args = wrapped;
        }

        session.usage.record_usage_stat("toolCalls", Some(name.as_str()));

        if options.read_only && !self.allowed_in_read_only(&name) {
            tracing::info!(tool = %name, "rejected tool call in read-only mode");
            return Ok(json!({
                "error": format!(
                    "{name} is not available in read-only mode. Do not retry it; \
                     summarise your findings for the user instead."
                )
            }));
        }

        match name.as_str() {
            MULTI_EXECUTE_TOOL => self.run_multi_execute(session, &args).await,
            LOCAL_MCP_EXECUTE => self.run_local_mcp(session, &args).await,
            _ => self.run_tool(session, &name, args).await,
        }
    }

    /// A registered tool called by name.
    async fn run_tool(&self, session: &mut Session, name: &str, args: Value) -> Result<Value, AgentError> {
        let Some(tool) = self.registry.resolve(name) else {
            tracing::warn!(tool = %name, "unknown tool");
            return Ok(error_payload(format!("Unknown tool: {name}")));
        };
        if let Err(e) = self.registry.validate_tool_call(tool, &args) {
            return Ok(error_payload(e.to_string()));
        }

        if self.is_potentially_mutating_tool(name, &args, Some(tool)) {
            if let Some(simulated) = self.gate(session, name, &args, name).await? {
                return Ok(simulated);
            }
        }
        if tool.local_server().is_some() {
            session.session_used_local_mcp = true;
        }
        self.invoke(tool, args).await
    }

    // ─── Multi-Execute ──────────────────────────────────────────────────

    async fn run_multi_execute(&self, session: &mut Session, args: &Value) -> Result<Value, AgentError> {
        let calls = normalise_multi_execute_args(args);
        if calls.is_empty() {
            return Ok(composio_error(format!(
                "{MULTI_EXECUTE_TOOL} needs a non-empty tools array of {{tool_slug, arguments}}"
            )));
        }

        let extension: Vec<Option<&ToolDescriptor>> = calls
            .iter()
            .map(|c| self.registry.extension_tool(&c.tool_slug))
            .collect();

        let not_executable: Vec<&str> = extension
            .iter()
            .flatten()
            .filter(|t| t.executor.is_none())
            .map(|t| t.name.as_str())
            .collect();
        if !not_executable.is_empty() {
            return Ok(composio_error(format!(
                "These extension tools cannot be run through {MULTI_EXECUTE_TOOL}: {}. \
                 Call them directly by name.",
                not_executable.join(", ")
            )));
        }

        if extension.iter().all(Option::is_some) {
            return self.run_extension_batch(session, &calls).await;
        }

        let unknown: Vec<String> = multi_execute_slugs(&calls)
            .into_iter()
            .filter(|s| !self.patterns.safe_slugs.contains(s) && !self.patterns.is_read_only_slug(s))
            .collect();
        if !unknown.is_empty() {
            let prompt_args = json!({ "tools": calls, "unknown_slugs": unknown });
            let key = multi_execute_approval_key(&calls);
            if let Some(simulated) = self.gate(session, MULTI_EXECUTE_TOOL, &prompt_args, &key).await? {
                return Ok(simulated);
            }
        }

        self.ensure_connected()?;
        match self
            .transport
            .call_tool(MULTI_EXECUTE_TOOL, multi_execute_args(&calls))
            .await
        {
            Ok(raw) => {
                let result = normalise_tool_result(raw);
                if is_successful_result_value(&result) {
                    record_response_shapes(session, &calls, &result);
                }
                Ok(result)
            }
            Err(McpError::NotConnected) => Err(AgentError::McpNotConnected),
            Err(e) => {
                tracing::warn!(error = %e, slugs = ?multi_execute_slugs(&calls), "multi-execute failed");
                Ok(composio_error(e.to_string()))
            }
        }
    }

    /// Every slug is an extension tool: run each one here, in order.
    async fn run_extension_batch(
        &self,
        session: &mut Session,
        calls: &[MultiExecuteCall],
    ) -> Result<Value, AgentError> {
        let mutating = calls.iter().any(|c| {
            let tool = self.registry.extension_tool(&c.tool_slug);
            self.is_potentially_mutating_tool(&c.tool_slug, &c.arguments, tool)
        });
        if mutating {
            let key = multi_execute_approval_key(calls);
            let prompt_args = multi_execute_args(calls);
            if let Some(simulated) = self.gate(session, MULTI_EXECUTE_TOOL, &prompt_args, &key).await? {
                return Ok(simulated);
            }
        }

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let Some(tool) = self.registry.extension_tool(&call.tool_slug) else {
                continue;
            };
            let value = self.invoke(tool, call.arguments.clone()).await?;
            let entry = match value.get("error").filter(|e| !e.is_null()) {
                Some(error) => json!({ "tool": tool.name, "error": error }),
                None => json!({ "tool": tool.name, "result": value }),
            };
            results.push(entry);
        }
        tracing::debug!(count = results.len(), "ran extension tools locally");
        Ok(json!({ "successful": true, "data": { "results": results } }))
    }

    // ─── Local MCP ──────────────────────────────────────────────────────

    async fn run_local_mcp(&self, session: &mut Session, args: &Value) -> Result<Value, AgentError> {
        let (inner, inner_args) = local_mcp_inner(args);
        let Some(inner) = inner else {
            return Ok(error_payload(format!("{LOCAL_MCP_EXECUTE} needs a tool_name")));
        };

        let Some(tool) = self.registry.resolve_local_mcp(&inner) else {
            let message = match self.registry.nearest_local_mcp(&inner) {
                Some(nearest) => format!("Unknown local MCP tool '{inner}'. Did you mean '{nearest}'?"),
                None => format!(
                    "Unknown local MCP tool '{inner}'. Connected servers: {}",
                    self.registry.local_server_names().join(", ")
                ),
            };
            tracing::info!(tool = %inner, "local MCP tool not found");
            return Ok(error_payload(message));
        };

        if let Err(message) = validate_key_shaped_params(&tool.name, &inner_args) {
            tracing::info!(tool = %tool.name, "rejected non-identifier key parameter");
            return Ok(error_payload(message));
        }
        if let Err(e) = self.registry.validate_tool_call(tool, &inner_args) {
            return Ok(error_payload(e.to_string()));
        }

        session.session_used_local_mcp = true;

        if self.is_potentially_mutating_tool(&tool.name, &inner_args, Some(tool)) {
            let prompt_args = json!({ "tool_name": tool.name, "arguments": inner_args });
            let key = local_mcp_approval_key(&tool.name);
            if let Some(simulated) = self.gate(session, LOCAL_MCP_EXECUTE, &prompt_args, &key).await? {
                return Ok(simulated);
            }
        }
        self.invoke(tool, inner_args).await
    }

    // ─── Approval Gating ────────────────────────────────────────────────

    /// Clear a mutating call for dispatch.
    ///
    /// Returns `Some(payload)` when a pending dry run consumed the call.
    async fn gate(
        &self,
        session: &mut Session,
        tool_name: &str,
        args: &Value,
        approval_key: &str,
    ) -> Result<Option<Value>, AgentError> {
        if session.take_dry_run() {
            tracing::info!(tool = %tool_name, "dry run consumed");
            return Ok(Some(json!({
                "dry_run": true,
                "simulated": true,
                "tool_name": tool_name,
                "arguments": args,
            })));
        }

        if PAGE_SCOPED_TOOLS.contains(&tool_name) {
            let pages = self.target_page_uids(args).await;
            if !pages.is_empty() {
                if session.approvals.all_valid(pages.iter().map(String::as_str)) {
                    tracing::debug!(tool = %tool_name, pages = ?pages, "pages already approved");
                    return Ok(None);
                }
                let mut prompt_args = args.clone();
                if let Some(map) = prompt_args.as_object_mut() {
                    map.insert("target_pages".into(), json!(pages));
                }
                self.prompt(session, tool_name, &prompt_args).await?;
                for page in &pages {
                    session.approvals.remember(page);
                }
                return Ok(None);
            }
        }

        if session.approvals.has_valid(approval_key) {
            return Ok(None);
        }
        self.prompt(session, tool_name, args).await?;
        session.approvals.remember(approval_key);
        Ok(None)
    }

    async fn prompt(&self, session: &Session, tool_name: &str, args: &Value) -> Result<(), AgentError> {
        if self.prompter.request_approval(tool_name, args).await {
            session.usage.record_usage_stat("approvalsGranted", None);
            Ok(())
        } else {
            session.usage.record_usage_stat("approvalsDenied", None);
            tracing::info!(tool = %tool_name, "user denied tool call");
            Err(AgentError::UserDenied {
                tool_name: tool_name.to_string(),
            })
        }
    }

    /// Page uids a block-creation call writes under, resolved block → page.
    async fn target_page_uids(&self, args: &Value) -> Vec<String> {
        let mut uids: Vec<&str> = Vec::new();
        if let Some(uid) = args.get("parent_uid").and_then(Value::as_str) {
            uids.push(uid);
        }
        for key in BATCH_KEYS {
            for item in args.get(*key).and_then(Value::as_array).into_iter().flatten() {
                let uid = item
                    .get("parent_uid")
                    .or_else(|| item.get("location").and_then(|l| l.get("parent_uid")))
                    .and_then(Value::as_str);
                uids.extend(uid);
            }
        }

        let mut pages = BTreeSet::new();
        for uid in uids.into_iter().map(str::trim).filter(|u| !u.is_empty()) {
            let page = self
                .pages
                .page_uid_for(uid)
                .await
                .unwrap_or_else(|| uid.to_string());
            pages.insert(page);
        }
        pages.into_iter().collect()
    }

    // ─── Execution ──────────────────────────────────────────────────────

    async fn invoke(&self, tool: &ToolDescriptor, args: Value) -> Result<Value, AgentError> {
        let outcome = match &tool.executor {
            Some(executor) => executor.execute(args).await,
            None => {
                self.ensure_connected()?;
                self.transport.call_tool(&tool.name, args).await
            }
        };
        match outcome {
            Ok(raw) => Ok(normalise_tool_result(raw)),
            Err(McpError::NotConnected) => Err(AgentError::McpNotConnected),
            Err(e) => {
                tracing::warn!(tool = %tool.name, error = %e, "tool call failed");
                Ok(error_payload(e.to_string()))
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), AgentError> {
        if self.transport.is_connected() {
            Ok(())
        } else {
            Err(AgentError::McpNotConnected)
        }
    }

    fn allowed_in_read_only(&self, name: &str) -> bool {
        self.patterns.read_only_allowlist.contains(name)
            || self
                .registry
                .resolve(name)
                .is_some_and(|t| t.is_mutating == Some(false))
    }

    /// `GMAIL_FETCH_EMAILS(args)` → `COMPOSIO_MULTI_EXECUTE_TOOL({tools: [...]})`
    /// when the slug is not a local tool but has a known Composio schema.
    fn composio_rewrite(&self, name: &str, args: &Value) -> Option<Value> {
        if name == MULTI_EXECUTE_TOOL
            || name == LOCAL_MCP_EXECUTE
            || !is_composio_slug_shape(name)
            || self.registry.resolve(name).is_some()
            || self.registry.composio_schema(name).is_none()
        {
            return None;
        }
        let arguments = if args.is_object() { args.clone() } else { json!({}) };
        Some(json!({ "tools": [{ "tool_slug": name.to_uppercase(), "arguments": arguments }] }))
    }
}

// ─── Free Functions ─────────────────────────────────────────────────────────

/// Rewrite hyphens to underscores: `cos_get-current-time` → `cos_get_current_time`.
pub fn normalise_tool_name(name: &str) -> String {
    if !name.contains('-') {
        return name.to_string();
    }
    let normalised = name.replace('-', "_");
    tracing::debug!(from = %name, to = %normalised, "normalised tool name");
    normalised
}

/// Parse the first text block of an MCP result as JSON, else wrap it as
/// `{text}`. Results without text blocks are returned unchanged.
pub fn normalise_tool_result(raw: Value) -> Value {
    match first_text_block(&raw) {
        Some(text) => serde_json::from_str(text.trim()).unwrap_or_else(|_| json!({ "text": text })),
        None => raw,
    }
}

fn error_payload(message: impl Into<String>) -> Value {
    json!({ "error": message.into() })
}

fn composio_error(message: impl Into<String>) -> Value {
    let message = message.into();
    json!({ "successful": false, "error": message, "data": { "error": message } })
}

fn record_response_shapes(session: &mut Session, calls: &[MultiExecuteCall], result: &Value) {
    let per_call = result
        .get("data")
        .and_then(|d| d.get("results"))
        .and_then(Value::as_array)
        .filter(|r| r.len() == calls.len());
    match per_call {
        Some(entries) => {
            for (call, entry) in calls.iter().zip(entries) {
                let response = entry.get("response").unwrap_or(entry);
                session.response_shapes.record(&call.tool_slug, response);
            }
        }
        None if calls.len() == 1 => session.response_shapes.record(&calls[0].tool_slug, result),
        None => {}
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoreConfig, UsageConfig};
    use crate::host::{Clock, ManualClock, MapPageResolver, ScriptedPrompter};
    use crate::mcp_client::transport::mock::MockTransport;
    use crate::mcp_client::{text_result, FnExecutor, McpToolDefinition, ToolProvenance};
    use crate::usage::UsageTracker;
    use std::time::Duration;

    struct Fixture {
        dispatcher: ToolDispatcher,
        transport: Arc<MockTransport>,
        prompter: Arc<ScriptedPrompter>,
        clock: Arc<ManualClock>,
        session: Session,
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register_tool(ToolDescriptor::new("roam_search", "Search the graph", json!({})).mutating(false));
        reg.register_tool(ToolDescriptor::new(
            "roam_create_block",
            "Create a block",
            json!({"type": "object", "required": ["parent_uid"]}),
        ));
        reg.register_tool(ToolDescriptor::new("roam_batch_write", "Batch write", json!({})));
        reg.register_tool(ToolDescriptor::new("cos_update_memory", "Update memory", json!({})));
        reg.register_tool(
            ToolDescriptor::new("cos_get_current_time", "Current time", json!({}))
                .mutating(false)
                .with_executor(FnExecutor::shared(|_| Ok(json!({"time": "12:00"})))),
        );
        reg.register_composio_schema("GMAIL_FETCH_EMAILS", json!({"type": "object"}));
        reg.register_composio_schema("GMAIL_SEND_EMAIL", json!({"type": "object"}));
        reg.register_local_server_tools(
            "zotero",
            vec![
                McpToolDefinition::new("search_items", "", json!({})),
                McpToolDefinition::new("get_item", "", json!({})),
                McpToolDefinition::new("add_note", "", json!({})),
            ],
        );
        reg
    }

    fn fixture_with(prompter: ScriptedPrompter, pages: MapPageResolver) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let prompter = Arc::new(prompter);
        let clock = Arc::new(ManualClock::at_fixed_date());
        let shared_clock: Arc<dyn Clock> = clock.clone();
        let usage = Arc::new(UsageTracker::new(UsageConfig::default(), None, shared_clock.clone()));
        let session = Session::new(&CoreConfig::default(), usage, shared_clock);
        let dispatcher = ToolDispatcher::new(registry(), transport.clone(), prompter.clone())
            .with_page_resolver(Arc::new(pages));
        Fixture {
            dispatcher,
            transport,
            prompter,
            clock,
            session,
        }
    }

    fn fixture(prompter: ScriptedPrompter) -> Fixture {
        fixture_with(prompter, MapPageResolver::default())
    }

    impl Fixture {
        async fn call(&mut self, name: &str, args: Value) -> Result<Value, AgentError> {
            self.dispatcher
                .execute_tool_call(&mut self.session, name, args, ExecuteOptions::default())
                .await
        }
    }

    #[tokio::test]
    async fn test_direct_composio_slug_is_rewrapped() {
        let mut fx = fixture(ScriptedPrompter::denying());
        fx.call("GMAIL_FETCH_EMAILS", json!({"q": "x"})).await.unwrap();

        let calls = fx.transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "COMPOSIO_MULTI_EXECUTE_TOOL");
        assert_eq!(
            calls[0].1,
            json!({"tools": [{"tool_slug": "GMAIL_FETCH_EMAILS", "arguments": {"q": "x"}}]})
        );
        assert_eq!(fx.prompter.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_hyphenated_name_is_normalised() {
        let mut fx = fixture(ScriptedPrompter::denying());
        let result = fx.call("cos_get-current-time", json!({})).await.unwrap();
        assert_eq!(result, json!({"time": "12:00"}));
    }

    #[tokio::test]
    async fn test_approval_reused_within_ttl_then_expires() {
        let mut fx = fixture(ScriptedPrompter::approving());
        fx.call("cos_update_memory", json!({"page": "Memory"})).await.unwrap();
        fx.call("cos_update_memory", json!({"page": "Memory"})).await.unwrap();
        assert_eq!(fx.prompter.prompt_count(), 1);

        fx.clock.advance(Duration::from_secs(15 * 60));
        fx.call("cos_update_memory", json!({"page": "Memory"})).await.unwrap();
        assert_eq!(fx.prompter.prompt_count(), 2);
        assert_eq!(fx.session.usage.counter_today("approvalsGranted"), 2);
    }

    #[tokio::test]
    async fn test_denial_raises_user_denied() {
        let mut fx = fixture(ScriptedPrompter::denying());
        let err = fx.call("cos_update_memory", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "User denied execution for cos_update_memory");
        assert_eq!(fx.transport.call_count(), 0);
        assert_eq!(fx.session.usage.counter_today("approvalsDenied"), 1);
    }

    #[tokio::test]
    async fn test_read_only_tools_skip_approval() {
        let mut fx = fixture(ScriptedPrompter::denying());
        fx.call("roam_search", json!({"q": "x"})).await.unwrap();
        assert_eq!(fx.prompter.prompt_count(), 0);
        assert_eq!(fx.session.usage.usage_stats_summary(1).tool_calls.get("roam_search"), Some(&1));
    }

    #[tokio::test]
    async fn test_multi_execute_key_uses_sorted_slug_set() {
        let mut fx = fixture(ScriptedPrompter::approving());
        let ab = json!({"tools": [{"tool_slug": "SLACK_SEND_MESSAGE"}, {"tool_slug": "GMAIL_SEND_EMAIL"}]});
        let ba = json!({"tools": [{"tool_slug": "GMAIL_SEND_EMAIL"}, {"tool_slug": "SLACK_SEND_MESSAGE"}]});
        fx.call(MULTI_EXECUTE_TOOL, ab).await.unwrap();
        fx.call(MULTI_EXECUTE_TOOL, ba).await.unwrap();
        assert_eq!(fx.prompter.prompt_count(), 1);

        let prompt = &fx.prompter.prompts()[0];
        assert_eq!(prompt.1["unknown_slugs"], json!(["GMAIL_SEND_EMAIL", "SLACK_SEND_MESSAGE"]));

        fx.call(MULTI_EXECUTE_TOOL, json!({"tools": [{"tool_slug": "GMAIL_SEND_EMAIL"}]}))
            .await
            .unwrap();
        assert_eq!(fx.prompter.prompt_count(), 2);
    }

    #[tokio::test]
    async fn test_multi_execute_safe_and_read_slugs_do_not_prompt() {
        let mut fx = fixture(ScriptedPrompter::denying());
        let args = json!({"tools": [
            {"tool_slug": "COMPOSIO_SEARCH_TOOLS", "arguments": {"q": "calendar"}},
            {"tool_slug": "GOOGLECALENDAR_LIST_EVENTS"},
        ]});
        fx.call(MULTI_EXECUTE_TOOL, args).await.unwrap();
        assert_eq!(fx.prompter.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_multi_execute_denied() {
        let mut fx = fixture(ScriptedPrompter::denying());
        let err = fx
            .call(MULTI_EXECUTE_TOOL, json!({"tools": [{"tool_slug": "GMAIL_SEND_EMAIL"}]}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UserDenied { ref tool_name } if tool_name == MULTI_EXECUTE_TOOL));
        assert_eq!(fx.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_multi_execute_records_response_shape() {
        let mut fx = fixture(ScriptedPrompter::denying());
        fx.transport.respond_text(
            MULTI_EXECUTE_TOOL,
            r#"{"successful": true, "data": {"results": [{"response": {"data": {"messages": []}}}]}}"#,
        );
        fx.call("GMAIL_FETCH_EMAILS", json!({})).await.unwrap();
        let shape = fx.session.response_shapes.shape("GMAIL_FETCH_EMAILS").unwrap();
        assert_eq!(shape.data_keys, vec!["messages"]);
    }

    #[tokio::test]
    async fn test_extension_slugs_run_locally() {
        let mut fx = fixture(ScriptedPrompter::approving());
        fx.dispatcher.registry_mut().register_extension_tool(
            ToolDescriptor::new("WR_GET_WORD", "", json!({}))
                .with_provenance(ToolProvenance::Extension)
                .with_executor(FnExecutor::shared(|args| Ok(json!({"word": args["id"]})))),
        );
        fx.dispatcher.registry_mut().register_extension_tool(
            ToolDescriptor::new("WR_LIST_WORDS", "", json!({}))
                .with_provenance(ToolProvenance::Extension)
                .with_executor(FnExecutor::shared(|_| {
                    Err(McpError::ExecutionFailed {
                        tool: "WR_LIST_WORDS".into(),
                        reason: "offline".into(),
                    })
                })),
        );
        let args = json!({"tools": [
            {"tool_slug": "wr_get_word", "arguments": {"id": 7}},
            {"tool_slug": "WR_LIST_WORDS"},
        ]});
        let result = fx.call(MULTI_EXECUTE_TOOL, args).await.unwrap();
        assert_eq!(result["successful"], true);
        let results = result["data"]["results"].as_array().unwrap();
        assert_eq!(results[0], json!({"tool": "WR_GET_WORD", "result": {"word": 7}}));
        assert!(results[1]["error"].as_str().unwrap().contains("offline"));
        assert_eq!(fx.transport.call_count(), 0);
        assert_eq!(fx.prompter.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_extension_slug_without_executor_is_error() {
        let mut fx = fixture(ScriptedPrompter::approving());
        fx.dispatcher
            .registry_mut()
            .register_extension_tool(ToolDescriptor::new("WR_SAVE_WORD", "", json!({})));
        let result = fx
            .call(MULTI_EXECUTE_TOOL, json!({"tools": [{"tool_slug": "WR_SAVE_WORD"}]}))
            .await
            .unwrap();
        assert_eq!(result["successful"], false);
        assert!(result["data"]["error"].as_str().unwrap().contains("WR_SAVE_WORD"));
    }

    #[tokio::test]
    async fn test_local_mcp_prefix_stripped_and_read_runs_unprompted() {
        let mut fx = fixture(ScriptedPrompter::denying());
        fx.transport.respond_text("search_items", r#"{"items": []}"#);
        let result = fx
            .call(LOCAL_MCP_EXECUTE, json!({"tool_name": "zotero.search_items", "arguments": {"q": "x"}}))
            .await
            .unwrap();
        assert_eq!(result, json!({"items": []}));
        assert_eq!(fx.transport.calls()[0].0, "search_items");
        assert!(fx.session.session_used_local_mcp);
    }

    #[tokio::test]
    async fn test_local_mcp_miss_suggests_nearest() {
        let mut fx = fixture(ScriptedPrompter::denying());
        let result = fx
            .call(LOCAL_MCP_EXECUTE, json!({"tool_name": "search_items_list"}))
            .await
            .unwrap();
        assert!(result["error"].as_str().unwrap().contains("Did you mean 'search_items'"));
    }

    #[tokio::test]
    async fn test_local_mcp_rejects_title_as_key() {
        let mut fx = fixture(ScriptedPrompter::approving());
        let result = fx
            .call(LOCAL_MCP_EXECUTE, json!({"tool_name": "get_item", "arguments": {"item_key": "Deep Learning"}}))
            .await
            .unwrap();
        assert!(result["error"].as_str().unwrap().contains("item_key"));
        assert_eq!(fx.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_local_mcp_write_uses_inner_approval_key() {
        let mut fx = fixture(ScriptedPrompter::approving());
        let args = json!({"tool_name": "add_note", "arguments": {"item_key": "K1", "note": "hi"}});
        fx.call(LOCAL_MCP_EXECUTE, args.clone()).await.unwrap();
        fx.call(LOCAL_MCP_EXECUTE, args).await.unwrap();
        assert_eq!(fx.prompter.prompt_count(), 1);
        assert!(fx.session.approvals.has_valid("LOCAL_MCP_EXECUTE::add_note"));
    }

    #[tokio::test]
    async fn test_scoped_page_approval_shared_by_blocks_on_same_page() {
        let pages = MapPageResolver::new([
            ("block-1".to_string(), "page-a".to_string()),
            ("block-2".to_string(), "page-a".to_string()),
            ("block-3".to_string(), "page-b".to_string()),
        ]);
        let mut fx = fixture_with(ScriptedPrompter::approving(), pages);

        fx.call("roam_create_block", json!({"parent_uid": "block-1", "string": "a"})).await.unwrap();
        fx.call("roam_create_block", json!({"parent_uid": "block-2", "string": "b"})).await.unwrap();
        assert_eq!(fx.prompter.prompt_count(), 1);
        assert_eq!(fx.prompter.prompts()[0].1["target_pages"], json!(["page-a"]));

        let batch = json!({"actions": [
            {"action": "create-block", "location": {"parent_uid": "block-1"}},
            {"action": "create-block", "location": {"parent_uid": "block-3"}},
        ]});
        fx.call("roam_batch_write", batch.clone()).await.unwrap();
        assert_eq!(fx.prompter.prompt_count(), 2);
        assert_eq!(fx.prompter.prompts()[1].1["target_pages"], json!(["page-a", "page-b"]));

        fx.call("roam_batch_write", batch).await.unwrap();
        assert_eq!(fx.prompter.prompt_count(), 2);
    }

    #[tokio::test]
    async fn test_read_only_mode() {
        let mut fx = fixture(ScriptedPrompter::approving());
        let opts = ExecuteOptions::read_only();
        let rejected = fx
            .dispatcher
            .execute_tool_call(&mut fx.session, "cos_update_memory", json!({}), opts)
            .await
            .unwrap();
        assert!(rejected["error"].as_str().unwrap().contains("read-only mode"));

        let allowed = fx
            .dispatcher
            .execute_tool_call(&mut fx.session, "roam_search", json!({}), opts)
            .await
            .unwrap();
        assert!(allowed.get("error").is_none());

        let explicit = fx
            .dispatcher
            .execute_tool_call(&mut fx.session, "cos_get_current_time", json!({}), opts)
            .await
            .unwrap();
        assert_eq!(explicit, json!({"time": "12:00"}));
        assert_eq!(fx.prompter.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_simulates_next_mutating_call() {
        let mut fx = fixture(ScriptedPrompter::approving());
        fx.session.request_dry_run();
        let result = fx
            .call("roam_create_block", json!({"parent_uid": "p", "string": "x"}))
            .await
            .unwrap();
        assert_eq!(result["dry_run"], true);
        assert_eq!(result["simulated"], true);
        assert_eq!(result["tool_name"], "roam_create_block");
        assert_eq!(fx.transport.call_count(), 0);
        assert_eq!(fx.prompter.prompt_count(), 0);

        fx.call("roam_create_block", json!({"parent_uid": "p", "string": "x"})).await.unwrap();
        assert_eq!(fx.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_result_normalisation() {
        assert_eq!(normalise_tool_result(text_result(r#"{"a": 1}"#)), json!({"a": 1}));
        assert_eq!(normalise_tool_result(text_result("plain words")), json!({"text": "plain words"}));
        assert_eq!(normalise_tool_result(json!({"raw": true})), json!({"raw": true}));
    }

    #[tokio::test]
    async fn test_transport_failure_is_payload_not_error() {
        let mut fx = fixture(ScriptedPrompter::approving());
        fx.transport.fail("roam_create_block", "socket closed");
        let result = fx.call("roam_create_block", json!({"parent_uid": "p"})).await.unwrap();
        assert!(result["error"].as_str().unwrap().contains("socket closed"));
    }

    #[tokio::test]
    async fn test_missing_required_field_is_payload() {
        let mut fx = fixture(ScriptedPrompter::approving());
        let result = fx.call("roam_create_block", json!({"string": "x"})).await.unwrap();
        assert!(result["error"].as_str().unwrap().contains("parent_uid"));
        assert_eq!(fx.prompter.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnected_transport_raises() {
        let transport = Arc::new(MockTransport::disconnected());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_fixed_date());
        let usage = Arc::new(UsageTracker::new(UsageConfig::default(), None, clock.clone()));
        let mut session = Session::new(&CoreConfig::default(), usage, clock);
        let dispatcher = ToolDispatcher::new(registry(), transport, Arc::new(ScriptedPrompter::approving()));
        let err = dispatcher
            .execute_tool_call(&mut session, "roam_search", json!({}), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::McpNotConnected));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_payload() {
        let mut fx = fixture(ScriptedPrompter::approving());
        let result = fx.call("does_not_exist", json!({})).await.unwrap();
        assert_eq!(result["error"], "Unknown tool: does_not_exist");
    }
}
