//! Meta-tools: tools whose arguments name other tools.
//!
//! - `COMPOSIO_MULTI_EXECUTE_TOOL` carries a `tools[]` array of
//!   `{tool_slug, arguments}` entries. Models produce many shapes for it,
//!   so arguments are normalised before anything inspects them.
//! - `LOCAL_MCP_EXECUTE` carries `{tool_name, arguments}` for a tool on a
//!   local MCP server.
//! - `COMPOSIO_MANAGE_CONNECTIONS` carries an `action`.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

// ─── Names ──────────────────────────────────────────────────────────────────

pub const MULTI_EXECUTE_TOOL: &str = "COMPOSIO_MULTI_EXECUTE_TOOL";
pub const LOCAL_MCP_EXECUTE: &str = "LOCAL_MCP_EXECUTE";
pub const MANAGE_CONNECTIONS: &str = "COMPOSIO_MANAGE_CONNECTIONS";

/// Actions of the connection manager that only read.
pub const READ_ONLY_CONNECTION_ACTIONS: &[&str] = &["list", "status", "check", "get"];

const SLUG_ALIASES: &[&str] = &["tool_slug", "slug", "tool", "action", "name"];
const ARGUMENT_ALIASES: &[&str] = &["arguments", "args", "params", "parameters", "input"];
const LOCAL_NAME_ALIASES: &[&str] = &["tool_name", "name", "tool"];

/// Composio slug shape: `GMAIL_FETCH_EMAILS`.
static COMPOSIO_SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9]*_[A-Z0-9_]+$").expect("valid slug regex"));

/// Parameters that hold identifiers: `item_key`, `parent_id`, `itemKey`, `pageId`.
static KEY_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(_key|_id|Key|Id)$").expect("valid key param regex"));

pub fn is_composio_slug_shape(name: &str) -> bool {
    COMPOSIO_SLUG_RE.is_match(name)
}

pub fn is_connection_manager(name: &str) -> bool {
    name.to_uppercase().ends_with("MANAGE_CONNECTIONS")
}

// ─── Multi-Execute ──────────────────────────────────────────────────────────

/// One inner call of a multi-execute request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiExecuteCall {
    pub tool_slug: String,
    pub arguments: Value,
}

/// Normalise multi-execute arguments into a list of inner calls.
///
/// Accepts `tools` as an array, a JSON-encoded array, or a single object,
/// and a bare top-level call with no `tools` key. Slugs are trimmed and
/// upper-cased; entries without a slug are dropped.
pub fn normalise_multi_execute_args(args: &Value) -> Vec<MultiExecuteCall> {
    let args = decode_if_string(args);
    let entries: Vec<Value> = match args.get("tools").map(decode_if_string) {
        Some(Value::Array(items)) => items,
        Some(obj @ Value::Object(_)) => vec![obj],
        Some(_) => Vec::new(),
        None if first_str(&args, SLUG_ALIASES).is_some() => vec![args.clone()],
        None => Vec::new(),
    };

    entries
        .iter()
        .filter_map(|entry| {
            let entry = decode_if_string(entry);
            let slug = first_str(&entry, SLUG_ALIASES)?.trim().to_uppercase();
            if slug.is_empty() {
                return None;
            }
            let arguments = ARGUMENT_ALIASES
                .iter()
                .find_map(|k| entry.get(*k))
                .map(decode_if_string)
                .filter(Value::is_object)
                .unwrap_or_else(|| json!({}));
            Some(MultiExecuteCall {
                tool_slug: slug,
                arguments,
            })
        })
        .collect()
}

/// Sorted, de-duplicated inner slugs.
pub fn multi_execute_slugs(calls: &[MultiExecuteCall]) -> Vec<String> {
    calls
        .iter()
        .map(|c| c.tool_slug.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// The canonical `{tools: [...]}` argument object for forwarding.
pub fn multi_execute_args(calls: &[MultiExecuteCall]) -> Value {
    json!({ "tools": calls })
}

/// Approval key for a multi-execute call: `TOOL::A,B`.
pub fn multi_execute_approval_key(calls: &[MultiExecuteCall]) -> String {
    format!("{MULTI_EXECUTE_TOOL}::{}", multi_execute_slugs(calls).join(","))
}

// ─── Local MCP Execute ──────────────────────────────────────────────────────

/// The inner tool name and arguments of a `LOCAL_MCP_EXECUTE` call.
pub fn local_mcp_inner(args: &Value) -> (Option<String>, Value) {
    let args = decode_if_string(args);
    let name = first_str(&args, LOCAL_NAME_ALIASES)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(String::from);
    let arguments = ARGUMENT_ALIASES
        .iter()
        .find_map(|k| args.get(*k))
        .map(decode_if_string)
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({}));
    (name, arguments)
}

pub fn local_mcp_approval_key(inner_name: &str) -> String {
    format!("{LOCAL_MCP_EXECUTE}::{inner_name}")
}

/// Reject identifier parameters that hold a path or a title.
///
/// Models often pass `"Attention Is All You Need"` or a URL where a tool
/// wants an item key; the error steers them to a real identifier.
pub fn validate_key_shaped_params(tool_name: &str, args: &Value) -> Result<(), String> {
    let Some(map) = args.as_object() else {
        return Ok(());
    };
    for (param, value) in map {
        let Some(text) = value.as_str() else {
            continue;
        };
        if KEY_PARAM_RE.is_match(param) && (text.contains('/') || text.chars().any(char::is_whitespace)) {
            return Err(format!(
                "Parameter '{param}' of {tool_name} expects an identifier, but got \"{text}\". \
                 Look up the item first and pass its key or id (no spaces or slashes)."
            ));
        }
    }
    Ok(())
}

// ─── Response Shapes ────────────────────────────────────────────────────────

/// Most slugs remembered by a [`ResponseShapeRecorder`].
pub const MAX_RECORDED_SHAPES: usize = 200;

/// Observed top-level layout of a Composio tool's successful result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseShape {
    pub keys: Vec<String>,
    pub data_keys: Vec<String>,
    pub observations: u32,
}

/// Remembers the result layout of each Composio slug for observability.
#[derive(Debug, Default)]
pub struct ResponseShapeRecorder {
    shapes: HashMap<String, ResponseShape>,
}

impl ResponseShapeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, slug: &str, result: &Value) {
        let slug = slug.to_uppercase();
        if !self.shapes.contains_key(&slug) && self.shapes.len() >= MAX_RECORDED_SHAPES {
            return;
        }
        let keys = sorted_keys(Some(result));
        let data_keys = sorted_keys(result.get("data"));
        let shape = self.shapes.entry(slug.clone()).or_default();
        if shape.observations > 0 && (shape.keys != keys || shape.data_keys != data_keys) {
            tracing::debug!(slug = %slug, "composio response shape changed");
        }
        shape.keys = keys;
        shape.data_keys = data_keys;
        shape.observations += 1;
    }

    pub fn shape(&self, slug: &str) -> Option<&ResponseShape> {
        self.shapes.get(&slug.to_uppercase())
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}

fn sorted_keys(value: Option<&Value>) -> Vec<String> {
    let mut keys: Vec<String> = value
        .and_then(Value::as_object)
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();
    keys.sort();
    keys
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Parse a JSON-encoded string argument; anything else is returned as-is.
fn decode_if_string(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(s.trim()).unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}

fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_str))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalise_canonical_shape() {
        let args = json!({"tools": [{"tool_slug": "GMAIL_FETCH_EMAILS", "arguments": {"q": "x"}}]});
        let calls = normalise_multi_execute_args(&args);
        assert_eq!(
            calls,
            vec![MultiExecuteCall {
                tool_slug: "GMAIL_FETCH_EMAILS".into(),
                arguments: json!({"q": "x"}),
            }]
        );
    }

    #[test]
    fn test_normalise_aliases_and_encodings() {
        let args = json!({
            "tools": "[{\"slug\": \"gmail_send_email\", \"args\": \"{\\\"to\\\": \\\"a@b.c\\\"}\"}]"
        });
        let calls = normalise_multi_execute_args(&args);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_slug, "GMAIL_SEND_EMAIL");
        assert_eq!(calls[0].arguments, json!({"to": "a@b.c"}));

        let single = json!({"tools": {"tool": "SLACK_LIST_CHANNELS"}});
        assert_eq!(normalise_multi_execute_args(&single)[0].arguments, json!({}));

        let bare = json!({"tool_slug": "GITHUB_GET_REPO", "params": {"repo": "r"}});
        assert_eq!(normalise_multi_execute_args(&bare)[0].arguments, json!({"repo": "r"}));
    }

    #[test]
    fn test_normalise_drops_entries_without_slug() {
        let args = json!({"tools": [{"arguments": {}}, {"tool_slug": "  "}, 5]});
        assert!(normalise_multi_execute_args(&args).is_empty());
        assert!(normalise_multi_execute_args(&json!({})).is_empty());
    }

    #[test]
    fn test_approval_key_is_sorted_and_unique() {
        let calls = normalise_multi_execute_args(&json!({"tools": [
            {"tool_slug": "SLACK_SEND_MESSAGE"},
            {"tool_slug": "GMAIL_SEND_EMAIL"},
            {"tool_slug": "slack_send_message"},
        ]}));
        assert_eq!(
            multi_execute_approval_key(&calls),
            "COMPOSIO_MULTI_EXECUTE_TOOL::GMAIL_SEND_EMAIL,SLACK_SEND_MESSAGE"
        );
    }

    #[test]
    fn test_local_mcp_inner() {
        let (name, args) = local_mcp_inner(&json!({"tool_name": "zotero.search_items", "arguments": {"q": "x"}}));
        assert_eq!(name.as_deref(), Some("zotero.search_items"));
        assert_eq!(args, json!({"q": "x"}));

        let (name, args) = local_mcp_inner(&json!({"name": " ", "arguments": "not json"}));
        assert!(name.is_none());
        assert_eq!(args, json!({}));
    }

    #[test]
    fn test_key_shaped_params() {
        assert!(validate_key_shaped_params("get_item", &json!({"item_key": "ABCD1234"})).is_ok());
        assert!(validate_key_shaped_params("get_item", &json!({"itemKey": "Deep Learning"})).is_err());
        assert!(validate_key_shaped_params("get_page", &json!({"page_id": "a/b"})).is_err());
        assert!(validate_key_shaped_params("search", &json!({"query": "two words"})).is_ok());
        assert!(validate_key_shaped_params("get", &json!({"parent_id": 42})).is_ok());
        let err = validate_key_shaped_params("get_item", &json!({"item_key": "x y"})).unwrap_err();
        assert!(err.contains("item_key"));
    }

    #[test]
    fn test_slug_shape_and_connection_manager() {
        assert!(is_composio_slug_shape("GMAIL_FETCH_EMAILS"));
        assert!(!is_composio_slug_shape("gmail_fetch"));
        assert!(!is_composio_slug_shape("GMAIL"));
        assert!(is_connection_manager("COMPOSIO_MANAGE_CONNECTIONS"));
        assert!(!is_connection_manager("roam_search"));
    }

    #[test]
    fn test_response_shape_recorder() {
        let mut rec = ResponseShapeRecorder::new();
        rec.record("gmail_fetch_emails", &json!({"successful": true, "data": {"messages": [], "nextPageToken": null}}));
        rec.record("GMAIL_FETCH_EMAILS", &json!({"successful": true, "data": {"messages": []}}));
        let shape = rec.shape("GMAIL_FETCH_EMAILS").unwrap();
        assert_eq!(shape.observations, 2);
        assert_eq!(shape.keys, vec!["data", "successful"]);
        assert_eq!(shape.data_keys, vec!["messages"]);
        assert_eq!(rec.len(), 1);
    }
}
