//! Schema pinning: content-addressed tool catalogues with drift detection.
//!
//! On first discovery of a server its catalogue is hashed and pinned under
//! the `mcp-schema-hashes` settings key together with per-tool fingerprints.
//! Later discoveries compare hashes; on a mismatch the fingerprints explain
//! what changed and the server is reported for suspension.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::agent_core::tokens::truncate_chars;
use crate::host::{lock, SettingsStore};
use crate::mcp_client::ToolDescriptor;

/// Settings key holding every server's pin.
pub const SCHEMA_HASHES_KEY: &str = "mcp-schema-hashes";

/// Canonicalisation stops once nesting exceeds this depth.
pub const MAX_CANONICAL_DEPTH: usize = 6;

/// Entries kept in [`SchemaHashCache`] before it is cleared.
pub const HASH_CACHE_CAPACITY: usize = 20;

const DESC_SNIPPET_CHARS: usize = 200;

// ─── Canonicalisation ────────────────────────────────────────────────────────

/// Deterministic form of a JSON schema for hashing.
///
/// `properties` keys are sorted, `required` and `enum` arrays are sorted,
/// and `items`, `additionalProperties`, `oneOf`, `anyOf` and `allOf` are
/// recursed. Sub-schemas nested deeper than [`MAX_CANONICAL_DEPTH`] become
/// `null`.
pub fn canonicalise_schema_for_hash(schema: &serde_json::Value) -> serde_json::Value {
    canonicalise(schema, 0).unwrap_or(serde_json::Value::Null)
}

fn canonicalise(schema: &serde_json::Value, depth: usize) -> Option<serde_json::Value> {
    if depth > MAX_CANONICAL_DEPTH {
        return None;
    }
    let Some(obj) = schema.as_object() else {
        return Some(schema.clone());
    };
    let nested = |v: &serde_json::Value| canonicalise(v, depth + 1).unwrap_or(serde_json::Value::Null);

    let mut out = serde_json::Map::new();
    let mut keys: Vec<&String> = obj.keys().collect();
    keys.sort();
    for key in keys {
        let value = &obj[key.as_str()];
        let canon = match key.as_str() {
            "properties" => match value.as_object() {
                Some(props) => {
                    let sorted: BTreeMap<&String, serde_json::Value> =
                        props.iter().map(|(k, v)| (k, nested(v))).collect();
                    serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
                }
                None => value.clone(),
            },
            "required" | "enum" => match value.as_array() {
                Some(items) => {
                    let mut sorted = items.clone();
                    sorted.sort_by_key(|v| v.to_string());
                    serde_json::Value::Array(sorted)
                }
                None => value.clone(),
            },
            "items" | "additionalProperties" if value.is_object() => nested(value),
            "oneOf" | "anyOf" | "allOf" => match value.as_array() {
                Some(variants) => serde_json::Value::Array(variants.iter().map(nested).collect()),
                None => value.clone(),
            },
            _ => value.clone(),
        };
        out.insert(key.clone(), canon);
    }
    Some(serde_json::Value::Object(out))
}

// ─── Hashing ─────────────────────────────────────────────────────────────────

/// Memo of catalogue payload → SHA-256 hex. Cleared when it grows past
/// [`HASH_CACHE_CAPACITY`].
#[derive(Debug, Default)]
pub struct SchemaHashCache {
    entries: Mutex<HashMap<String, String>>,
}

impl SchemaHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Serialize)]
struct HashedTool<'a> {
    name: &'a str,
    description: &'a str,
    schema: serde_json::Value,
}

/// SHA-256 (hex) of the canonical catalogue: tools sorted by name, each
/// serialized as `{name, description, schema}`.
pub fn compute_schema_hash_core(tools: &[ToolDescriptor], cache: &SchemaHashCache) -> String {
    let mut sorted: Vec<&ToolDescriptor> = tools.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let payload: Vec<HashedTool<'_>> = sorted
        .iter()
        .map(|t| HashedTool {
            name: &t.name,
            description: &t.description,
            schema: canonicalise_schema_for_hash(&t.input_schema),
        })
        .collect();
    let serialized = serde_json::to_string(&payload).unwrap_or_default();

    if let Some(hit) = lock(&cache.entries).get(&serialized) {
        return hit.clone();
    }

    let hash = format!("{:x}", Sha256::digest(serialized.as_bytes()));
    let mut entries = lock(&cache.entries);
    if entries.len() >= HASH_CACHE_CAPACITY {
        entries.clear();
    }
    entries.insert(serialized, hash.clone());
    hash
}

// ─── Fingerprints ────────────────────────────────────────────────────────────

/// Per-tool signature used to explain drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolFingerprint {
    /// Sorted parameter names joined with `,`.
    pub param_keys: String,
    /// Sorted `name:type` pairs joined with `,`.
    pub param_types: String,
    /// First 200 characters of the description.
    pub desc_snippet: String,
}

impl ToolFingerprint {
    pub fn of(tool: &ToolDescriptor) -> Self {
        let props: BTreeMap<&String, &serde_json::Value> = tool
            .input_schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|p| p.iter().collect())
            .unwrap_or_default();
        let param_keys = props.keys().map(|k| k.as_str()).collect::<Vec<_>>().join(",");
        let param_types = props
            .iter()
            .map(|(k, v)| {
                let ty = match v.get("type") {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => "any".to_string(),
                };
                format!("{k}:{ty}")
            })
            .collect::<Vec<_>>()
            .join(",");
        Self {
            param_keys,
            param_types,
            desc_snippet: truncate_chars(&tool.description, DESC_SNIPPET_CHARS).to_string(),
        }
    }
}

// ─── Pin Check ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PinStatus {
    Pinned,
    Unchanged,
    Changed,
}

/// One tool whose fingerprint changed. `changes` ⊆ {`description`, `parameters`}.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolModification {
    pub name: String,
    pub changes: Vec<String>,
}

/// Difference between a pinned catalogue and the observed one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaDrift {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<ToolModification>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaPinOutcome {
    pub status: PinStatus,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<SchemaDrift>,
}

fn read_pins(settings: &dyn SettingsStore) -> serde_json::Map<String, serde_json::Value> {
    match settings.get(SCHEMA_HASHES_KEY) {
        Some(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

fn write_pin(
    settings: &dyn SettingsStore,
    mut pins: serde_json::Map<String, serde_json::Value>,
    server_key: &str,
    hash: &str,
    tools: &[ToolDescriptor],
) {
    let mut names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    names.sort_unstable();
    let fingerprints: BTreeMap<&str, ToolFingerprint> = tools
        .iter()
        .map(|t| (t.name.as_str(), ToolFingerprint::of(t)))
        .collect();

    pins.insert(server_key.to_string(), serde_json::json!(hash));
    pins.insert(format!("{server_key}_tools"), serde_json::json!(names));
    pins.insert(
        format!("{server_key}_fingerprints"),
        serde_json::to_value(fingerprints).unwrap_or_default(),
    );
    settings.set(SCHEMA_HASHES_KEY, serde_json::Value::Object(pins));
}

/// Compare a server's observed catalogue with its pin.
///
/// - no pin: pin it, [`PinStatus::Pinned`]
/// - same hash: [`PinStatus::Unchanged`]
/// - otherwise: compute the drift, call `suspend_mcp_server` once, and
///   return [`PinStatus::Changed`]. The stored pin is left as it was until
///   [`accept_schema_change`] re-pins.
pub fn check_schema_pin_core(
    server_key: &str,
    tools: &[ToolDescriptor],
    settings: &dyn SettingsStore,
    cache: &SchemaHashCache,
    suspend_mcp_server: impl FnOnce(&str, &SchemaDrift),
) -> SchemaPinOutcome {
    let hash = compute_schema_hash_core(tools, cache);
    let pins = read_pins(settings);

    let Some(pinned_hash) = pins.get(server_key).and_then(|v| v.as_str()).map(String::from) else {
        write_pin(settings, pins, server_key, &hash, tools);
        tracing::info!(server = %server_key, tools = tools.len(), hash = %hash, "pinned MCP schema");
        return SchemaPinOutcome {
            status: PinStatus::Pinned,
            hash,
            drift: None,
        };
    };

    if pinned_hash == hash {
        return SchemaPinOutcome {
            status: PinStatus::Unchanged,
            hash,
            drift: None,
        };
    }

    let old_names: BTreeSet<String> = pins
        .get(&format!("{server_key}_tools"))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    let old_prints: BTreeMap<String, ToolFingerprint> = pins
        .get(&format!("{server_key}_fingerprints"))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    let new_names: BTreeSet<String> = tools.iter().map(|t| t.name.clone()).collect();

    let mut modified = Vec::new();
    let mut sorted: Vec<&ToolDescriptor> = tools.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    for tool in sorted {
        let Some(old) = old_prints.get(&tool.name) else {
            continue;
        };
        let new = ToolFingerprint::of(tool);
        let mut changes = Vec::new();
        if old.desc_snippet != new.desc_snippet {
            changes.push("description".to_string());
        }
        if old.param_keys != new.param_keys || old.param_types != new.param_types {
            changes.push("parameters".to_string());
        }
        if !changes.is_empty() {
            modified.push(ToolModification {
                name: tool.name.clone(),
                changes,
            });
        }
    }

    let drift = SchemaDrift {
        added: new_names.difference(&old_names).cloned().collect(),
        removed: old_names.difference(&new_names).cloned().collect(),
        modified,
    };

    tracing::warn!(
        server = %server_key,
        added = ?drift.added,
        removed = ?drift.removed,
        modified = drift.modified.len(),
        "MCP schema drift detected"
    );
    suspend_mcp_server(server_key, &drift);

    SchemaPinOutcome {
        status: PinStatus::Changed,
        hash,
        drift: Some(drift),
    }
}

/// Re-pin a server's catalogue after the user accepted its changes.
pub fn accept_schema_change(
    server_key: &str,
    tools: &[ToolDescriptor],
    settings: &dyn SettingsStore,
    cache: &SchemaHashCache,
) -> String {
    let hash = compute_schema_hash_core(tools, cache);
    write_pin(settings, read_pins(settings), server_key, &hash, tools);
    tracing::info!(server = %server_key, hash = %hash, "re-pinned MCP schema");
    hash
}

// ─── Tests ───────────────────────────────────────────────────────────────────
