//! Shared types for the agent core.
//!
//! Model tiers, per-turn trajectory entries, and the confirmation types
//! exchanged with a UI over channels.

use serde::{Deserialize, Serialize};

// ─── Tiers ──────────────────────────────────────────────────────────────────

/// Model class chosen for a turn, cheapest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Mini,
    Power,
    Ludicrous,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Mini => "mini",
            Tier::Power => "power",
            Tier::Ludicrous => "ludicrous",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Trajectory ─────────────────────────────────────────────────────────────

/// Outcome of one completed turn, kept in the session's trajectory ring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrajectoryEntry {
    /// Tool calls dispatched during the turn.
    pub tool_count: u32,
    /// Distinct tool names among them.
    pub unique_tool_count: u32,
    /// Distinct tool names with at least one non-error result.
    pub successful_unique_tool_count: u32,
    /// Model round trips.
    pub iterations: u32,
    pub tier: Tier,
    /// The turn was routed above mini.
    pub escalated: bool,
    /// The turn switched provider at least once.
    pub failed_over: bool,
    pub timestamp_ms: i64,
}

// ─── Confirmation ───────────────────────────────────────────────────────────

/// Request sent to the UI for user confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRequest {
    /// Unique request ID for matching responses.
    pub request_id: String,
    /// The tool being called.
    pub tool_name: String,
    /// The arguments to the tool.
    pub arguments: serde_json::Value,
    /// Human-readable preview of what will happen.
    pub preview: String,
    /// Whether this is a destructive action (delete, send, trash).
    pub is_destructive: bool,
}

/// Response from the UI after the user decides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConfirmationResponse {
    Confirmed,
    Rejected,
}

// ─── Tests ──────────────────────────────────────────────────────────────────
