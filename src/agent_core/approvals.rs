//! Approval Store: time-boxed grants for mutating tool calls.
//!
//! A grant is keyed by an approval key (tool name, `TOOL::slug,slug` for
//! meta-tools, or a page UID for scoped page approvals) and stays valid for
//! the configured TTL. Expired grants are pruned lazily on lookup; nothing is
//! persisted, so ending the session drops every grant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::host::Clock;

// ─── Types ──────────────────────────────────────────────────────────────────

/// One granted approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    /// Clock reading (millis) when the user said yes.
    pub granted_at_ms: i64,
}

// ─── ApprovalStore ──────────────────────────────────────────────────────────

pub struct ApprovalStore {
    grants: HashMap<String, ApprovalRecord>,
    ttl_ms: i64,
    clock: Arc<dyn Clock>,
}

impl ApprovalStore {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            grants: HashMap::new(),
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            clock,
        }
    }

    /// Whether `key` holds a grant younger than the TTL.
    ///
    /// Expired grants and grants from the future (the clock went backwards)
    /// are removed as a side effect.
    pub fn has_valid(&mut self, key: &str) -> bool {
        let Some(record) = self.grants.get(key) else {
            return false;
        };
        let elapsed = self.clock.now_millis().saturating_sub(record.granted_at_ms);
        if (0..self.ttl_ms).contains(&elapsed) {
            tracing::debug!(key, elapsed_ms = elapsed, "reusing tool approval");
            return true;
        }
        self.grants.remove(key);
        tracing::debug!(key, elapsed_ms = elapsed, "tool approval expired");
        false
    }

    /// Whether every key is currently valid. An empty set is never valid.
    pub fn all_valid<'a>(&mut self, keys: impl IntoIterator<Item = &'a str>) -> bool {
        let mut any = false;
        for key in keys {
            if !self.has_valid(key) {
                return false;
            }
            any = true;
        }
        any
    }

    /// Record a fresh grant for `key`.
    pub fn remember(&mut self, key: &str) {
        self.grants.insert(
            key.to_string(),
            ApprovalRecord {
                granted_at_ms: self.clock.now_millis(),
            },
        );
        tracing::info!(key, "tool approval granted");
    }

    /// Drop every grant.
    pub fn clear(&mut self) {
        let count = self.grants.len();
        self.grants.clear();
        if count > 0 {
            tracing::info!(cleared = count, "tool approvals cleared");
        }
    }

    /// Number of stored grants, including ones not yet pruned.
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

impl std::fmt::Debug for ApprovalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalStore")
            .field("grants", &self.grants)
            .field("ttl_ms", &self.ttl_ms)
            .finish()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
