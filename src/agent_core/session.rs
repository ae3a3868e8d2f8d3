//! Per-conversation state.
//!
//! Approvals, the trajectory ring, the dry-run flag and the response-shape
//! recorder belong to one conversation and are passed explicitly to the
//! dispatcher, the tier router and the agent loop. The usage tracker is
//! shared, since spend is tracked per day rather than per conversation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::approvals::ApprovalStore;
use super::meta_tools::ResponseShapeRecorder;
use super::types::TrajectoryEntry;
use crate::config::CoreConfig;
use crate::host::Clock;
use crate::usage::UsageTracker;

/// Turns kept in the trajectory ring.
pub const TRAJECTORY_CAPACITY: usize = 8;

pub struct Session {
    pub id: String,
    pub approvals: ApprovalStore,
    pub usage: Arc<UsageTracker>,
    /// A local MCP tool ran earlier in this conversation.
    pub session_used_local_mcp: bool,
    pub response_shapes: ResponseShapeRecorder,
    trajectory: VecDeque<TrajectoryEntry>,
    dry_run_pending: bool,
    clock: Arc<dyn Clock>,
}

impl Session {
    pub fn new(config: &CoreConfig, usage: Arc<UsageTracker>, clock: Arc<dyn Clock>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(session_id = %id, "session created");
        Self {
            id,
            approvals: ApprovalStore::new(
                Duration::from_secs(config.approvals.ttl_secs),
                Arc::clone(&clock),
            ),
            usage,
            session_used_local_mcp: false,
            response_shapes: ResponseShapeRecorder::new(),
            trajectory: VecDeque::with_capacity(TRAJECTORY_CAPACITY),
            dry_run_pending: false,
            clock,
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    // ── Trajectory ──

    /// Completed turns, oldest first.
    pub fn trajectory(&self) -> Vec<TrajectoryEntry> {
        self.trajectory.iter().cloned().collect()
    }

    /// Append a completed turn, dropping the oldest beyond capacity.
    pub fn push_trajectory(&mut self, entry: TrajectoryEntry) {
        self.trajectory.push_back(entry);
        while self.trajectory.len() > TRAJECTORY_CAPACITY {
            self.trajectory.pop_front();
        }
    }

    // ── Dry run ──

    /// Make the next mutating call a simulation.
    pub fn request_dry_run(&mut self) {
        self.dry_run_pending = true;
    }

    pub fn dry_run_pending(&self) -> bool {
        self.dry_run_pending
    }

    /// Consume the dry-run flag.
    pub fn take_dry_run(&mut self) -> bool {
        std::mem::take(&mut self.dry_run_pending)
    }

    // ── Lifecycle ──

    /// Forget prior turns. Approvals survive until [`Session::end`].
    pub fn reset_conversation(&mut self) {
        self.trajectory.clear();
        self.session_used_local_mcp = false;
        self.dry_run_pending = false;
        tracing::debug!(session_id = %self.id, "conversation reset");
    }

    /// Drop every approval and persist pending usage.
    pub fn end(&mut self) {
        self.approvals.clear();
        self.reset_conversation();
        self.usage.flush(None);
        tracing::info!(session_id = %self.id, "session ended");
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UsageConfig;
    use crate::host::{ManualClock, MemorySettings, SettingsStore};
    use crate::usage::types::USAGE_STATS_KEY;

    fn session_with(settings: Option<Arc<dyn SettingsStore>>) -> Session {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_fixed_date());
        let usage = Arc::new(UsageTracker::new(UsageConfig::default(), settings, Arc::clone(&clock)));
        Session::new(&CoreConfig::default(), usage, clock)
    }

    #[test]
    fn test_trajectory_ring_keeps_last_eight() {
        let mut session = session_with(None);
        for i in 0..11 {
            session.push_trajectory(TrajectoryEntry {
                tool_count: i,
                ..Default::default()
            });
        }
        let ring = session.trajectory();
        assert_eq!(ring.len(), TRAJECTORY_CAPACITY);
        assert_eq!(ring[0].tool_count, 3);
        assert_eq!(ring[7].tool_count, 10);
    }

    #[test]
    fn test_dry_run_is_consumed_once() {
        let mut session = session_with(None);
        assert!(!session.take_dry_run());
        session.request_dry_run();
        assert!(session.dry_run_pending());
        assert!(session.take_dry_run());
        assert!(!session.take_dry_run());
    }

    #[test]
    fn test_reset_conversation_keeps_approvals() {
        let mut session = session_with(None);
        session.approvals.remember("roam_create_block");
        session.push_trajectory(TrajectoryEntry::default());
        session.session_used_local_mcp = true;
        session.reset_conversation();
        assert!(session.trajectory().is_empty());
        assert!(!session.session_used_local_mcp);
        assert!(session.approvals.has_valid("roam_create_block"));
    }

    #[test]
    fn test_end_clears_approvals_and_flushes_usage() {
        let settings = Arc::new(MemorySettings::new());
        let mut session = session_with(Some(settings.clone()));
        session.approvals.remember("roam_create_block");
        session.usage.record_usage_stat("agentRuns", None);
        session.end();
        assert!(session.approvals.is_empty());
        assert!(settings.get(USAGE_STATS_KEY).is_some());
    }
}
