//! Usage tracking: session token totals, per-day cost history, named
//! usage counters and the daily spending cap.

pub mod tracker;
pub mod types;

pub use tracker::{SessionTokenUsage, UsageTracker};
pub use types::{
    CapStatus, CostDay, CostHistory, CostSummary, ModelCost, PeriodCost, UsageStats,
    UsageStatsDay, UsageStatsSummary, COST_HISTORY_KEY, DAILY_CAP_KEY, USAGE_STATS_KEY,
};
