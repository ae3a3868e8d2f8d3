//! Per-day cost and usage aggregation with debounced persistence.
//!
//! Mutations land in memory immediately and schedule a single pending
//! persist task per settings key; rescheduling aborts the previous task.
//! Without a tokio runtime, dirty documents coalesce until [`UsageTracker::flush`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, Utc};
use tokio::task::JoinHandle;

use super::types::{
    CapStatus, CostHistory, CostSummary, UsageStats, UsageStatsSummary, COST_HISTORY_KEY,
    DAILY_CAP_KEY, USAGE_STATS_KEY,
};
use crate::config::UsageConfig;
use crate::host::{lock, Clock, SettingsStore};

// ─── Session Tokens ──────────────────────────────────────────────────────────

/// Running token and cost totals for the current session.
///
/// Shared as `Arc`; resets zero the counters in place so holders keep
/// observing the same object.
#[derive(Debug, Default)]
pub struct SessionTokenUsage {
    input: AtomicU64,
    output: AtomicU64,
    requests: AtomicU64,
    cost_bits: AtomicU64,
}

impl SessionTokenUsage {
    pub fn input_tokens(&self) -> u64 {
        self.input.load(Ordering::SeqCst)
    }

    pub fn output_tokens(&self) -> u64 {
        self.output.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn cost_usd(&self) -> f64 {
        f64::from_bits(self.cost_bits.load(Ordering::SeqCst))
    }

    fn add(&self, input: u64, output: u64, cost: f64) {
        self.input.fetch_add(input, Ordering::SeqCst);
        self.output.fetch_add(output, Ordering::SeqCst);
        self.requests.fetch_add(1, Ordering::SeqCst);
        // fetch_update only fails when the closure returns None.
        let _ = self
            .cost_bits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                Some((f64::from_bits(bits) + cost).to_bits())
            });
    }

    fn reset(&self) {
        self.input.store(0, Ordering::SeqCst);
        self.output.store(0, Ordering::SeqCst);
        self.requests.store(0, Ordering::SeqCst);
        self.cost_bits.store(0f64.to_bits(), Ordering::SeqCst);
    }
}

// ─── Tracker State ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PersistKey {
    CostHistory,
    UsageStats,
}

impl PersistKey {
    fn settings_key(self) -> &'static str {
        match self {
            PersistKey::CostHistory => COST_HISTORY_KEY,
            PersistKey::UsageStats => USAGE_STATS_KEY,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    cost: Option<CostHistory>,
    stats: Option<UsageStats>,
    cost_dirty: bool,
    stats_dirty: bool,
    pending: HashMap<PersistKey, JoinHandle<()>>,
}

impl TrackerState {
    fn cost(&mut self, settings: Option<&dyn SettingsStore>) -> &mut CostHistory {
        self.cost.get_or_insert_with(|| {
            CostHistory::from_stored(settings.and_then(|s| s.get(COST_HISTORY_KEY)))
        })
    }

    fn stats(&mut self, settings: Option<&dyn SettingsStore>) -> &mut UsageStats {
        self.stats.get_or_insert_with(|| {
            UsageStats::from_stored(settings.and_then(|s| s.get(USAGE_STATS_KEY)))
        })
    }

    fn is_dirty(&self, key: PersistKey) -> bool {
        match key {
            PersistKey::CostHistory => self.cost_dirty,
            PersistKey::UsageStats => self.stats_dirty,
        }
    }

    /// Serialize a dirty document and mark it clean.
    fn take_dirty(&mut self, key: PersistKey) -> Option<serde_json::Value> {
        if !self.is_dirty(key) {
            return None;
        }
        let value = match key {
            PersistKey::CostHistory => {
                self.cost_dirty = false;
                serde_json::to_value(self.cost.as_ref()?)
            }
            PersistKey::UsageStats => {
                self.stats_dirty = false;
                serde_json::to_value(self.stats.as_ref()?)
            }
        };
        match value {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(key = key.settings_key(), error = %e, "failed to serialize usage document");
                None
            }
        }
    }
}

fn persist_now(state: &Mutex<TrackerState>, store: &dyn SettingsStore, key: PersistKey) {
    let value = {
        let mut guard = lock(state);
        guard.pending.remove(&key);
        guard.take_dirty(key)
    };
    if let Some(value) = value {
        store.set(key.settings_key(), value);
        tracing::debug!(key = key.settings_key(), "persisted usage document");
    }
}

/// `day` minus `n` days, saturating at the earliest representable date.
fn days_before(day: NaiveDate, n: u32) -> NaiveDate {
    day.checked_sub_days(Days::new(u64::from(n)))
        .unwrap_or(NaiveDate::MIN)
}

// ─── Tracker ─────────────────────────────────────────────────────────────────

/// Bounded per-day cost and usage aggregation.
pub struct UsageTracker {
    state: Arc<Mutex<TrackerState>>,
    settings: Option<Arc<dyn SettingsStore>>,
    clock: Arc<dyn Clock>,
    config: UsageConfig,
    session: Arc<SessionTokenUsage>,
}

impl UsageTracker {
    pub fn new(
        config: UsageConfig,
        settings: Option<Arc<dyn SettingsStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState::default())),
            settings,
            clock,
            config,
            session: Arc::new(SessionTokenUsage::default()),
        }
    }

    // ── Session tokens ──

    pub fn accumulate_session_tokens(&self, input: u64, output: u64, cost: f64) {
        self.session.add(input, output, cost);
    }

    /// The live session counters. The same `Arc` is returned on every call.
    pub fn session_token_usage(&self) -> Arc<SessionTokenUsage> {
        Arc::clone(&self.session)
    }

    pub fn reset_session_token_usage(&self) {
        self.session.reset();
    }

    // ── Recording ──

    /// Add one request's spend to today's [`CostDay`](super::types::CostDay).
    pub fn record_cost_entry(&self, model: &str, input: u64, output: u64, cost: f64) {
        let today = self.today();
        let cutoff = self.retention_cutoff(today);
        {
            let mut state = lock(&self.state);
            let history = state.cost(self.settings.as_deref());
            history
                .days
                .entry(date_key(today))
                .or_default()
                .add(model, input, output, cost);
            history.days.retain(|date, _| *date >= cutoff);
            state.cost_dirty = true;
        }
        self.schedule_persist(PersistKey::CostHistory);
    }

    /// Increment a named counter for today.
    ///
    /// `record_usage_stat("toolCalls", Some(name))` increments the per-tool
    /// frequency instead.
    pub fn record_usage_stat(&self, name: &str, detail: Option<&str>) {
        let today = self.today();
        let cutoff = self.retention_cutoff(today);
        {
            let mut state = lock(&self.state);
            let stats = state.stats(self.settings.as_deref());
            let day = stats.days.entry(date_key(today)).or_default();
            match (name, detail) {
                ("toolCalls", Some(tool)) => *day.tool_calls.entry(tool.to_string()).or_default() += 1,
                _ => *day.counters.entry(name.to_string()).or_default() += 1,
            }
            stats.days.retain(|date, _| *date >= cutoff);
            state.stats_dirty = true;
        }
        self.schedule_persist(PersistKey::UsageStats);
    }

    // ── Queries ──

    /// Compare today's spend against `daily-spending-cap`.
    ///
    /// A blank, zero, negative or unparseable cap disables the check.
    pub fn is_daily_cap_exceeded(&self) -> CapStatus {
        let spent = self.spent_on(self.today());
        let cap = self
            .settings
            .as_deref()
            .and_then(|s| s.get(DAILY_CAP_KEY))
            .and_then(|v| parse_cap(&v));
        CapStatus {
            exceeded: cap.is_some_and(|cap| spent >= cap),
            cap,
            spent,
        }
    }

    pub fn cost_history_summary(&self) -> CostSummary {
        let today = self.today();
        let today_key = date_key(today);
        let week_start = date_key(days_before(today, 6));
        let month_start = date_key(days_before(today, 29));

        let mut state = lock(&self.state);
        let history = state.cost(self.settings.as_deref());
        let mut summary = CostSummary::default();
        for (date, day) in history.days.iter() {
            if *date > today_key {
                continue;
            }
            if *date == today_key {
                summary.today.add_day(day);
            }
            if *date >= week_start {
                summary.last_7_days.add_day(day);
            }
            if *date >= month_start {
                summary.last_30_days.add_day(day);
            }
        }
        summary
    }

    /// Sum counters and tool-call frequencies over the trailing `days` days.
    ///
    /// Windows longer than the retention period are clamped to it.
    pub fn usage_stats_summary(&self, days: u32) -> UsageStatsSummary {
        let today = self.today();
        let span = days.min(self.config.retention_days.max(1));
        let start = date_key(days_before(today, span.saturating_sub(1)));
        let today_key = date_key(today);

        let mut state = lock(&self.state);
        let stats = state.stats(self.settings.as_deref());
        let mut summary = UsageStatsSummary::default();
        for (_, day) in stats
            .days
            .iter()
            .filter(|(date, _)| **date >= start && **date <= today_key)
        {
            summary.days_covered += 1;
            for (name, n) in &day.counters {
                *summary.counters.entry(name.clone()).or_default() += n;
            }
            for (name, n) in &day.tool_calls {
                *summary.tool_calls.entry(name.clone()).or_default() += n;
            }
        }
        summary
    }

    /// Snapshot of the in-memory cost history.
    pub fn cost_history(&self) -> CostHistory {
        let mut state = lock(&self.state);
        state.cost(self.settings.as_deref()).clone()
    }

    /// Snapshot of the in-memory usage stats.
    pub fn usage_stats(&self) -> UsageStats {
        let mut state = lock(&self.state);
        state.stats(self.settings.as_deref()).clone()
    }

    /// Today's value of a named counter.
    pub fn counter_today(&self, name: &str) -> u64 {
        let today = date_key(self.today());
        let mut state = lock(&self.state);
        state
            .stats(self.settings.as_deref())
            .days
            .get(&today)
            .and_then(|d| d.counters.get(name).copied())
            .unwrap_or(0)
    }

    // ── Persistence ──

    /// Cancel pending persist tasks and write dirty documents synchronously.
    ///
    /// `settings = None` writes to the tracker's own store; with neither, or
    /// with nothing dirty, this is a no-op.
    pub fn flush(&self, settings: Option<&dyn SettingsStore>) {
        {
            let mut state = lock(&self.state);
            for (_, handle) in state.pending.drain() {
                handle.abort();
            }
        }
        let Some(store) = settings.or(self.settings.as_deref()) else {
            return;
        };
        persist_now(&self.state, store, PersistKey::CostHistory);
        persist_now(&self.state, store, PersistKey::UsageStats);
    }

    /// Whether any document has changes not yet persisted.
    pub fn has_pending_writes(&self) -> bool {
        let state = lock(&self.state);
        state.cost_dirty || state.stats_dirty
    }

    fn schedule_persist(&self, key: PersistKey) {
        let Some(store) = self.settings.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let state = Arc::clone(&self.state);
        let delay = Duration::from_millis(self.config.persist_debounce_ms);
        let mut guard = lock(&self.state);
        if let Some(previous) = guard.pending.remove(&key) {
            previous.abort();
        }
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            persist_now(&state, store.as_ref(), key);
        });
        guard.pending.insert(key, handle);
    }

    // ── Dates ──

    fn today(&self) -> NaiveDate {
        DateTime::<Utc>::from_timestamp_millis(self.clock.now_millis())
            .map(|dt| dt.date_naive())
            .unwrap_or_default()
    }

    fn retention_cutoff(&self, today: NaiveDate) -> String {
        date_key(days_before(today, self.config.retention_days.max(1) - 1))
    }

    fn spent_on(&self, day: NaiveDate) -> f64 {
        let key = date_key(day);
        let mut state = lock(&self.state);
        state
            .cost(self.settings.as_deref())
            .days
            .get(&key)
            .map(|d| d.cost)
            .unwrap_or(0.0)
    }
}

impl Drop for UsageTracker {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        for (_, handle) in state.pending.drain() {
            handle.abort();
        }
    }
}

fn date_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn parse_cap(value: &serde_json::Value) -> Option<f64> {
    let cap = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (cap.is_finite() && cap > 0.0).then_some(cap)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ManualClock, MemorySettings};
    use serde_json::json;

    fn tracker_with(
        debounce_ms: u64,
    ) -> (UsageTracker, Arc<MemorySettings>, Arc<ManualClock>) {
        let settings = Arc::new(MemorySettings::new());
        let clock = Arc::new(ManualClock::at_fixed_date());
        let config = UsageConfig {
            persist_debounce_ms: debounce_ms,
            retention_days: 90,
        };
        let tracker = UsageTracker::new(
            config,
            Some(settings.clone() as Arc<dyn SettingsStore>),
            clock.clone(),
        );
        (tracker, settings, clock)
    }

    #[test]
    fn test_session_usage_is_stable_reference() {
        let (tracker, _, _) = tracker_with(10);
        let usage = tracker.session_token_usage();
        tracker.accumulate_session_tokens(100, 20, 0.5);
        tracker.accumulate_session_tokens(10, 2, 0.25);
        assert_eq!(usage.input_tokens(), 110);
        assert_eq!(usage.output_tokens(), 22);
        assert_eq!(usage.requests(), 2);
        assert!((usage.cost_usd() - 0.75).abs() < 1e-9);

        tracker.reset_session_token_usage();
        assert_eq!(usage.input_tokens(), 0);
        assert!(Arc::ptr_eq(&usage, &tracker.session_token_usage()));
    }

    #[test]
    fn test_record_cost_entry_upserts_today_and_model() {
        let (tracker, _, _) = tracker_with(10);
        tracker.record_cost_entry("claude-haiku", 1000, 200, 0.01);
        tracker.record_cost_entry("claude-haiku", 500, 100, 0.005);
        tracker.record_cost_entry("gpt-4o", 10, 5, 0.1);

        let history = tracker.cost_history();
        let day = &history.days["2025-01-15"];
        assert_eq!(day.requests, 3);
        assert_eq!(day.input, 1510);
        assert_eq!(day.models["claude-haiku"].requests, 2);
        assert!((day.cost - 0.115).abs() < 1e-9);
    }

    #[test]
    fn test_retention_prunes_old_days_on_write() {
        let (tracker, settings, _) = tracker_with(10);
        settings.set(
            COST_HISTORY_KEY,
            json!({"days": {
                "2024-01-01": {"cost": 9.0},
                "2024-10-18": {"cost": 1.0},
                "2024-10-17": {"cost": 1.0}
            }}),
        );
        tracker.record_cost_entry("m", 1, 1, 0.0);
        let days = tracker.cost_history().days;
        assert!(!days.contains_key("2024-01-01"));
        assert!(!days.contains_key("2024-10-17"));
        assert!(days.contains_key("2024-10-18"));
        assert!(days.len() <= 90);
    }

    #[test]
    fn test_usage_stat_counters_and_tool_calls() {
        let (tracker, _, _) = tracker_with(10);
        tracker.record_usage_stat("agentRuns", None);
        tracker.record_usage_stat("agentRuns", None);
        tracker.record_usage_stat("toolCalls", Some("roam_search"));
        assert_eq!(tracker.counter_today("agentRuns"), 2);
        let stats = tracker.usage_stats();
        assert_eq!(stats.days["2025-01-15"].tool_calls["roam_search"], 1);
    }

    #[test]
    fn test_daily_cap() {
        let (tracker, settings, _) = tracker_with(10);
        assert_eq!(
            tracker.is_daily_cap_exceeded(),
            CapStatus {
                exceeded: false,
                cap: None,
                spent: 0.0
            }
        );

        settings.set(DAILY_CAP_KEY, json!("1.00"));
        tracker.record_cost_entry("m", 0, 0, 0.6);
        assert!(!tracker.is_daily_cap_exceeded().exceeded);
        tracker.record_cost_entry("m", 0, 0, 0.4);
        let status = tracker.is_daily_cap_exceeded();
        assert!(status.exceeded);
        assert_eq!(status.cap, Some(1.0));

        for disabled in [json!(""), json!("0"), json!("-5"), json!("abc"), json!(0)] {
            settings.set(DAILY_CAP_KEY, disabled);
            assert!(!tracker.is_daily_cap_exceeded().exceeded);
        }
    }

    #[test]
    fn test_cost_history_summary_windows() {
        let (tracker, settings, _) = tracker_with(10);
        settings.set(
            COST_HISTORY_KEY,
            json!({"days": {
                "2025-01-15": {"cost": 1.0, "requests": 1},
                "2025-01-10": {"cost": 2.0, "requests": 2},
                "2025-01-01": {"cost": 4.0, "requests": 4},
                "2024-12-01": {"cost": 8.0, "requests": 8}
            }}),
        );
        let summary = tracker.cost_history_summary();
        assert_eq!(summary.today.cost, 1.0);
        assert_eq!(summary.last_7_days.cost, 3.0);
        assert_eq!(summary.last_30_days.cost, 7.0);
        assert_eq!(summary.last_30_days.requests, 7);
    }

    #[test]
    fn test_usage_stats_summary() {
        let (tracker, settings, _) = tracker_with(10);
        settings.set(
            USAGE_STATS_KEY,
            json!({"days": {
                "2025-01-14": {"agentRuns": 2, "toolCalls": {"roam_search": 3}},
                "2025-01-01": {"agentRuns": 7}
            }}),
        );
        tracker.record_usage_stat("agentRuns", None);
        let summary = tracker.usage_stats_summary(7);
        assert_eq!(summary.days_covered, 2);
        assert_eq!(summary.counters["agentRuns"], 3);
        assert_eq!(summary.tool_calls["roam_search"], 3);
    }

    #[test]
    fn test_usage_stats_summary_with_huge_window() {
        let (tracker, settings, _) = tracker_with(10);
        settings.set(
            USAGE_STATS_KEY,
            json!({"days": {"2025-01-14": {"agentRuns": 2}}}),
        );
        let summary = tracker.usage_stats_summary(u32::MAX);
        assert_eq!(summary.days_covered, 1);
        assert_eq!(summary.counters["agentRuns"], 2);
        assert_eq!(tracker.usage_stats_summary(0).days_covered, 0);
    }

    #[test]
    fn test_days_before_saturates() {
        let day = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        assert_eq!(days_before(day, 14), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(days_before(NaiveDate::MIN, 1), NaiveDate::MIN);
        assert_eq!(days_before(day, u32::MAX), NaiveDate::MIN);
    }

    #[test]
    fn test_flush_without_runtime_persists_synchronously() {
        let (tracker, settings, _) = tracker_with(10_000);
        tracker.record_cost_entry("m", 1, 1, 0.1);
        tracker.record_usage_stat("agentRuns", None);
        assert_eq!(settings.write_count(), 0);
        assert!(tracker.has_pending_writes());

        tracker.flush(None);
        assert_eq!(settings.write_count(), 2);
        assert!(settings.get(COST_HISTORY_KEY).unwrap()["days"]["2025-01-15"].is_object());
        assert!(!tracker.has_pending_writes());
    }

    #[test]
    fn test_flush_is_noop_when_clean_or_storeless() {
        let (tracker, settings, _) = tracker_with(10);
        tracker.flush(None);
        tracker.flush(Some(settings.as_ref()));
        assert_eq!(settings.write_count(), 0);

        let bare = UsageTracker::new(
            UsageConfig::default(),
            None,
            Arc::new(ManualClock::at_fixed_date()),
        );
        bare.record_usage_stat("agentRuns", None);
        bare.flush(None);
        assert_eq!(bare.counter_today("agentRuns"), 1);
    }

    #[tokio::test]
    async fn test_debounced_persist_coalesces_writes() {
        let (tracker, settings, _) = tracker_with(20);
        tracker.record_cost_entry("m", 1, 1, 0.1);
        tracker.record_cost_entry("m", 1, 1, 0.1);
        tracker.record_cost_entry("m", 1, 1, 0.1);
        assert_eq!(settings.write_count(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(settings.write_count(), 1);
        let stored = settings.get(COST_HISTORY_KEY).unwrap();
        assert_eq!(stored["days"]["2025-01-15"]["requests"], 3);
    }

    #[tokio::test]
    async fn test_flush_cancels_pending_task() {
        let (tracker, settings, _) = tracker_with(50);
        tracker.record_usage_stat("agentRuns", None);
        tracker.flush(None);
        assert_eq!(settings.write_count(), 1);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(settings.write_count(), 1);
    }
}
