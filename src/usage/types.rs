//! Persisted usage shapes.
//!
//! `cost-history` and `usage-stats` are stored as JSON objects with a `days`
//! map keyed by `YYYY-MM-DD`. Reads are lenient: an absent, null, non-object
//! or `days`-less value is an empty history, and a day that fails to
//! deserialize is dropped on its own.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Settings key for [`CostHistory`].
pub const COST_HISTORY_KEY: &str = "cost-history";
/// Settings key for [`UsageStats`].
pub const USAGE_STATS_KEY: &str = "usage-stats";
/// Settings key for the daily USD cap (numeric string).
pub const DAILY_CAP_KEY: &str = "daily-spending-cap";

/// Per-model slice of a [`CostDay`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelCost {
    pub cost: f64,
    pub input: u64,
    pub output: u64,
    pub requests: u64,
}

/// One UTC day of LLM spend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostDay {
    pub cost: f64,
    pub input: u64,
    pub output: u64,
    pub requests: u64,
    pub models: BTreeMap<String, ModelCost>,
}

impl CostDay {
    pub fn add(&mut self, model: &str, input: u64, output: u64, cost: f64) {
        self.cost += cost;
        self.input += input;
        self.output += output;
        self.requests += 1;
        let m = self.models.entry(model.to_string()).or_default();
        m.cost += cost;
        m.input += input;
        m.output += output;
        m.requests += 1;
    }
}

/// One UTC day of named counters and tool-call frequencies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStatsDay {
    #[serde(rename = "toolCalls", default)]
    pub tool_calls: BTreeMap<String, u64>,
    #[serde(flatten)]
    pub counters: BTreeMap<String, u64>,
}

/// The `cost-history` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostHistory {
    pub days: BTreeMap<String, CostDay>,
}

/// The `usage-stats` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub days: BTreeMap<String, UsageStatsDay>,
}

impl CostHistory {
    pub fn from_stored(value: Option<serde_json::Value>) -> Self {
        Self {
            days: lenient_days(value),
        }
    }
}

impl UsageStats {
    pub fn from_stored(value: Option<serde_json::Value>) -> Self {
        Self {
            days: lenient_days(value),
        }
    }
}

/// Parse the `days` map of a stored document, skipping malformed days.
///
/// Hosts that store JSON as a string are handled too.
fn lenient_days<T: DeserializeOwned>(value: Option<serde_json::Value>) -> BTreeMap<String, T> {
    let value = match value {
        Some(serde_json::Value::String(s)) => serde_json::from_str(&s).ok(),
        other => other,
    };
    let Some(serde_json::Value::Object(mut doc)) = value else {
        return BTreeMap::new();
    };
    let Some(serde_json::Value::Object(days)) = doc.remove("days") else {
        return BTreeMap::new();
    };

    days.into_iter()
        .filter_map(|(date, day)| match serde_json::from_value::<T>(day) {
            Ok(parsed) => Some((date, parsed)),
            Err(e) => {
                tracing::debug!(date = %date, error = %e, "dropping malformed usage day");
                None
            }
        })
        .collect()
}

/// Totals over a span of days.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PeriodCost {
    pub cost: f64,
    pub input: u64,
    pub output: u64,
    pub requests: u64,
}

impl PeriodCost {
    pub(crate) fn add_day(&mut self, day: &CostDay) {
        self.cost += day.cost;
        self.input += day.input;
        self.output += day.output;
        self.requests += day.requests;
    }
}

/// Today / trailing-7 / trailing-30 spend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSummary {
    pub today: PeriodCost,
    pub last_7_days: PeriodCost,
    pub last_30_days: PeriodCost,
}

/// Result of the daily-cap check. `cap` is `None` when no cap is set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CapStatus {
    pub exceeded: bool,
    pub cap: Option<f64>,
    pub spent: f64,
}

/// Counters summed over a trailing window of days.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatsSummary {
    pub days_covered: usize,
    pub counters: BTreeMap<String, u64>,
    pub tool_calls: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lenient_reads_treat_garbage_as_empty() {
        assert!(CostHistory::from_stored(None).days.is_empty());
        assert!(CostHistory::from_stored(Some(json!(null))).days.is_empty());
        assert!(CostHistory::from_stored(Some(json!(42))).days.is_empty());
        assert!(CostHistory::from_stored(Some(json!({"other": 1}))).days.is_empty());
        assert!(UsageStats::from_stored(Some(json!({"days": []}))).days.is_empty());
    }

    #[test]
    fn test_malformed_day_dropped_alone() {
        let stored = json!({"days": {
            "2025-01-14": {"cost": 1.5, "input": 10, "output": 2, "requests": 1},
            "2025-01-15": "broken"
        }});
        let history = CostHistory::from_stored(Some(stored));
        assert_eq!(history.days.len(), 1);
        assert_eq!(history.days["2025-01-14"].cost, 1.5);
    }

    #[test]
    fn test_string_encoded_document() {
        let stored = json!(r#"{"days":{"2025-01-15":{"agentRuns":3,"toolCalls":{"roam_search":2}}}}"#);
        let stats = UsageStats::from_stored(Some(stored));
        let day = &stats.days["2025-01-15"];
        assert_eq!(day.counters["agentRuns"], 3);
        assert_eq!(day.tool_calls["roam_search"], 2);
    }

    #[test]
    fn test_usage_day_serializes_flat() {
        let mut day = UsageStatsDay::default();
        day.counters.insert("approvalsGranted".into(), 2);
        day.tool_calls.insert("roam_create_block".into(), 1);
        let v = serde_json::to_value(&day).unwrap();
        assert_eq!(v, json!({"approvalsGranted": 2, "toolCalls": {"roam_create_block": 1}}));
    }
}
