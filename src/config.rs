//! Core configuration loading and validation.
//!
//! Reads an optional YAML file and resolves environment variables. Every
//! field has a built-in default, so an absent file or an empty document
//! yields the documented constants. Security pattern tables live here too so
//! they can be tuned without recompiling.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::patterns;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors from loading or validating a [`CoreConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    /// The YAML did not deserialize.
    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    /// The config parsed but a value is out of range or a pattern is invalid.
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Tier thresholds and the ludicrous switch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub power_threshold: f64,
    pub ludicrous_threshold: f64,
    pub ludicrous_enabled: bool,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            power_threshold: 0.45,
            ludicrous_threshold: 0.90,
            ludicrous_enabled: false,
        }
    }
}

/// Approval store settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// How long a granted approval stays valid.
    pub ttl_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self { ttl_secs: 15 * 60 }
    }
}

/// Usage tracker persistence settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub persist_debounce_ms: u64,
    pub retention_days: u32,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            persist_debounce_ms: 2_000,
            retention_days: 90,
        }
    }
}

/// Budgets for the reference agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLoopConfig {
    pub max_iterations: u32,
    /// Per-result cap before a tool result is appended to history.
    pub max_result_chars: usize,
    /// Cap on accumulated tool-result characters across one turn.
    pub max_total_chars: usize,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_result_chars: 12_000,
            max_total_chars: 120_000,
        }
    }
}

/// A named regex from one of the injection tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPattern {
    pub name: String,
    pub pattern: String,
}

impl NamedPattern {
    pub fn new(name: &str, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
        }
    }
}

/// Security data tables. Any table present in YAML replaces the default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub injection: Vec<NamedPattern>,
    pub memory_injection: Vec<NamedPattern>,
    /// Internal phrases whose presence in output suggests prompt leakage.
    pub leakage_fingerprints: Vec<String>,
    pub read_only_slug_tokens: Vec<String>,
    pub write_slug_tokens: Vec<String>,
    pub extension_read_only_tokens: Vec<String>,
    pub local_mcp_read_only_tokens: Vec<String>,
    pub sensitive_tokens: Vec<String>,
    /// Composio slugs that never require approval.
    pub safe_slugs: Vec<String>,
    /// Tools callable in read-only mode.
    pub read_only_allowlist: Vec<String>,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            injection: patterns::default_injection_patterns(),
            memory_injection: patterns::default_memory_injection_patterns(),
            leakage_fingerprints: to_strings(patterns::LEAKAGE_FINGERPRINTS),
            read_only_slug_tokens: to_strings(patterns::READ_ONLY_SLUG_TOKENS),
            write_slug_tokens: to_strings(patterns::WRITE_SLUG_TOKENS),
            extension_read_only_tokens: to_strings(patterns::EXTENSION_READ_ONLY_TOKENS),
            local_mcp_read_only_tokens: to_strings(patterns::LOCAL_MCP_READ_ONLY_TOKENS),
            sensitive_tokens: to_strings(patterns::SENSITIVE_TOKENS),
            safe_slugs: to_strings(patterns::SAFE_COMPOSIO_SLUGS),
            read_only_allowlist: to_strings(patterns::READ_ONLY_TOOL_ALLOWLIST),
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub tier: TierConfig,
    pub approvals: ApprovalConfig,
    pub usage: UsageConfig,
    pub agent_loop: AgentLoopConfig,
    pub patterns: PatternConfig,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl CoreConfig {
    /// Load, interpolate and validate a YAML config file.
    ///
    /// String values may reference `${VAR_NAME}` or `${VAR_NAME:-default}`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::from_yaml_str(&raw)?;
        tracing::info!(path = %path.display(), "loaded core config");
        Ok(config)
    }

    /// Parse and validate config from a YAML string.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(raw);
        if interpolated.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: CoreConfig =
            serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check thresholds and that every pattern compiles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let TierConfig {
            power_threshold: power,
            ludicrous_threshold: ludicrous,
            ..
        } = self.tier;
        if !(power > 0.0 && power < ludicrous && ludicrous < 1.0) {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "tier thresholds must satisfy 0 < power < ludicrous < 1 (got {power}, {ludicrous})"
                ),
            });
        }
        if self.approvals.ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                reason: "approvals.ttl_secs must be positive".into(),
            });
        }
        if self.agent_loop.max_iterations == 0 {
            return Err(ConfigError::Invalid {
                reason: "agent_loop.max_iterations must be positive".into(),
            });
        }
        patterns::CompiledPatterns::compile(&self.patterns)?;
        Ok(())
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_constants() {
        let config = CoreConfig::default();
        assert_eq!(config.tier.power_threshold, 0.45);
        assert_eq!(config.tier.ludicrous_threshold, 0.90);
        assert!(!config.tier.ludicrous_enabled);
        assert_eq!(config.approvals.ttl_secs, 900);
        assert_eq!(config.usage.retention_days, 90);
        assert_eq!(config.patterns.injection.len(), 13);
        assert_eq!(config.patterns.memory_injection.len(), 13);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let yaml = "tier:\n  ludicrous_enabled: true\nusage:\n  persist_debounce_ms: 50\n";
        let config = CoreConfig::from_yaml_str(yaml).unwrap();
        assert!(config.tier.ludicrous_enabled);
        assert_eq!(config.tier.power_threshold, 0.45);
        assert_eq!(config.usage.persist_debounce_ms, 50);
        assert_eq!(config.usage.retention_days, 90);
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(CoreConfig::from_yaml_str("  \n").unwrap(), CoreConfig::default());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let yaml = "tier:\n  power_threshold: 0.95\n  ludicrous_threshold: 0.5\n";
        let err = CoreConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let yaml = "patterns:\n  injection:\n    - name: broken\n      pattern: \"(unclosed\"\n";
        let err = CoreConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_pattern_table_override() {
        let yaml = "patterns:\n  sensitive_tokens: [NUKE]\n";
        let config = CoreConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.patterns.sensitive_tokens, vec!["NUKE".to_string()]);
        assert_eq!(config.patterns.injection.len(), 13);
    }

    #[test]
    fn test_load_from_file_with_env_interpolation() {
        std::env::set_var("__COS_TEST_MAX_ITER__", "4");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "agent_loop:\n  max_iterations: ${{__COS_TEST_MAX_ITER__}}").unwrap();
        let config = CoreConfig::load(file.path()).unwrap();
        assert_eq!(config.agent_loop.max_iterations, 4);
        std::env::remove_var("__COS_TEST_MAX_ITER__");
    }

    #[test]
    fn test_load_missing_file() {
        let err = CoreConfig::load(Path::new("/nonexistent/cos.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__COS_TEST_NONEXISTENT_VAR__");
        let result = interpolate_env_vars("${__COS_TEST_NONEXISTENT_VAR__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/notes");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/notes"));
    }
}
