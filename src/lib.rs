//! Agent orchestration core for a notes-hosted Chief-of-Staff assistant.
//!
//! The host owns the UI, storage and network; this crate owns the decisions
//! between them:
//! - `agent_core`: tool dispatch with approval gating, tier routing, the
//!   per-conversation session and a reference agent loop
//! - `security`: injection scans, memory-write guard, schema pinning and
//!   output scans
//! - `usage`: cost history, usage counters and the daily spending cap
//! - `inference`: provider message families and failover conversion
//! - `mcp_client`: the tool registry and MCP transport seam
//! - `cors_proxy`: the browser proxy's request filter
//! - `host`: traits for everything the host injects
//! - `config`: YAML configuration

pub mod agent_core;
pub mod config;
pub mod cors_proxy;
pub mod host;
pub mod inference;
pub mod mcp_client;
pub mod security;
pub mod usage;

use std::path::{Path, PathBuf};

pub use agent_core::{AgentError, AgentLoop, Session, ToolDispatcher};
pub use config::CoreConfig;
pub use usage::UsageTracker;

const DEFAULT_LOG_FILTER: &str = "cos_agent_core=info,warn";
const LOG_FILE_NAME: &str = "agent.log";
const LOG_FILES_KEPT: u32 = 3;

/// Return the platform-standard data directory for the assistant.
///
/// Falls back to `~/.cos-agent/` when the platform directory is unknown.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("cos-agent");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cos-agent")
}

/// Install the global tracing subscriber.
///
/// With `log_dir`, rotates `agent.log` (keeping the last three) and writes
/// through a line-flushing file writer; without it, logs go to stderr.
/// `RUST_LOG` overrides the default filter. Calling this again after a
/// subscriber is installed is a no-op.
pub fn init_tracing(log_dir: Option<&Path>) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let Some(log_dir) = log_dir else {
        let _ = fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .try_init();
        return Ok(());
    };

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, LOG_FILES_KEPT);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let installed = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = %log_path.display(),
            pid = std::process::id(),
            "=== cos-agent-core starting ==="
        );
    }
    Ok(())
}

/// Rotate log files: `agent.log` → `agent.log.1` → `.2` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Missing files are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A file writer that flushes after every write so log lines survive a
/// host crash.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
