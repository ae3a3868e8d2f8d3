//! Host seams: the callables the core consumes from its embedding host.
//!
//! The host (the notes app extension) owns UI, storage and the clock. The
//! core only sees these traits:
//! - [`SettingsStore`]: namespaced key/value persistence
//! - [`ApprovalPrompter`]: asks the user to approve a tool call
//! - [`Notifier`]: info/error toasts
//! - [`Clock`]: wall-clock milliseconds (injectable for TTL tests)
//! - [`PageResolver`]: resolves a block uid to its page uid
//!
//! In-memory implementations live here too; hosts use them for headless
//! runs and the test suite uses them everywhere.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Settings ────────────────────────────────────────────────────────────────

/// Host key/value settings. Values are JSON.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<serde_json::Value>;
    fn set(&self, key: &str, value: serde_json::Value);
}

/// In-memory settings map that counts writes.
#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, serde_json::Value>>,
    writes: AtomicUsize,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls observed.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: serde_json::Value) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        lock(&self.values).insert(key.to_string(), value);
    }
}

// ─── Approval Prompts ────────────────────────────────────────────────────────

/// Asks the user whether a tool call may run. `false` means denied.
#[async_trait]
pub trait ApprovalPrompter: Send + Sync {
    async fn request_approval(&self, tool_name: &str, arguments: &serde_json::Value) -> bool;
}

/// Prompter that replays queued answers and records every prompt.
///
/// Once the queue is empty it answers with `fallback`.
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<bool>>,
    fallback: bool,
    prompts: Mutex<Vec<(String, serde_json::Value)>>,
}

impl ScriptedPrompter {
    pub fn new(answers: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            fallback,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always approve.
    pub fn approving() -> Self {
        Self::new([], true)
    }

    /// Always deny.
    pub fn denying() -> Self {
        Self::new([], false)
    }

    /// `(tool_name, arguments)` for each prompt, in order.
    pub fn prompts(&self) -> Vec<(String, serde_json::Value)> {
        lock(&self.prompts).clone()
    }

    pub fn prompt_count(&self) -> usize {
        lock(&self.prompts).len()
    }
}

#[async_trait]
impl ApprovalPrompter for ScriptedPrompter {
    async fn request_approval(&self, tool_name: &str, arguments: &serde_json::Value) -> bool {
        lock(&self.prompts).push((tool_name.to_string(), arguments.clone()));
        lock(&self.answers).pop_front().unwrap_or(self.fallback)
    }
}

// ─── Notifications ───────────────────────────────────────────────────────────

/// Toast severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Error,
}

/// Host toasts.
pub trait Notifier: Send + Sync {
    fn info(&self, title: &str, message: &str);
    fn error(&self, title: &str, message: &str);
}

/// Discards every toast.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn info(&self, _title: &str, _message: &str) {}
    fn error(&self, _title: &str, _message: &str) {}
}

/// Keeps every toast for inspection.
#[derive(Default)]
pub struct RecordingNotifier {
    toasts: Mutex<Vec<(ToastLevel, String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toasts(&self) -> Vec<(ToastLevel, String, String)> {
        lock(&self.toasts).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn info(&self, title: &str, message: &str) {
        lock(&self.toasts).push((ToastLevel::Info, title.to_string(), message.to_string()));
    }

    fn error(&self, title: &str, message: &str) {
        lock(&self.toasts).push((ToastLevel::Error, title.to_string(), message.to_string()));
    }
}

// ─── Clock ───────────────────────────────────────────────────────────────────

/// Wall-clock milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// The system clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    /// A clock at 2025-01-15T12:00:00Z.
    pub fn at_fixed_date() -> Self {
        Self::new(1_736_942_400_000)
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: std::time::Duration) {
        self.millis
            .fetch_add(delta.as_millis() as i64, Ordering::SeqCst);
    }

    /// Move the clock backwards (non-monotonic wall clock).
    pub fn rewind(&self, delta: std::time::Duration) {
        self.millis
            .fetch_sub(delta.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

// ─── Page Resolution ─────────────────────────────────────────────────────────

/// Resolves a block uid to the uid of the page that contains it.
///
/// Returns `None` when the uid is unknown to the graph.
#[async_trait]
pub trait PageResolver: Send + Sync {
    async fn page_uid_for(&self, uid: &str) -> Option<String>;
}

/// Treats every uid as a page uid.
pub struct IdentityPageResolver;

#[async_trait]
impl PageResolver for IdentityPageResolver {
    async fn page_uid_for(&self, uid: &str) -> Option<String> {
        Some(uid.to_string())
    }
}

/// Fixed block → page table; unknown uids resolve to themselves.
#[derive(Default)]
pub struct MapPageResolver {
    pages: HashMap<String, String>,
}

impl MapPageResolver {
    pub fn new(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            pages: pairs.into_iter().collect(),
        }
    }
}

#[async_trait]
impl PageResolver for MapPageResolver {
    async fn page_uid_for(&self, uid: &str) -> Option<String> {
        Some(self.pages.get(uid).cloned().unwrap_or_else(|| uid.to_string()))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
