//! Security core.
//!
//! - `patterns`: pattern tables and their compiled form
//! - `injection`: prompt-injection and memory-write guards
//! - `response_scan`: leakage and claimed-action checks on model output
//! - `sanitize`: link href sanitisation
//! - `schema_pin`: MCP tool-schema hashing and drift pinning

pub mod injection;
pub mod patterns;
pub mod response_scan;
pub mod sanitize;
pub mod schema_pin;

pub use injection::{
    detect_injection_patterns, detect_memory_injection, guard_memory_write_core,
    sanitise_user_content_for_prompt, InjectionScan, MemoryGuardResult,
};
pub use patterns::{default_patterns, CompiledPatterns};
pub use response_scan::{
    detect_claimed_action_without_tool_call, detect_system_prompt_leakage, ClaimedActionScan,
    LeakageScan,
};
pub use sanitize::sanitise_markdown_href;
pub use schema_pin::{
    accept_schema_change, canonicalise_schema_for_hash, check_schema_pin_core,
    compute_schema_hash_core, PinStatus, SchemaDrift, SchemaHashCache, SchemaPinOutcome,
    ToolModification,
};
