//! Inference layer: provider message families and their plumbing.
//!
//! - `types`: message shapes for the content-block and tool-calls families
//! - `adapters`: per-family function tables (extract calls/text, append turns)
//! - `converter`: history conversion across providers during failover
//! - `tool_call_parser`: balanced JSON extraction and argument repair
//! - `client`: the injected LLM transport seam
//! - `errors`: inference error types

pub mod adapters;
pub mod client;
pub mod converter;
pub mod errors;
pub mod tool_call_parser;
pub mod types;

// Re-exports for convenience
pub use adapters::{adapter_for, FamilyAdapter, ResponseUsage};
pub use client::LlmTransport;
pub use converter::{
    convert_messages_for_provider, detect_successful_write_tool_calls_in_messages,
    SuccessfulWrite,
};
pub use errors::InferenceError;
pub use tool_call_parser::{extract_balanced_json_objects, ExtractedJson};
pub use types::{
    BlockMessage, ChatMessage, ContentBlock, LlmRequest, LlmResponse, ProviderFamily,
    ProviderMessages, ProviderSpec, Role, ToolCall, ToolSpec,
};
