//! Agent Core: tool dispatch, routing and the turn loop.
//!
//! Submodules:
//! - `dispatcher`: Executes model tool calls behind approval gating
//! - `mutation`: Decides whether a call may change external state
//! - `meta_tools`: Multi-execute and local-MCP argument handling
//! - `approvals`: Time-limited approval grants
//! - `confirmation`: Channel-backed approval prompts and previews
//! - `tier_router`: Scores prompts onto mini / power / ludicrous tiers
//! - `live_data`: Keyword intent checks run before routing
//! - `session`: Per-conversation state passed to everything above
//! - `agent_loop`: Reference driver for one user turn
//! - `tokens`: Token estimates and result truncation
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod agent_loop;
pub mod approvals;
pub mod confirmation;
pub mod dispatcher;
pub mod errors;
pub mod live_data;
pub mod meta_tools;
pub mod mutation;
pub mod session;
pub mod tier_router;
pub mod tokens;
pub mod types;

// Re-exports for convenience
pub use agent_loop::{AgentLoop, TurnOutcome, TurnRequest};
pub use approvals::ApprovalStore;
pub use confirmation::{generate_preview, is_destructive_action, ChannelApprovalPrompter};
pub use dispatcher::{normalise_tool_name, normalise_tool_result, ExecuteOptions, ToolDispatcher};
pub use errors::AgentError;
pub use live_data::{
    classify_prompt, is_likely_live_data_read_intent, is_memory_edit_intent, is_meta_question,
    PromptIntent,
};
pub use mutation::is_potentially_mutating_tool;
pub use session::Session;
pub use tier_router::{
    compute_routing_score, parse_skill_entries, RoutingDecision, RoutingOptions, SkillEntry,
    STRATEGY_WEIGHTS,
};
pub use types::{ConfirmationRequest, ConfirmationResponse, Tier, TrajectoryEntry};
