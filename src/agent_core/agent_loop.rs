//! Reference agent loop.
//!
//! Drives one user turn: model call, tool dispatch, results back to the
//! model, repeated until the model answers in text or a budget runs out.
//! Provider failures fail over along the chain, converting the history when
//! the next provider speaks a different message family.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::dispatcher::{ExecuteOptions, ToolDispatcher};
use super::errors::AgentError;
use super::session::Session;
use super::tokens::render_tool_result;
use super::types::{Tier, TrajectoryEntry};
use crate::config::AgentLoopConfig;
use crate::host::Notifier;
use crate::inference::converter::{
    convert_messages_for_provider, detect_successful_write_tool_calls_in_messages,
    format_completed_writes_notice, is_successful_result_value,
};
use crate::inference::{
    adapter_for, LlmRequest, LlmResponse, LlmTransport, ProviderMessages, ProviderSpec, ToolCall,
    ToolSpec,
};
use crate::security::{detect_claimed_action_without_tool_call, detect_system_prompt_leakage};

const DEFAULT_MAX_TOKENS: u32 = 4096;

// ─── Types ──────────────────────────────────────────────────────────────────

/// Everything one turn needs besides the session.
#[derive(Debug, Clone)]
pub struct TurnRequest<'a> {
    /// Failover chain, preferred provider first.
    pub providers: &'a [ProviderSpec],
    pub system: &'a str,
    pub messages: ProviderMessages,
    pub tools: &'a [ToolSpec],
    /// Tier the router chose for this turn.
    pub tier: Tier,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub text: String,
    pub messages: ProviderMessages,
    pub tool_calls_made: usize,
    pub iterations: u32,
    /// Id of the provider that produced the final answer.
    pub provider: String,
    pub failed_over: bool,
    /// Tool results exceeded the turn's character budget.
    pub budget_exhausted: bool,
    pub leakage_detected: bool,
    pub claimed_action_without_tool: bool,
}

/// Per-turn tool accounting for the trajectory entry.
#[derive(Default)]
struct ToolTally {
    calls: usize,
    unique: BTreeSet<String>,
    successful: BTreeSet<String>,
}

impl ToolTally {
    fn record(&mut self, name: &str, result: &Value) {
        self.calls += 1;
        self.unique.insert(name.to_string());
        if is_successful_result_value(result) {
            self.successful.insert(name.to_string());
        }
    }
}

/// Provider position in the chain plus the history converted for it.
struct ChainState {
    index: usize,
    messages: ProviderMessages,
    system: String,
    failed_over: bool,
}

// ─── AgentLoop ──────────────────────────────────────────────────────────────

pub struct AgentLoop {
    llm: Arc<dyn LlmTransport>,
    dispatcher: Arc<ToolDispatcher>,
    notifier: Arc<dyn Notifier>,
    config: AgentLoopConfig,
    max_tokens: u32,
}

impl AgentLoop {
    pub fn new(
        llm: Arc<dyn LlmTransport>,
        dispatcher: Arc<ToolDispatcher>,
        notifier: Arc<dyn Notifier>,
        config: AgentLoopConfig,
    ) -> Self {
        Self {
            llm,
            dispatcher,
            notifier,
            config,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Run one user turn to completion.
    ///
    /// Tool calls run strictly in the order the model emitted them. A user
    /// denial goes back to the model as an error result; any other dispatcher
    /// error ends the turn.
    pub async fn run_turn(
        &self,
        session: &mut Session,
        request: TurnRequest<'_>,
    ) -> Result<TurnOutcome, AgentError> {
        let cap = session.usage.is_daily_cap_exceeded();
        if cap.exceeded {
            let cap_usd = cap.cap.unwrap_or_default();
            tracing::warn!(cap = cap_usd, spent = cap.spent, "daily spending cap reached");
            self.notifier.error(
                "Daily spending cap reached",
                &format!("Spent ${:.2} of ${:.2} today.", cap.spent, cap_usd),
            );
            return Err(AgentError::CapExceeded {
                cap: cap_usd,
                spent: cap.spent,
            });
        }

        let Some(first) = request.providers.first() else {
            return Err(AgentError::AllProvidersFailed { attempted: Vec::new() });
        };
        let messages = if request.messages.family() == first.family {
            request.messages
        } else {
            convert_messages_for_provider(&request.messages, first, first)
        };
        let mut chain = ChainState {
            index: 0,
            messages,
            system: request.system.to_string(),
            failed_over: false,
        };

        let mut tally = ToolTally::default();
        let mut total_result_chars = 0usize;
        let mut budget_exhausted = false;
        let mut iterations = 0u32;
        let final_text;

        loop {
            if iterations >= self.config.max_iterations {
                tracing::warn!(limit = self.config.max_iterations, "agent loop hit iteration limit");
                self.notifier.error(
                    "Agent stopped",
                    &format!("Reached the limit of {} model calls.", self.config.max_iterations),
                );
                self.finish_turn(session, &tally, iterations, request.tier, chain.failed_over);
                return Err(AgentError::IterationLimit {
                    limit: self.config.max_iterations,
                });
            }
            iterations += 1;

            let response = self
                .call_with_failover(session, request.providers, &mut chain, request.tools)
                .await?;
            let provider = &request.providers[chain.index];
            let adapter = adapter_for(provider.family);

            let usage = (adapter.extract_usage)(&response.body);
            let cost = provider.cost_for(usage.input_tokens, usage.output_tokens);
            session
                .usage
                .record_cost_entry(&provider.model, usage.input_tokens, usage.output_tokens, cost);
            session
                .usage
                .accumulate_session_tokens(usage.input_tokens, usage.output_tokens, cost);

            let calls = (adapter.extract_tool_calls)(&response.body);
            let text = (adapter.extract_text)(&response.body);
            (adapter.format_assistant)(&response.body, &mut chain.messages);

            if calls.is_empty() {
                final_text = text;
                break;
            }

            tracing::info!(
                iteration = iterations,
                provider = %provider.id,
                tool_calls = calls.len(),
                "dispatching tool calls"
            );

            let mut results: Vec<(ToolCall, Value)> = Vec::with_capacity(calls.len());
            for call in calls {
                let result = self.dispatch(session, &call).await?;
                tally.record(&call.name, &result);

                let (rendered, truncated) = render_tool_result(&result, self.config.max_result_chars);
                total_result_chars += rendered.chars().count();
                let content = if truncated {
                    tracing::debug!(tool = %call.name, "tool result truncated");
                    Value::String(rendered)
                } else {
                    result
                };
                results.push((call, content));
            }
            (adapter.format_tool_results)(&results, &mut chain.messages);

            if total_result_chars > self.config.max_total_chars {
                tracing::warn!(
                    total_chars = total_result_chars,
                    limit = self.config.max_total_chars,
                    "tool result budget exhausted"
                );
                budget_exhausted = true;
                final_text = text;
                break;
            }
        }

        self.finish_turn(session, &tally, iterations, request.tier, chain.failed_over);

        let leakage = detect_system_prompt_leakage(&final_text, self.dispatcher.patterns());
        let known_tools = self.dispatcher.registry().all_tools();
        let claimed = detect_claimed_action_without_tool_call(&final_text, tally.calls, &known_tools);

        Ok(TurnOutcome {
            text: final_text,
            messages: chain.messages,
            tool_calls_made: tally.calls,
            iterations,
            provider: request.providers[chain.index].id.clone(),
            failed_over: chain.failed_over,
            budget_exhausted,
            leakage_detected: leakage.leaked,
            claimed_action_without_tool: claimed.detected,
        })
    }

    async fn dispatch(&self, session: &mut Session, call: &ToolCall) -> Result<Value, AgentError> {
        match self
            .dispatcher
            .execute_tool_call(session, &call.name, call.arguments.clone(), ExecuteOptions::default())
            .await
        {
            Ok(value) => Ok(value),
            Err(e) if !e.is_fatal_for_turn() => Ok(serde_json::json!({ "error": e.to_string() })),
            Err(e) => Err(e),
        }
    }

    /// Call the current provider, moving down the chain on failure.
    async fn call_with_failover(
        &self,
        session: &Session,
        providers: &[ProviderSpec],
        chain: &mut ChainState,
        tools: &[ToolSpec],
    ) -> Result<LlmResponse, AgentError> {
        let mut attempted: Vec<String> = Vec::new();
        loop {
            let provider = &providers[chain.index];
            let request = LlmRequest {
                model: provider.model.clone(),
                system: chain.system.clone(),
                messages: chain.messages.clone(),
                tools: tools.to_vec(),
                max_tokens: self.max_tokens,
            };

            let error = match self.llm.call_llm(provider, &request).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            tracing::warn!(
                session_id = %session.id,
                provider = %provider.id,
                error = %error,
                "provider call failed"
            );
            attempted.push(provider.id.clone());

            let next = chain.index + 1;
            if !error.is_failover_candidate() || next >= providers.len() {
                self.notifier.error("All providers failed", &error.to_string());
                return Err(AgentError::AllProvidersFailed { attempted });
            }
            self.switch_provider(chain, provider, &providers[next]);
        }
    }

    fn switch_provider(&self, chain: &mut ChainState, from: &ProviderSpec, to: &ProviderSpec) {
        let writes = detect_successful_write_tool_calls_in_messages(&chain.messages, |name, args| {
            self.dispatcher.is_potentially_mutating_tool(name, args, None)
        });
        chain.messages = convert_messages_for_provider(&chain.messages, from, to);
        if let Some(notice) = format_completed_writes_notice(&writes) {
            chain.system.push_str("\n\n");
            chain.system.push_str(&notice);
        }

        chain.index += 1;
        chain.failed_over = true;
        tracing::info!(from = %from.id, to = %to.id, completed_writes = writes.len(), "failing over");
        self.notifier
            .info("Switched model provider", &format!("Continuing with {}.", to.id));
    }

    fn finish_turn(
        &self,
        session: &mut Session,
        tally: &ToolTally,
        iterations: u32,
        tier: Tier,
        failed_over: bool,
    ) {
        let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
        session.push_trajectory(TrajectoryEntry {
            tool_count: count(tally.calls),
            unique_tool_count: count(tally.unique.len()),
            successful_unique_tool_count: count(tally.successful.len()),
            iterations,
            tier,
            escalated: tier > Tier::Mini,
            failed_over,
            timestamp_ms: session.now_millis(),
        });
        session.usage.record_usage_stat("agentRuns", None);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
