//! LLM transport seam.
//!
//! The core owns no network stack. Hosts implement [`LlmTransport`] over
//! whatever HTTP client they use; the agent loop drives it through the
//! provider failover chain.

use async_trait::async_trait;

use super::errors::InferenceError;
use super::types::{LlmRequest, LlmResponse, ProviderSpec};

/// Sends one request to one provider.
///
/// Implementations own timeouts and retries for a single provider; the
/// failover layer above treats any `Err` as a signal to try the next one.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn call_llm(
        &self,
        provider: &ProviderSpec,
        request: &LlmRequest,
    ) -> Result<LlmResponse, InferenceError>;
}
