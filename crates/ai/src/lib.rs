//! Orchestration layer between product features and the model provider.
//!
//! Feature calls funnel through one pipeline that owns prompt compilation,
//! per-user daily token budgets, response caching with request coalescing,
//! timeouts and retries, and strict output validation. Product code never
//! talks to the provider directly.

pub mod cache;
pub mod chat;
pub mod gateway;
pub mod ledger;
pub mod orchestrator;
pub mod provider_http;

pub use cache::ResponseCache;
pub use chat::{ChatEvent, ChatSessionManager, ChatStream};
pub use gateway::{
    DeltaStream, GatewayStream, ModelGateway, ModelProvider, ModelResponse, ProviderError,
    RetryPolicy, StreamEvent,
};
pub use ledger::{
    estimate_request_tokens, BudgetLedger, BudgetReservation, ReserveOutcome,
};
pub use orchestrator::AiOrchestrator;
pub use provider_http::HttpModelProvider;
