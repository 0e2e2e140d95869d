use std::fmt::Display;

use thiserror::Error;

/// Error taxonomy for the AI orchestration layer.
///
/// Every error surfaced to a feature or application caller is one of these
/// variants, so callers can render a degraded user-facing message instead of
/// a generic failure. Retry behavior is fixed per variant: transient upstream
/// failures and malformed output each get exactly one bounded retry inside
/// the orchestrator; budget denials and permanent upstream errors are never
/// retried.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AiError {
    #[error("daily token budget exceeded ({remaining} tokens remaining today)")]
    BudgetExceeded { remaining: u64 },
    #[error("model provider unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("model provider rejected the request permanently: {0}")]
    UpstreamPermanent(String),
    #[error("model output failed validation: {0}")]
    Validation(String),
    #[error("stream stalled: no delta received for {idle_secs}s")]
    StreamStalled { idle_secs: u64 },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("caller does not own this resource")]
    Forbidden,
    #[error("flag item is already acknowledged")]
    AlreadyAcknowledged,
    #[error("session is already processing a message")]
    Busy,
    #[error("store failure: {0}")]
    Store(String),
    #[error("internal failure: {0}")]
    Internal(String),
}

impl AiError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    pub fn store(source: impl Display) -> Self {
        Self::Store(source.to_string())
    }

    /// Non-repository failures inside the orchestration layer itself, such
    /// as a template that fails to render.
    pub fn internal(source: impl Display) -> Self {
        Self::Internal(source.to_string())
    }

    /// Safe to show to an end user; never leaks provider payloads or ids.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BudgetExceeded { .. } => {
                "Your daily AI allowance has been used up. Please try again tomorrow."
            }
            Self::UpstreamUnavailable(_) | Self::StreamStalled { .. } => {
                "The AI service is temporarily unavailable. Please retry shortly."
            }
            Self::UpstreamPermanent(_) | Self::Store(_) | Self::Internal(_) => {
                "The AI service could not process this request."
            }
            Self::Validation(_) => {
                "The AI response could not be interpreted. Please try again."
            }
            Self::NotFound { .. } => "The requested item could not be found.",
            Self::Forbidden => "You do not have access to this item.",
            Self::AlreadyAcknowledged => "This flag has already been acknowledged.",
            Self::Busy => "The assistant is still answering your previous message.",
        }
    }

    /// Transient errors may be retried by the caller; everything else is
    /// either final or requires a different request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_) | Self::StreamStalled { .. })
    }
}
