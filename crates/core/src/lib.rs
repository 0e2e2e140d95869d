//! Domain layer for the AI orchestration subsystem.
//!
//! Pure types and deterministic logic only: feature inputs and validated
//! results, the error taxonomy, configuration, prompt compilation with cache
//! fingerprints, and the per-feature output contracts. Everything that
//! performs I/O or holds runtime state lives in `advisor-ai` and
//! `advisor-db`.

pub mod config;
pub mod domain;
pub mod errors;
pub mod prompt;
pub mod validate;

pub use config::{AiConfig, ConfigError, LoadOptions};
pub use domain::budget::{BudgetCounter, TokenUsage};
pub use domain::chat::{ChatMessage, ChatRole, ChatSession, SessionId};
pub use domain::feature::{
    ApplicationSnapshot, CandidateProduct, ClientProfile, Confidence, DocumentText,
    ExtractedFields, Explanation, Feature, FeatureResult, QuoteSnapshot, RecommendedProduct,
    Recommendations, RiskTolerance, SuitabilityReport,
};
pub use domain::suitability::{
    Acknowledgment, FlagItem, FlagSetId, RaisedFlag, Severity, SuitabilityFlagSet,
};
pub use domain::{ApplicationId, ProductId, UserId};
pub use errors::AiError;
pub use prompt::{CompiledPrompt, Fingerprint, PromptCompiler, PromptError};
pub use validate::{validate, ValidationFailure};
