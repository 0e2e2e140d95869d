//! Inbound interface of the orchestration layer.
//!
//! Every cacheable feature runs the same pipeline: compile -> cache/coalesce
//! -> reserve -> gateway -> validate -> commit. Chat bypasses the cache and
//! goes through the session manager; the suitability feature additionally
//! persists its judgment as a flag set.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use advisor_core::config::AiConfig;
use advisor_core::domain::chat::{ChatMessage, SessionId};
use advisor_core::domain::feature::{
    ApplicationSnapshot, CandidateProduct, ClientProfile, DocumentText, ExtractedFields,
    Explanation, FeatureResult, QuoteSnapshot, Recommendations,
};
use advisor_core::domain::suitability::{FlagItem, FlagSetId, SuitabilityFlagSet};
use advisor_core::domain::{ApplicationId, UserId};
use advisor_core::errors::AiError;
use advisor_core::prompt::{CompiledPrompt, PromptCompiler, PromptError};
use advisor_core::validate::validate;
use advisor_db::{AcknowledgeOutcome, FlagSetRepository};

use crate::cache::ResponseCache;
use crate::chat::{ChatSessionManager, ChatStream};
use crate::gateway::{ModelGateway, ModelProvider, RetryPolicy};
use crate::ledger::{estimate_request_tokens, BudgetLedger, ReserveOutcome};

pub struct AiOrchestrator {
    compiler: Arc<PromptCompiler>,
    cache: ResponseCache,
    ledger: Arc<BudgetLedger>,
    gateway: Arc<ModelGateway>,
    flags: Arc<dyn FlagSetRepository>,
    chat: ChatSessionManager,
    cache_ttl: Duration,
    max_output_tokens: u32,
    model_version: String,
}

impl AiOrchestrator {
    pub fn new(
        config: &AiConfig,
        provider: Arc<dyn ModelProvider>,
        flags: Arc<dyn FlagSetRepository>,
    ) -> Result<Self, PromptError> {
        let compiler = Arc::new(PromptCompiler::new()?);
        let ledger = Arc::new(BudgetLedger::new(config.budget.daily_token_limit));
        let gateway = Arc::new(ModelGateway::new(
            provider,
            config.provider.model.clone(),
            Duration::from_secs(config.gateway.sync_timeout_secs),
            Duration::from_secs(config.gateway.idle_timeout_secs),
            RetryPolicy::new(
                config.gateway.max_retries,
                Duration::from_millis(config.gateway.backoff_ms),
            ),
        ));
        let chat = ChatSessionManager::new(
            Arc::clone(&ledger),
            Arc::clone(&gateway),
            Arc::clone(&compiler),
            config.chat.context_window,
            config.chat.max_output_tokens,
        );
        Ok(Self {
            compiler,
            cache: ResponseCache::new(),
            ledger,
            gateway,
            flags,
            chat,
            cache_ttl: Duration::from_secs(config.cache.ttl_secs),
            max_output_tokens: config.chat.max_output_tokens,
            model_version: config.provider.model.clone(),
        })
    }

    pub async fn recommend_products(
        &self,
        user: &UserId,
        profile: &ClientProfile,
        candidates: &[CandidateProduct],
    ) -> Result<Recommendations, AiError> {
        let prompt = self.compiler.recommend(profile, candidates).map_err(AiError::internal)?;
        info!(
            event_name = "ai.recommend.start",
            user_id = %user.0,
            fingerprint = %prompt.fingerprint.0,
            "product recommendation requested"
        );
        match self.run_cached(user, prompt).await? {
            FeatureResult::Recommendations(result) => Ok(result),
            _ => Err(payload_mismatch()),
        }
    }

    /// Runs the suitability judgment (cached like any feature), then always
    /// persists a fresh flag set, superseding the prior one for the same
    /// application. The judgment is cacheable; the workflow state is not.
    pub async fn check_suitability(
        &self,
        user: &UserId,
        application: &ApplicationSnapshot,
        product: &CandidateProduct,
    ) -> Result<SuitabilityFlagSet, AiError> {
        let prompt = self.compiler.suitability(application, product).map_err(AiError::internal)?;
        info!(
            event_name = "ai.suitability.start",
            user_id = %user.0,
            application_id = %application.application_id,
            "suitability check requested"
        );
        let report = match self.run_cached(user, prompt).await? {
            FeatureResult::Suitability(report) => report,
            _ => return Err(payload_mismatch()),
        };
        let set = self
            .flags
            .create_flag_set(
                &ApplicationId(application.application_id.clone()),
                report.flags,
                &self.model_version,
            )
            .await
            .map_err(AiError::store)?;
        info!(
            event_name = "ai.suitability.flag_set_created",
            application_id = %application.application_id,
            flag_set_id = %set.id.0,
            items = set.items.len(),
            "flag set persisted"
        );
        Ok(set)
    }

    /// Idempotent: acknowledging an already-acknowledged item returns the
    /// existing acknowledgment unchanged.
    pub async fn acknowledge_flag(
        &self,
        flag_set_id: &FlagSetId,
        item_id: &str,
        override_reason: &str,
        acknowledged_by: &str,
    ) -> Result<FlagItem, AiError> {
        let outcome = self
            .flags
            .acknowledge(flag_set_id, item_id, override_reason, acknowledged_by)
            .await
            .map_err(AiError::store)?;
        match outcome {
            AcknowledgeOutcome::Acknowledged(item) => Ok(item),
            AcknowledgeOutcome::AlreadyAcknowledged(item) => Ok(item),
            AcknowledgeOutcome::SetNotFound => {
                Err(AiError::not_found("flag set", &flag_set_id.0))
            }
            AcknowledgeOutcome::ItemNotFound => Err(AiError::not_found("flag item", item_id)),
        }
    }

    pub async fn current_flag_set(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Option<SuitabilityFlagSet>, AiError> {
        self.flags.current_for_application(application_id).await.map_err(AiError::store)
    }

    /// Hard gate for the external submission workflow.
    pub async fn all_acknowledged(&self, flag_set_id: &FlagSetId) -> Result<bool, AiError> {
        let set = self
            .flags
            .find_by_id(flag_set_id)
            .await
            .map_err(AiError::store)?
            .ok_or_else(|| AiError::not_found("flag set", &flag_set_id.0))?;
        Ok(set.all_acknowledged())
    }

    pub async fn extract_document(
        &self,
        user: &UserId,
        document: &DocumentText,
    ) -> Result<ExtractedFields, AiError> {
        let prompt = self.compiler.extraction(document).map_err(AiError::internal)?;
        match self.run_cached(user, prompt).await? {
            FeatureResult::Extraction(result) => Ok(result),
            _ => Err(payload_mismatch()),
        }
    }

    pub async fn explain_quote(
        &self,
        user: &UserId,
        quote: &QuoteSnapshot,
    ) -> Result<Explanation, AiError> {
        let prompt = self.compiler.explain(quote).map_err(AiError::internal)?;
        match self.run_cached(user, prompt).await? {
            FeatureResult::Explanation(result) => Ok(result),
            _ => Err(payload_mismatch()),
        }
    }

    pub async fn start_chat(&self, user: &UserId, context: &str) -> SessionId {
        self.chat.start_session(user, context).await
    }

    pub async fn send_chat_message(
        &self,
        session_id: &SessionId,
        user: &UserId,
        text: &str,
        page_context: &str,
    ) -> Result<ChatStream, AiError> {
        self.chat.send_message(session_id, user, text, page_context).await
    }

    pub async fn chat_history(
        &self,
        session_id: &SessionId,
        user: &UserId,
    ) -> Result<Vec<ChatMessage>, AiError> {
        self.chat.history(session_id, user).await
    }

    pub async fn clear_chat(&self, session_id: &SessionId, user: &UserId) -> Result<(), AiError> {
        self.chat.clear_session(session_id, user).await
    }

    /// Surfaced for display; never consulted for enforcement, which happens
    /// inside `reserve`.
    pub async fn remaining_today(&self, user: &UserId) -> u64 {
        self.ledger.remaining_today(user).await
    }

    async fn run_cached(
        &self,
        user: &UserId,
        prompt: CompiledPrompt,
    ) -> Result<FeatureResult, AiError> {
        self.cache
            .get_or_compute(&prompt.fingerprint, self.cache_ttl, || {
                self.compute_feature(user, &prompt)
            })
            .await
    }

    /// The budgeted leg of the pipeline: reserve -> invoke -> validate ->
    /// commit. Runs only for cache leaders; waiters and cache hits never
    /// reach this method.
    async fn compute_feature(
        &self,
        user: &UserId,
        prompt: &CompiledPrompt,
    ) -> Result<FeatureResult, AiError> {
        let estimate = estimate_request_tokens(&prompt.text, self.max_output_tokens);
        let mut reservation = match self.ledger.reserve(user, estimate).await {
            ReserveOutcome::Allowed(reservation) => reservation,
            ReserveOutcome::Denied { remaining } => {
                info!(
                    event_name = "ai.budget.denied",
                    user_id = %user.0,
                    estimate,
                    remaining,
                    "reservation denied, no upstream call made"
                );
                return Err(AiError::BudgetExceeded { remaining });
            }
        };

        let mut repair_attempted = false;
        loop {
            let response = match self.gateway.invoke(&prompt.text, self.max_output_tokens).await {
                Ok(response) => response,
                Err(error) => {
                    // Unrecoverable after the gateway's own retry: the full
                    // estimate stays charged so failing requests cannot be
                    // used to bypass the budget.
                    self.ledger.commit_failure(reservation).await;
                    return Err(error);
                }
            };
            self.ledger.commit(reservation, response.usage.total()).await;

            match validate(prompt.feature, &response.text) {
                Ok(result) => return Ok(result),
                Err(failure) if !repair_attempted => {
                    warn!(
                        event_name = "ai.validate.repair_retry",
                        feature = prompt.feature.tag(),
                        detail = %failure,
                        "malformed output, re-invoking once with identical input"
                    );
                    repair_attempted = true;
                    // The repair retry is a fresh call and needs its own
                    // reservation; the first call's usage is already
                    // committed above.
                    reservation = match self.ledger.reserve(user, estimate).await {
                        ReserveOutcome::Allowed(reservation) => reservation,
                        ReserveOutcome::Denied { remaining } => {
                            return Err(AiError::BudgetExceeded { remaining })
                        }
                    };
                }
                Err(failure) => return Err(AiError::Validation(failure.to_string())),
            }
        }
    }
}

fn payload_mismatch() -> AiError {
    AiError::Validation("cached payload does not match the requested feature".to_owned())
}
