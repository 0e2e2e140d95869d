//! End-to-end orchestration scenarios against a scripted provider: caching
//! and coalescing, budget enforcement, the single repair retry, and the
//! suitability acknowledgment workflow.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use advisor_ai::gateway::{
    DeltaStream, ModelProvider, ModelResponse, ProviderError, StreamEvent,
};
use advisor_ai::{AiOrchestrator, ChatEvent};
use advisor_core::config::AiConfig;
use advisor_core::domain::budget::TokenUsage;
use advisor_core::domain::feature::{
    ApplicationSnapshot, CandidateProduct, ClientProfile, DocumentText, RiskTolerance,
};
use advisor_core::domain::suitability::Severity;
use advisor_core::domain::{ApplicationId, ProductId, UserId};
use advisor_core::errors::AiError;
use advisor_db::{FlagSetRepository, InMemoryFlagSetRepository};

/// Pops one canned outcome per sync call; streams a fixed reply. The latency
/// on sync calls keeps coalescing tests deterministic.
struct ScriptedProvider {
    responses: Mutex<Vec<Result<ModelResponse, ProviderError>>>,
    stream_reply: String,
    latency: Duration,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(mut responses: Vec<Result<ModelResponse, ProviderError>>) -> Arc<Self> {
        responses.reverse();
        Arc::new(Self {
            responses: Mutex::new(responses),
            stream_reply: "the premium reflects the selected term".to_owned(),
            latency: Duration::from_millis(30),
            calls: AtomicUsize::new(0),
        })
    }

    fn ok(text: &str) -> Result<ModelResponse, ProviderError> {
        Ok(ModelResponse {
            text: text.to_owned(),
            usage: TokenUsage { input_tokens: 100, output_tokens: 50 },
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn complete(
        &self,
        _model_id: &str,
        _prompt: &str,
        _max_tokens: u32,
    ) -> Result<ModelResponse, ProviderError> {
        tokio::time::sleep(self.latency).await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Err(ProviderError::Transient("script exhausted".to_owned())))
    }

    async fn complete_stream(
        &self,
        _model_id: &str,
        _prompt: &str,
        _max_tokens: u32,
    ) -> Result<DeltaStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let chunks: Vec<String> =
            self.stream_reply.split_inclusive(' ').map(str::to_owned).collect();
        Ok(Box::pin(async_stream::stream! {
            for chunk in chunks {
                yield Ok(StreamEvent::Delta(chunk));
            }
            yield Ok(StreamEvent::Done(TokenUsage { input_tokens: 60, output_tokens: 20 }));
        }))
    }
}

fn orchestrator(
    provider: Arc<ScriptedProvider>,
    daily_token_limit: u64,
) -> (AiOrchestrator, Arc<InMemoryFlagSetRepository>) {
    let mut config = AiConfig::default();
    config.budget.daily_token_limit = daily_token_limit;
    config.gateway.backoff_ms = 1;
    let flags = Arc::new(InMemoryFlagSetRepository::default());
    let orch = AiOrchestrator::new(
        &config,
        provider,
        Arc::clone(&flags) as Arc<dyn FlagSetRepository>,
    )
    .unwrap();
    (orch, flags)
}

fn profile() -> ClientProfile {
    ClientProfile {
        client_id: "c-77".to_owned(),
        age: 38,
        annual_income: Decimal::new(92_000, 0),
        risk_tolerance: RiskTolerance::Balanced,
        investment_horizon_years: 20,
        objectives: vec!["retirement".to_owned()],
    }
}

fn candidates() -> Vec<CandidateProduct> {
    vec![
        CandidateProduct {
            product_id: ProductId("fund-a".to_owned()),
            name: "Growth Fund A".to_owned(),
            category: "equity".to_owned(),
            risk_rating: 4,
            minimum_investment: Decimal::new(5_000, 0),
        },
        CandidateProduct {
            product_id: ProductId("bond-b".to_owned()),
            name: "Income Bond B".to_owned(),
            category: "fixed income".to_owned(),
            risk_rating: 2,
            minimum_investment: Decimal::new(1_000, 0),
        },
    ]
}

fn application() -> ApplicationSnapshot {
    let mut fields = BTreeMap::new();
    fields.insert("annual_income".to_owned(), serde_json::json!(92_000));
    fields.insert("risk_tolerance".to_owned(), serde_json::json!("balanced"));
    ApplicationSnapshot {
        application_id: "app-31".to_owned(),
        client_id: "c-77".to_owned(),
        fields,
    }
}

const RECOMMEND_JSON: &str = r#"{"items": [
    {"product_id": "fund-a", "rank": 1, "rationale": "matches the 20 year horizon"},
    {"product_id": "bond-b", "rank": 2, "rationale": "stabilizes the allocation"}
]}"#;

const SUITABILITY_JSON: &str = r#"{"passed": false, "flags": [
    {"item_id": "income-mismatch", "field": "annual_income",
     "severity": "blocking", "issue": "stated income exceeds documented income",
     "suggestion": "request updated payslips"},
    {"item_id": "horizon-note", "field": "investment_horizon",
     "severity": "advisory", "issue": "horizon is near the product maximum",
     "suggestion": "confirm retirement date"}
]}"#;

const EXTRACTION_JSON: &str =
    r#"{"fields": {"name": "Jane Doe", "dob": "1980-01-01"}, "confidence": "high", "requires_review": false}"#;

#[tokio::test]
async fn identical_inputs_are_served_from_cache() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::ok(RECOMMEND_JSON)]);
    let (orch, _) = orchestrator(Arc::clone(&provider), 50_000);
    let user = UserId("adviser-1".to_owned());

    let first = orch.recommend_products(&user, &profile(), &candidates()).await.unwrap();
    let second = orch.recommend_products(&user, &profile(), &candidates()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.items[0].product_id, ProductId("fund-a".to_owned()));
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn changed_input_misses_the_cache() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::ok(RECOMMEND_JSON),
        ScriptedProvider::ok(RECOMMEND_JSON),
    ]);
    let (orch, _) = orchestrator(Arc::clone(&provider), 50_000);
    let user = UserId("adviser-1".to_owned());

    orch.recommend_products(&user, &profile(), &candidates()).await.unwrap();
    let mut older = profile();
    older.age = 39;
    orch.recommend_products(&user, &older, &candidates()).await.unwrap();

    assert_eq!(provider.call_count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn simultaneous_identical_requests_coalesce_to_one_upstream_call() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::ok(RECOMMEND_JSON)]);
    let (orch, _) = orchestrator(Arc::clone(&provider), 50_000);
    let orch = Arc::new(orch);

    let mut handles = Vec::new();
    for n in 0..2 {
        let orch = Arc::clone(&orch);
        let user = UserId(format!("adviser-{n}"));
        handles.push(tokio::spawn(async move {
            orch.recommend_products(&user, &profile(), &candidates()).await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn malformed_output_gets_exactly_one_repair_retry() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::ok("I think fund-a looks best."),
        ScriptedProvider::ok(EXTRACTION_JSON),
    ]);
    let (orch, _) = orchestrator(Arc::clone(&provider), 50_000);
    let user = UserId("adviser-1".to_owned());

    let result = orch
        .extract_document(&user, &DocumentText { text: "Name: Jane Doe".to_owned() })
        .await
        .unwrap();
    assert_eq!(result.fields["name"], serde_json::json!("Jane Doe"));
    assert_eq!(provider.call_count(), 2);
}

#[tokio::test]
async fn second_malformed_output_is_a_validation_error() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::ok("not json"),
        ScriptedProvider::ok("still not json"),
    ]);
    let (orch, _) = orchestrator(Arc::clone(&provider), 50_000);
    let user = UserId("adviser-1".to_owned());

    let error = orch
        .extract_document(&user, &DocumentText { text: "Name: Jane Doe".to_owned() })
        .await
        .unwrap_err();
    assert!(matches!(error, AiError::Validation(_)));
    assert_eq!(provider.call_count(), 2);
}

#[tokio::test]
async fn exhausted_budget_blocks_before_any_upstream_call() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::ok(RECOMMEND_JSON)]);
    let (orch, _) = orchestrator(Arc::clone(&provider), 100);
    let user = UserId("adviser-1".to_owned());

    let error = orch.recommend_products(&user, &profile(), &candidates()).await.unwrap_err();
    assert!(matches!(error, AiError::BudgetExceeded { remaining: 100 }));
    assert_eq!(provider.call_count(), 0);
    assert_eq!(orch.remaining_today(&user).await, 100);
}

#[tokio::test]
async fn committed_usage_replaces_the_reservation_estimate() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::ok(RECOMMEND_JSON)]);
    let (orch, _) = orchestrator(Arc::clone(&provider), 50_000);
    let user = UserId("adviser-1".to_owned());

    orch.recommend_products(&user, &profile(), &candidates()).await.unwrap();
    // The scripted response reports 150 actual tokens, well under the
    // reservation estimate.
    assert_eq!(orch.remaining_today(&user).await, 50_000 - 150);
}

#[tokio::test]
async fn upstream_failure_still_charges_the_estimate() {
    let provider = ScriptedProvider::new(vec![
        Err(ProviderError::Transient("503".to_owned())),
        Err(ProviderError::Transient("503 again".to_owned())),
    ]);
    let (orch, _) = orchestrator(Arc::clone(&provider), 50_000);
    let user = UserId("adviser-1".to_owned());

    let error = orch.recommend_products(&user, &profile(), &candidates()).await.unwrap_err();
    assert!(matches!(error, AiError::UpstreamUnavailable(_)));
    // One retry inside the gateway, then failure with the estimate kept.
    assert_eq!(provider.call_count(), 2);
    assert!(orch.remaining_today(&user).await < 50_000);
}

#[tokio::test]
async fn suitability_flags_gate_until_blocking_items_are_acknowledged() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::ok(SUITABILITY_JSON)]);
    let (orch, _) = orchestrator(Arc::clone(&provider), 50_000);
    let user = UserId("adviser-1".to_owned());

    let set = orch
        .check_suitability(&user, &application(), &candidates()[0])
        .await
        .unwrap();
    assert_eq!(set.items.len(), 2);
    assert_eq!(set.items[0].severity, Severity::Blocking);
    assert!(!orch.all_acknowledged(&set.id).await.unwrap());

    let item = orch
        .acknowledge_flag(&set.id, "income-mismatch", "client provided payslips", "adviser-1")
        .await
        .unwrap();
    assert!(item.is_acknowledged());
    // Only blocking items gate; the advisory item stays unacknowledged.
    assert!(orch.all_acknowledged(&set.id).await.unwrap());

    // Re-acknowledging is idempotent and keeps the original reason.
    let repeat = orch
        .acknowledge_flag(&set.id, "income-mismatch", "a different reason", "adviser-2")
        .await
        .unwrap();
    let ack = repeat.acknowledgment.unwrap();
    assert_eq!(ack.override_reason, "client provided payslips");
    assert_eq!(ack.acknowledged_by, "adviser-1");

    let error = orch
        .acknowledge_flag(&set.id, "no-such-item", "reason", "adviser-1")
        .await
        .unwrap_err();
    assert!(matches!(error, AiError::NotFound { .. }));
}

#[tokio::test]
async fn rerun_supersedes_the_prior_flag_set_even_on_a_cache_hit() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::ok(SUITABILITY_JSON)]);
    let (orch, flags) = orchestrator(Arc::clone(&provider), 50_000);
    let user = UserId("adviser-1".to_owned());

    let first = orch
        .check_suitability(&user, &application(), &candidates()[0])
        .await
        .unwrap();
    let second = orch
        .check_suitability(&user, &application(), &candidates()[0])
        .await
        .unwrap();

    // The judgment came from cache, but the workflow state is fresh.
    assert_eq!(provider.call_count(), 1);
    assert_ne!(first.id, second.id);

    let app_id = ApplicationId("app-31".to_owned());
    let current = orch.current_flag_set(&app_id).await.unwrap().unwrap();
    assert_eq!(current.id, second.id);

    let superseded = flags.find_by_id(&first.id).await.unwrap().unwrap();
    assert!(superseded.superseded);
}

#[tokio::test]
async fn chat_round_trip_appends_the_assembled_reply() {
    let provider = ScriptedProvider::new(Vec::new());
    let (orch, _) = orchestrator(Arc::clone(&provider), 50_000);
    let user = UserId("adviser-1".to_owned());

    let session = orch.start_chat(&user, "quote Q-9 for client c-77").await;
    let mut stream = orch
        .send_chat_message(&session, &user, "why is the premium this high?", "quote page")
        .await
        .unwrap();

    let mut assembled = String::new();
    let mut completed = None;
    while let Some(event) = stream.next().await {
        match event {
            ChatEvent::Delta(delta) => assembled.push_str(&delta),
            ChatEvent::Completed { text, usage } => {
                completed = Some((text, usage));
                break;
            }
            ChatEvent::Failed(error) => panic!("unexpected failure: {error}"),
        }
    }

    let (text, usage) = completed.expect("stream must complete");
    assert_eq!(text, "the premium reflects the selected term");
    assert_eq!(text, assembled);
    assert_eq!(usage.total(), 80);

    let history = orch.chat_history(&session, &user).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, text);
    assert_eq!(orch.remaining_today(&user).await, 50_000 - 80);

    orch.clear_chat(&session, &user).await.unwrap();
    let error = orch.chat_history(&session, &user).await.unwrap_err();
    assert!(matches!(error, AiError::NotFound { .. }));
}
