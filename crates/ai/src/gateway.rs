//! Model gateway: the only component allowed to block for externally-bound
//! time. Wraps a pluggable provider with a hard deadline for sync calls, a
//! per-delta idle deadline for streams, and an explicit retry policy.
//!
//! Streams are never auto-retried once opened: by the time a delta has been
//! delivered, a consumer may already have rendered partial output, so failure
//! surfaces as a terminal stream error and the retry decision stays with the
//! caller.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::time::{sleep, timeout};

use advisor_core::domain::budget::TokenUsage;
use advisor_core::errors::AiError;

/// Provider-level failure classification. Transient covers network errors,
/// timeouts and 5xx/429 responses; Permanent covers auth failures and
/// removed models, which retrying can only repeat.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("permanent provider failure: {0}")]
    Permanent(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// One element of a delta stream: incremental text, then exactly one final
/// usage report on clean completion.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Done(TokenUsage),
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(
        &self,
        model_id: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<ModelResponse, ProviderError>;

    async fn complete_stream(
        &self,
        model_id: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<DeltaStream, ProviderError>;
}

/// Retry behavior as an explicit, independently testable object.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self { max_retries, base_delay }
    }

    pub fn no_retry() -> Self {
        Self { max_retries: 0, base_delay: Duration::ZERO }
    }

    pub fn is_retryable(&self, error: &ProviderError) -> bool {
        matches!(error, ProviderError::Transient(_))
    }

    /// Exponential: base, 2x base, 4x base, ...
    pub fn backoff_delay(&self, completed_attempts: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(completed_attempts)
    }
}

pub struct ModelGateway {
    provider: Arc<dyn ModelProvider>,
    model_id: String,
    sync_timeout: Duration,
    idle_timeout: Duration,
    retry: RetryPolicy,
}

impl ModelGateway {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        model_id: impl Into<String>,
        sync_timeout: Duration,
        idle_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self { provider, model_id: model_id.into(), sync_timeout, idle_timeout, retry }
    }

    /// Sync call under a hard deadline. Transient failures (including the
    /// deadline itself) are retried per policy with backoff; permanent
    /// failures and exhausted retries surface as typed errors.
    pub async fn invoke(&self, prompt: &str, max_tokens: u32) -> Result<ModelResponse, AiError> {
        let mut completed_attempts = 0;
        loop {
            let call = self.provider.complete(&self.model_id, prompt, max_tokens);
            let failure = match timeout(self.sync_timeout, call).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(error)) => error,
                Err(_) => ProviderError::Transient(format!(
                    "call exceeded {}s deadline",
                    self.sync_timeout.as_secs()
                )),
            };

            if let ProviderError::Permanent(detail) = &failure {
                return Err(AiError::UpstreamPermanent(detail.clone()));
            }
            if completed_attempts >= self.retry.max_retries || !self.retry.is_retryable(&failure) {
                return Err(AiError::UpstreamUnavailable(failure.to_string()));
            }
            sleep(self.retry.backoff_delay(completed_attempts)).await;
            completed_attempts += 1;
        }
    }

    /// Opens a delta stream. Only the connection phase is retryable; once the
    /// stream exists, every failure is terminal for that stream.
    pub async fn open_stream(
        &self,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<GatewayStream, AiError> {
        let mut completed_attempts = 0;
        loop {
            let open = self.provider.complete_stream(&self.model_id, prompt, max_tokens);
            let failure = match timeout(self.sync_timeout, open).await {
                Ok(Ok(inner)) => {
                    return Ok(GatewayStream { inner, idle_timeout: self.idle_timeout })
                }
                Ok(Err(error)) => error,
                Err(_) => ProviderError::Transient(format!(
                    "stream open exceeded {}s deadline",
                    self.sync_timeout.as_secs()
                )),
            };

            if let ProviderError::Permanent(detail) = &failure {
                return Err(AiError::UpstreamPermanent(detail.clone()));
            }
            if completed_attempts >= self.retry.max_retries || !self.retry.is_retryable(&failure) {
                return Err(AiError::UpstreamUnavailable(failure.to_string()));
            }
            sleep(self.retry.backoff_delay(completed_attempts)).await;
            completed_attempts += 1;
        }
    }
}

/// An open delta stream with the per-delta idle deadline applied.
pub struct GatewayStream {
    inner: DeltaStream,
    idle_timeout: Duration,
}

impl GatewayStream {
    /// `Ok(None)` means the provider closed the stream without a final usage
    /// report; callers treat that as an upstream failure.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>, AiError> {
        match timeout(self.idle_timeout, self.inner.next()).await {
            Err(_) => {
                Err(AiError::StreamStalled { idle_secs: self.idle_timeout.as_secs() })
            }
            Ok(None) => Ok(None),
            Ok(Some(Ok(event))) => Ok(Some(event)),
            Ok(Some(Err(ProviderError::Transient(detail)))) => {
                Err(AiError::UpstreamUnavailable(detail))
            }
            Ok(Some(Err(ProviderError::Permanent(detail)))) => {
                Err(AiError::UpstreamPermanent(detail))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream;
    use futures::StreamExt;

    use advisor_core::domain::budget::TokenUsage;
    use advisor_core::errors::AiError;

    use super::{
        DeltaStream, ModelGateway, ModelProvider, ModelResponse, ProviderError, RetryPolicy,
        StreamEvent,
    };

    /// Scripted provider: pops one canned outcome per call.
    struct ScriptedProvider {
        responses: std::sync::Mutex<Vec<Result<ModelResponse, ProviderError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(mut responses: Vec<Result<ModelResponse, ProviderError>>) -> Self {
            responses.reverse();
            Self { responses: std::sync::Mutex::new(responses), calls: AtomicUsize::new(0) }
        }

        fn ok(text: &str) -> Result<ModelResponse, ProviderError> {
            Ok(ModelResponse {
                text: text.to_owned(),
                usage: TokenUsage { input_tokens: 10, output_tokens: 20 },
            })
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
            unimplemented!("not used in these tests")
        }
    }

    fn gateway(provider: Arc<ScriptedProvider>, retries: u32) -> ModelGateway {
        ModelGateway::new(
            provider,
            "advisor-test",
            Duration::from_millis(200),
            Duration::from_millis(50),
            RetryPolicy::new(retries, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once_then_succeeds() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::Transient("503".to_owned())),
            ScriptedProvider::ok("second try"),
        ]));
        let result = gateway(Arc::clone(&provider), 1).invoke("prompt", 100).await.unwrap();
        assert_eq!(result.text, "second try");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_never_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::Permanent("model removed".to_owned())),
            ScriptedProvider::ok("unreachable"),
        ]));
        let error = gateway(Arc::clone(&provider), 1).invoke("prompt", 100).await.unwrap_err();
        assert!(matches!(error, AiError::UpstreamPermanent(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_unavailable() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::Transient("503".to_owned())),
            Err(ProviderError::Transient("503 again".to_owned())),
        ]));
        let error = gateway(Arc::clone(&provider), 1).invoke("prompt", 100).await.unwrap_err();
        assert!(matches!(error, AiError::UpstreamUnavailable(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
    }

    struct StallingProvider;

    #[async_trait]
    impl ModelProvider for StallingProvider {
        async fn complete(
            &self,
            _model_id: &str,
            _prompt: &str,
            _max_tokens: u32,
        ) -> Result<ModelResponse, ProviderError> {
            unimplemented!("not used in these tests")
        }

        async fn complete_stream(
            &self,
            _model_id: &str,
            _prompt: &str,
            _max_tokens: u32,
        ) -> Result<DeltaStream, ProviderError> {
            // One delta, then silence forever.
            let first = stream::iter(vec![Ok(StreamEvent::Delta("partial".to_owned()))]);
            Ok(Box::pin(first.chain(stream::pending())))
        }
    }

    #[tokio::test]
    async fn silent_stream_stalls_with_typed_error() {
        let gateway = ModelGateway::new(
            Arc::new(StallingProvider),
            "advisor-test",
            Duration::from_millis(200),
            Duration::from_millis(30),
            RetryPolicy::no_retry(),
        );
        let mut stream = gateway.open_stream("prompt", 100).await.unwrap();

        let first = stream.next_event().await.unwrap();
        assert_eq!(first, Some(StreamEvent::Delta("partial".to_owned())));

        let stalled = stream.next_event().await.unwrap_err();
        assert_eq!(stalled, AiError::StreamStalled { idle_secs: 0 });
    }
}
