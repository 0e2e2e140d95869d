//! HTTP implementation of [`ModelProvider`].
//!
//! Speaks a small JSON completion protocol: one POST for sync calls, the
//! same endpoint with `"stream": true` for SSE-style line-delimited deltas
//! (`data: {"delta": "..."}` lines, closed by `data: {"usage": {...}}`).

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use advisor_core::domain::budget::TokenUsage;

use crate::gateway::{DeltaStream, ModelProvider, ModelResponse, ProviderError, StreamEvent};

pub struct HttpModelProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct UsageBody {
    input_tokens: u64,
    output_tokens: u64,
}

impl From<UsageBody> for TokenUsage {
    fn from(body: UsageBody) -> Self {
        Self { input_tokens: body.input_tokens, output_tokens: body.output_tokens }
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    text: String,
    usage: UsageBody,
}

#[derive(Deserialize)]
struct StreamLine {
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    usage: Option<UsageBody>,
}

impl HttpModelProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<SecretString>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into(), api_key }
    }

    fn request(
        &self,
        model_id: &str,
        prompt: &str,
        max_tokens: u32,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}/v1/complete", self.base_url))
            .json(&CompletionRequest { model: model_id, prompt, max_tokens, stream });
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }
        builder
    }
}

fn classify_status(status: StatusCode) -> Option<ProviderError> {
    if status.is_success() {
        return None;
    }
    let detail = format!("provider returned {status}");
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Some(ProviderError::Transient(detail))
    } else {
        // Auth failures, unknown model, bad request: retrying repeats the
        // same outcome.
        Some(ProviderError::Permanent(detail))
    }
}

/// Parses one SSE line. `Ok(None)` for blank/comment/`[DONE]` lines.
fn parse_stream_line(line: &str) -> Result<Option<StreamEvent>, ProviderError> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    let parsed: StreamLine = serde_json::from_str(data)
        .map_err(|err| ProviderError::Transient(format!("malformed stream line: {err}")))?;
    if let Some(usage) = parsed.usage {
        return Ok(Some(StreamEvent::Done(usage.into())));
    }
    if let Some(delta) = parsed.delta {
        return Ok(Some(StreamEvent::Delta(delta)));
    }
    Ok(None)
}

#[async_trait::async_trait]
impl ModelProvider for HttpModelProvider {
    async fn complete(
        &self,
        model_id: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<ModelResponse, ProviderError> {
        let response = self
            .request(model_id, prompt, max_tokens, false)
            .send()
            .await
            .map_err(|err| ProviderError::Transient(err.to_string()))?;
        if let Some(error) = classify_status(response.status()) {
            return Err(error);
        }
        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Transient(format!("malformed response body: {err}")))?;
        Ok(ModelResponse { text: body.text, usage: body.usage.into() })
    }

    async fn complete_stream(
        &self,
        model_id: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<DeltaStream, ProviderError> {
        let response = self
            .request(model_id, prompt, max_tokens, true)
            .send()
            .await
            .map_err(|err| ProviderError::Transient(err.to_string()))?;
        if let Some(error) = classify_status(response.status()) {
            return Err(error);
        }

        Ok(decode_stream(response.bytes_stream()))
    }
}

/// Reassembles network chunks into SSE lines and decodes them. Buffering
/// happens at the byte level: a chunk boundary can fall inside a multi-byte
/// UTF-8 sequence, so decoding waits until a full newline-terminated line
/// has accumulated.
fn decode_stream<S, B, E>(chunks: S) -> DeltaStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(try_stream! {
        let mut chunks = Box::pin(chunks);
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|err| ProviderError::Transient(err.to_string()))?;
            buffer.extend_from_slice(chunk.as_ref());
            while let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                if let Some(event) = parse_stream_line(&String::from_utf8_lossy(&line))? {
                    yield event;
                }
            }
        }
        // Trailing data without a newline still counts.
        if let Some(event) = parse_stream_line(&String::from_utf8_lossy(&buffer))? {
            yield event;
        }
    })
}
