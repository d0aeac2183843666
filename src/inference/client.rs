//! OpenAI-compatible inference client.
//!
//! Sends streaming chat completion requests to a local LLM endpoint
//! (llama.cpp, Ollama, vLLM, LM Studio) and hands the SSE body to the frame
//! parser.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;

use super::config::EndpointConfig;
use super::errors::InferenceError;
use super::frames::delta_stream;
use super::streamer::{ChatBackend, CompletionRequest, DeltaStream};
use super::types::ChatCompletionRequest;

/// Timeout for the lightweight `/models` probe.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for one OpenAI-compatible endpoint.
pub struct InferenceClient {
    http: HttpClient,
    endpoint: EndpointConfig,
}

impl InferenceClient {
    /// Build a client. Does NOT check connectivity; that happens on the first
    /// request or via [`health_check`](Self::health_check).
    pub fn new(endpoint: EndpointConfig) -> Result<Self, InferenceError> {
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(endpoint.connect_timeout_secs))
            .timeout(Duration::from_secs(endpoint.request_timeout_secs))
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: endpoint.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { http, endpoint })
    }

    pub fn base_url(&self) -> &str {
        &self.endpoint.base_url
    }

    pub fn model_name(&self) -> &str {
        &self.endpoint.model
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.base_url.trim_end_matches('/'))
    }

    /// Wire body for one streaming request.
    fn build_body(&self, request: &CompletionRequest) -> ChatCompletionRequest {
        let tools = (!request.tools.is_empty()).then(|| request.tools.clone());
        ChatCompletionRequest {
            model: self.endpoint.model.clone(),
            messages: request.messages.clone(),
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
            temperature: self.endpoint.temperature,
            max_tokens: self.endpoint.max_tokens,
            stream: true,
        }
    }

    /// Check if the endpoint is reachable. Does not consume inference tokens.
    pub async fn health_check(&self) -> Result<bool, InferenceError> {
        let url = format!("{}/models", self.endpoint.base_url.trim_end_matches('/'));
        let mut req = self.http.get(&url).timeout(HEALTH_CHECK_TIMEOUT);
        if let Some(ref key) = self.endpoint.api_key {
            req = req.bearer_auth(key);
        }

        match req.send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "health check failed");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl ChatBackend for InferenceClient {
    async fn open_stream(&self, request: &CompletionRequest) -> Result<DeltaStream, InferenceError> {
        let url = self.completions_url();
        let body = self.build_body(request);

        // Metadata only; the body can be huge.
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            max_tokens = body.max_tokens,
            "=== LLM REQUEST ==="
        );

        let mut req = self
            .http
            .post(&url)
            .json(&body)
            .header("Accept", "text/event-stream");
        if let Some(ref key) = self.endpoint.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: self.endpoint.request_timeout_secs,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), body = %body_text, "LLM request rejected");
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        Ok(delta_stream(Box::pin(response.bytes_stream())).boxed())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
