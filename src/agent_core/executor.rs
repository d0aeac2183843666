//! Executes one iteration's batch of tool calls.
//!
//! Calls run with bounded concurrency and come back in the order the model
//! produced them. Each call gets a timeout; transient failures are retried
//! with exponential backoff, permanent ones are returned at once as error
//! results for the model to read.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::inference::config::{AgentSettings, RetryPolicy};
use crate::inference::types::ToolCall;

use super::errors::ToolError;
use super::memory::truncate_chars;
use super::registry::{ToolInvocation, ToolRegistry};

/// Outcome of one tool call.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub call: ToolCall,
    pub ok: bool,
    /// Serialized success value or the error message, size-capped.
    pub content: String,
    /// Structured result for the transcript part.
    pub value: serde_json::Value,
    pub error: Option<ToolError>,
    /// Registry invocations made (0 when rejected before dispatch).
    pub attempts: u32,
}

/// Runs tool calls against a shared registry.
pub struct ToolExecutor {
    registry: Arc<dyn ToolRegistry>,
    concurrency: usize,
    timeout: Duration,
    retry: RetryPolicy,
    max_result_chars: usize,
}

impl ToolExecutor {
    pub fn new(registry: Arc<dyn ToolRegistry>, settings: &AgentSettings) -> Self {
        Self {
            registry,
            concurrency: settings.tool_concurrency.max(1),
            timeout: settings.tool_timeout(),
            retry: settings.tool_retry,
            max_result_chars: settings.context.max_tool_result_chars,
        }
    }

    /// Execute every call; results are in the same order as `calls`.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Vec<ToolExecution> {
        stream::iter(calls.iter().cloned())
            .map(|call| self.execute_one(call, cancel))
            .buffered(self.concurrency)
            .collect()
            .await
    }

    async fn execute_one(&self, call: ToolCall, cancel: &CancellationToken) -> ToolExecution {
        let start = Instant::now();
        let (result, attempts) = if call.arguments.is_none() {
            let err = ToolError::InvalidArguments {
                tool: call.name.clone(),
                reason: "arguments are not valid JSON".into(),
            };
            (Err(err), 0)
        } else {
            self.invoke_with_retry(&ToolInvocation::from(&call), cancel)
                .await
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(value) => {
                tracing::info!(tool = %call.name, call_id = %call.id, attempts, elapsed_ms, "tool call succeeded");
                let content = self.cap(&render_value(&value));
                ToolExecution {
                    call,
                    ok: true,
                    content,
                    value,
                    error: None,
                    attempts,
                }
            }
            Err(e) => {
                tracing::warn!(tool = %call.name, call_id = %call.id, attempts, elapsed_ms, error = %e, "tool call failed");
                let content = self.cap(&format!("Error: {e}"));
                ToolExecution {
                    call,
                    ok: false,
                    value: serde_json::Value::String(content.clone()),
                    content,
                    error: Some(e),
                    attempts,
                }
            }
        }
    }

    async fn invoke_with_retry(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> (Result<serde_json::Value, ToolError>, u32) {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ToolError::Cancelled),
                outcome = tokio::time::timeout(self.timeout, self.registry.execute(invocation)) => {
                    outcome.unwrap_or_else(|_| Err(ToolError::Timeout {
                        tool: invocation.name.clone(),
                        duration_secs: self.timeout.as_secs(),
                    }))
                }
            };

            match result {
                Err(e) if e.is_transient() && attempts <= self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempts - 1);
                    tracing::warn!(
                        tool = %invocation.name,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient tool error, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return (Err(ToolError::Cancelled), attempts),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return (other, attempts),
            }
        }
    }

    fn cap(&self, content: &str) -> String {
        let marker = format!("\n…[truncated to {} chars]", self.max_result_chars);
        truncate_chars(content, self.max_result_chars, &marker)
    }
}

/// Strings verbatim, everything else as compact JSON.
pub(crate) fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
