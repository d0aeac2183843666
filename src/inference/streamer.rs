//! One streamed chat completion, end to end.
//!
//! Opens the stream (retrying transient failures before any byte arrives),
//! pumps every delta through the reasoning splitter and the tool-call
//! accumulator into a [`PartsAssembler`], and reports snapshots and timing
//! events as it goes. Once bytes have been streamed nothing is retried.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent_core::timing::TimingObserver;

use super::accumulator::ToolCallAccumulator;
use super::config::{ReasoningConfig, RetryPolicy};
use super::errors::InferenceError;
use super::parts::{MessagePart, PartEvent, PartsAssembler};
use super::reasoning::{ReasoningSplitter, Segment};
use super::types::{ChatMessage, Delta, FinishReason, ToolCall, ToolDefinition};

/// Normalized deltas of one response.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<Delta, InferenceError>> + Send>>;

/// What a single streaming call sends.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// Anything that can turn a request into a stream of deltas.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn open_stream(&self, request: &CompletionRequest) -> Result<DeltaStream, InferenceError>;
}

/// Per-call knobs and collaborators.
pub struct StreamContext<'a> {
    /// Transcript id of the assistant message being streamed.
    pub message_id: &'a str,
    pub cancel: &'a CancellationToken,
    pub timing: &'a dyn TimingObserver,
    pub retry: RetryPolicy,
    pub idle_timeout: Duration,
    pub reasoning: &'a ReasoningConfig,
}

/// Everything one streamed response produced.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub parts: Vec<MessagePart>,
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<FinishReason>,
}

/// Stream one completion into `assembler`, calling `on_update` with the full
/// parts snapshot after every delta.
///
/// On error or cancellation the assembler keeps whatever was streamed so far;
/// the caller decides how to render it.
pub async fn stream_completion<F>(
    backend: &dyn ChatBackend,
    request: &CompletionRequest,
    ctx: &StreamContext<'_>,
    assembler: &mut PartsAssembler,
    on_update: F,
) -> Result<CompletionResult, InferenceError>
where
    F: FnMut(&[MessagePart]),
{
    let result = run_stream(backend, request, ctx, assembler, on_update).await;
    ctx.timing.end_of_message(ctx.message_id);
    result
}

async fn run_stream<F>(
    backend: &dyn ChatBackend,
    request: &CompletionRequest,
    ctx: &StreamContext<'_>,
    assembler: &mut PartsAssembler,
    mut on_update: F,
) -> Result<CompletionResult, InferenceError>
where
    F: FnMut(&[MessagePart]),
{
    let mut stream = open_with_retry(backend, request, ctx).await?;

    let mut splitter =
        ReasoningSplitter::new(ctx.reasoning.open_tag.as_str(), ctx.reasoning.close_tag.as_str());
    let mut accumulator = ToolCallAccumulator::new();
    let mut tool_parts = ToolPartIds::default();
    let mut finish_reason = None;
    let mut delta_count = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(InferenceError::Cancelled),
            item = tokio::time::timeout(ctx.idle_timeout, stream.next()) => match item {
                Ok(item) => item,
                Err(_) => {
                    tracing::warn!(
                        message_id = ctx.message_id,
                        idle_secs = ctx.idle_timeout.as_secs(),
                        "stream stalled"
                    );
                    return Err(InferenceError::Timeout {
                        duration_secs: ctx.idle_timeout.as_secs(),
                    });
                }
            },
        };

        let Some(item) = next else { break };
        let delta = item?;
        delta_count += 1;

        if let Some(ref reason) = delta.finish_reason {
            finish_reason = Some(reason.clone());
        }

        for segment in splitter.feed(&delta) {
            apply_segment(assembler, ctx, segment);
        }

        for fragment in &delta.tool_calls {
            accumulator.push(fragment);
            if let Some(call) = accumulator.get(fragment.index) {
                let part_id = tool_parts.pin(fragment.index, &call.id);
                assembler.upsert_tool_call(&part_id, &call.function_name, &call.arguments_text, None);
            }
        }

        on_update(&assembler.snapshot());
    }

    for segment in splitter.flush() {
        apply_segment(assembler, ctx, segment);
    }

    let mut tool_calls = Vec::with_capacity(accumulator.len());
    for (index, call) in accumulator.snapshot() {
        let part_id = tool_parts.pin(index, &call.id);
        let id = if call.id.is_empty() || call.id == part_id || tool_parts.is_taken(&call.id) {
            part_id.clone()
        } else {
            assembler.rekey_tool_call(&part_id, &call.id);
            tool_parts.rekey(index, &call.id);
            call.id.clone()
        };

        let arguments = parse_arguments(&call.arguments_text);
        if arguments.is_none() {
            tracing::debug!(
                tool = %call.function_name,
                args_len = call.arguments_text.len(),
                "tool arguments are not valid JSON"
            );
        }
        assembler.upsert_tool_call(&id, &call.function_name, &call.arguments_text, arguments.clone());

        tool_calls.push(ToolCall {
            id,
            name: call.function_name,
            arguments_text: call.arguments_text,
            arguments,
        });
    }

    let parts = assembler.snapshot();
    on_update(&parts);

    tracing::debug!(
        message_id = ctx.message_id,
        deltas = delta_count,
        tool_calls = tool_calls.len(),
        finish_reason = finish_reason.as_ref().map(|r| r.as_str()).unwrap_or("none"),
        "stream complete"
    );

    Ok(CompletionResult {
        text: assembler.text().to_string(),
        parts,
        tool_calls,
        finish_reason,
    })
}

/// Open the stream, retrying transient failures with exponential backoff.
async fn open_with_retry(
    backend: &dyn ChatBackend,
    request: &CompletionRequest,
    ctx: &StreamContext<'_>,
) -> Result<DeltaStream, InferenceError> {
    let mut attempt = 0u32;
    loop {
        let opened = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(InferenceError::Cancelled),
            opened = backend.open_stream(request) => opened,
        };

        match opened {
            Ok(stream) => return Ok(stream),
            Err(e) if e.is_transient() && attempt < ctx.retry.max_retries => {
                let delay = ctx.retry.delay_for(attempt);
                attempt += 1;
                tracing::warn!(
                    attempt,
                    max_retries = ctx.retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient inference error, retrying"
                );
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(InferenceError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn apply_segment(assembler: &mut PartsAssembler, ctx: &StreamContext<'_>, segment: Segment) {
    match assembler.apply(segment) {
        PartEvent::Reasoning => ctx.timing.reasoning_started(ctx.message_id),
        PartEvent::Boundary => ctx.timing.boundary_reached(ctx.message_id),
        PartEvent::Ignored => {}
    }
}

/// Arguments as JSON. Blank text means "no arguments".
fn parse_arguments(text: &str) -> Option<serde_json::Value> {
    if text.trim().is_empty() {
        return Some(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(text).ok()
}

/// Fresh id for a tool call the server did not name.
pub fn generate_call_id() -> String {
    format!("call_{}", Uuid::new_v4())
}

/// Part ids per stream index, pinned the first time an index is seen.
#[derive(Debug, Default)]
struct ToolPartIds {
    by_index: HashMap<u32, String>,
    taken: HashSet<String>,
}

impl ToolPartIds {
    fn pin(&mut self, index: u32, server_id: &str) -> String {
        if let Some(id) = self.by_index.get(&index) {
            return id.clone();
        }
        let id = if server_id.is_empty() || self.taken.contains(server_id) {
            generate_call_id()
        } else {
            server_id.to_string()
        };
        self.taken.insert(id.clone());
        self.by_index.insert(index, id.clone());
        id
    }

    fn is_taken(&self, id: &str) -> bool {
        self.taken.contains(id)
    }

    fn rekey(&mut self, index: u32, new_id: &str) {
        if let Some(old) = self.by_index.insert(index, new_id.to_string()) {
            self.taken.remove(&old);
        }
        self.taken.insert(new_id.to_string());
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
