//! Loop controller: drives one user turn to a terminal state.
//!
//! Each iteration streams one assistant message, then either finishes the
//! turn (final envelope, or a plain first answer when no tools exist), records
//! a protocol strike, or executes the requested tools and goes around again.
//! Guards stop the loop on repeated answers (stagnation), repeated identical
//! tool batches (tool loop), too many strikes, the iteration cap,
//! cancellation, and streaming failures.
//!
//! The controller never returns an error: every path ends with a renderable
//! transcript and a [`Termination`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::inference::config::{AgentSettings, DEFAULT_STREAM_IDLE_TIMEOUT_SECS};
use crate::inference::errors::InferenceError;
use crate::inference::parts::PartsAssembler;
use crate::inference::streamer::{stream_completion, ChatBackend, CompletionRequest, StreamContext};
use crate::inference::types::{ChatMessage, FinishReason, ToolDefinition};

use super::envelope::{FinalEnvelope, PROTOCOL_REMINDER};
use super::executor::ToolExecutor;
use super::history::{prune, with_working_memory};
use super::memory::{batch_signature, hash_text, ToolDigest, WorkingMemory};
use super::registry::ToolRegistry;
use super::timing::TimingObserver;
use super::transcript::{Transcript, TurnMessage};

// ─── Types ──────────────────────────────────────────────────────────────────

/// Why a turn stopped without success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Stagnation,
    ProtocolViolations,
    ToolLoopDetected,
    MaxIterations,
    Cancelled,
    Failed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Stagnation => write!(f, "stagnation"),
            StopReason::ProtocolViolations => write!(f, "protocol violations"),
            StopReason::ToolLoopDetected => write!(f, "tool loop detected"),
            StopReason::MaxIterations => write!(f, "max iterations"),
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::Failed(msg) => write!(f, "failed: {msg}"),
        }
    }
}

impl StopReason {
    /// Bracketed notice appended to the assistant message.
    pub fn notice(&self, limits: &TurnLimits) -> String {
        match self {
            StopReason::Stagnation => {
                "[Stopped: the model kept repeating the same answer]".to_string()
            }
            StopReason::ProtocolViolations => {
                "[Stopped: the model did not finish with a valid final answer]".to_string()
            }
            StopReason::ToolLoopDetected => {
                "[Stopped: the same tool calls were repeated]".to_string()
            }
            StopReason::MaxIterations => format!(
                "[Truncated: reached the limit of {} iterations]",
                limits.max_iterations
            ),
            StopReason::Cancelled => "[Stopped: cancelled]".to_string(),
            StopReason::Failed(msg) => format!("[Stopped: {msg}]"),
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Success,
    Stopped(StopReason),
}

impl Termination {
    pub fn is_success(&self) -> bool {
        matches!(self, Termination::Success)
    }
}

/// Per-turn caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnLimits {
    pub max_iterations: u32,
    /// Consecutive identical answers tolerated; 0 disables the check.
    pub stagnation_limit: u32,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self::from(&AgentSettings::default())
    }
}

impl From<&AgentSettings> for TurnLimits {
    fn from(settings: &AgentSettings) -> Self {
        Self {
            max_iterations: settings.max_iterations,
            stagnation_limit: settings.stagnation_limit,
        }
    }
}

/// Result of [`LoopController::run_turn`].
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub termination: Termination,
    /// Text of the last assistant message, notices included.
    pub final_text: String,
    pub iterations: u32,
    /// Wire history after the turn.
    pub history: Vec<ChatMessage>,
}

/// Mutable bookkeeping for one run. Created fresh per turn.
#[derive(Debug, Clone)]
pub struct OrchestratorState {
    pub iteration: u32,
    pub protocol_strikes: u32,
    pub stagnation_count: u32,
    pub last_assistant_hash: Option<String>,
    pub tool_call_signature_hits: HashMap<String, u32>,
    pub memory: WorkingMemory,
}

impl OrchestratorState {
    pub fn new(max_digests: usize) -> Self {
        Self {
            iteration: 0,
            protocol_strikes: 0,
            stagnation_count: 0,
            last_assistant_hash: None,
            tool_call_signature_hits: HashMap::new(),
            memory: WorkingMemory::new(max_digests),
        }
    }

    /// Update the stagnation counter with this iteration's answer text.
    ///
    /// Empty answers that came with tool calls leave the counter untouched.
    fn observe_answer(&mut self, text: &str, has_tool_calls: bool) {
        let trimmed = text.trim();
        if trimmed.is_empty() && has_tool_calls {
            return;
        }
        let hash = hash_text(trimmed);
        if self.last_assistant_hash.as_deref() == Some(hash.as_str()) {
            self.stagnation_count += 1;
        } else {
            self.stagnation_count = 0;
            self.last_assistant_hash = Some(hash);
        }
    }

    /// Count one more sighting of a tool batch; returns the new count.
    fn hit_batch(&mut self, signature: String) -> u32 {
        let hits = self.tool_call_signature_hits.entry(signature).or_insert(0);
        *hits += 1;
        *hits
    }
}

// ─── LoopController ─────────────────────────────────────────────────────────

/// Drives the stream → tools → stream loop for one conversation.
pub struct LoopController {
    backend: Arc<dyn ChatBackend>,
    executor: ToolExecutor,
    timing: Arc<dyn TimingObserver>,
    settings: AgentSettings,
    idle_timeout: std::time::Duration,
}

impl LoopController {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        registry: Arc<dyn ToolRegistry>,
        timing: Arc<dyn TimingObserver>,
        settings: AgentSettings,
    ) -> Self {
        let executor = ToolExecutor::new(registry, &settings);
        Self {
            backend,
            executor,
            timing,
            settings,
            idle_timeout: std::time::Duration::from_secs(DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
        }
    }

    /// Override the per-chunk stall timeout (defaults to the endpoint default).
    pub fn with_idle_timeout(mut self, idle_timeout: std::time::Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Run one user turn.
    ///
    /// `history` must already contain the user's message. Every assistant
    /// message streamed is pushed to `transcript` and updated in place.
    pub async fn run_turn(
        &self,
        history: Vec<ChatMessage>,
        tool_definitions: Vec<ToolDefinition>,
        cancel: &CancellationToken,
        limits: TurnLimits,
        transcript: &mut Transcript,
    ) -> TurnOutcome {
        let mut run = TurnRun {
            state: OrchestratorState::new(self.settings.context.max_digests),
            history,
            limits,
        };
        let has_tools = !tool_definitions.is_empty();

        tracing::info!(
            max_iterations = limits.max_iterations,
            stagnation_limit = limits.stagnation_limit,
            tool_count = tool_definitions.len(),
            history_len = run.history.len(),
            "turn started"
        );

        if limits.max_iterations == 0 {
            let message_id = transcript.push(TurnMessage::assistant());
            let mut assembler = PartsAssembler::new();
            return run.stop(transcript, &message_id, &mut assembler, StopReason::MaxIterations);
        }

        loop {
            run.state.iteration += 1;
            let iteration = run.state.iteration;

            let request = CompletionRequest {
                messages: self.request_history(&run),
                tools: tool_definitions.clone(),
            };

            let message_id = transcript.push(TurnMessage::assistant());
            let mut assembler = PartsAssembler::new();
            let ctx = StreamContext {
                message_id: &message_id,
                cancel,
                timing: self.timing.as_ref(),
                retry: self.settings.request_retry,
                idle_timeout: self.idle_timeout,
                reasoning: &self.settings.reasoning,
            };

            let streamed = stream_completion(
                self.backend.as_ref(),
                &request,
                &ctx,
                &mut assembler,
                |parts| {
                    if let Err(e) = transcript.update_parts(&message_id, parts.to_vec()) {
                        tracing::warn!(error = %e, "dropped transcript update");
                    }
                },
            )
            .await;

            let completion = match streamed {
                Ok(completion) => completion,
                Err(InferenceError::Cancelled) => {
                    return run.stop(transcript, &message_id, &mut assembler, StopReason::Cancelled);
                }
                Err(e) => {
                    tracing::error!(iteration, error = %e, "streaming failed");
                    let reason = StopReason::Failed(e.to_string());
                    return run.stop(transcript, &message_id, &mut assembler, reason);
                }
            };

            let wants_tools = completion.finish_reason == Some(FinishReason::ToolCalls)
                && !completion.tool_calls.is_empty();

            tracing::info!(
                iteration,
                text_len = completion.text.len(),
                tool_calls = completion.tool_calls.len(),
                finish_reason = completion.finish_reason.as_ref().map(|r| r.as_str()).unwrap_or("none"),
                "iteration streamed"
            );

            run.state
                .observe_answer(&completion.text, !completion.tool_calls.is_empty());
            if limits.stagnation_limit > 0 && run.state.stagnation_count >= limits.stagnation_limit {
                return run.stop(transcript, &message_id, &mut assembler, StopReason::Stagnation);
            }

            if !wants_tools {
                if let Some(envelope) = FinalEnvelope::parse(&completion.text) {
                    assembler.replace_text(&envelope.rendered_result());
                    run.history.push(ChatMessage::assistant(completion.text.trim()));
                    return run.succeed(transcript, &message_id, &assembler);
                }

                if iteration == 1 && !has_tools && !completion.text.trim().is_empty() {
                    run.history.push(ChatMessage::assistant(completion.text.clone()));
                    return run.succeed(transcript, &message_id, &assembler);
                }

                run.state.protocol_strikes += 1;
                tracing::warn!(
                    iteration,
                    strikes = run.state.protocol_strikes,
                    limit = self.settings.protocol_strike_limit,
                    "protocol strike: no final envelope"
                );
                if run.state.protocol_strikes > self.settings.protocol_strike_limit {
                    return run.stop(
                        transcript,
                        &message_id,
                        &mut assembler,
                        StopReason::ProtocolViolations,
                    );
                }
                if !completion.text.trim().is_empty() {
                    run.history.push(ChatMessage::assistant(completion.text.clone()));
                }
                run.history.push(ChatMessage::user(PROTOCOL_REMINDER));
            } else {
                let signature = batch_signature(&completion.tool_calls);
                let hits = run.state.hit_batch(signature);
                if hits > self.settings.tool_repeat_limit {
                    tracing::warn!(iteration, hits, "identical tool batch repeated");
                    return run.stop(
                        transcript,
                        &message_id,
                        &mut assembler,
                        StopReason::ToolLoopDetected,
                    );
                }

                let executions = self
                    .executor
                    .execute_batch(&completion.tool_calls, cancel)
                    .await;

                for execution in &executions {
                    assembler.attach_result(&execution.call.id, execution.value.clone(), !execution.ok);
                    run.state.memory.record(ToolDigest::new(
                        &execution.call,
                        execution.ok,
                        &execution.content,
                        self.settings.context.digest_summary_chars,
                    ));
                }
                if let Err(e) = transcript.update_parts(&message_id, assembler.snapshot()) {
                    tracing::warn!(error = %e, "dropped tool result update");
                }

                let text = completion.text.trim();
                run.history.push(ChatMessage::Assistant {
                    content: (!text.is_empty()).then(|| completion.text.clone()),
                    tool_calls: completion.tool_calls.iter().map(|c| c.to_response()).collect(),
                });
                for execution in executions {
                    run.history
                        .push(ChatMessage::tool_result(execution.call.id, execution.content));
                }

                if cancel.is_cancelled() {
                    return run.stop(transcript, &message_id, &mut assembler, StopReason::Cancelled);
                }
            }

            if iteration >= limits.max_iterations {
                return run.stop(transcript, &message_id, &mut assembler, StopReason::MaxIterations);
            }
            freeze(transcript, &message_id);
        }
    }

    /// History for the next request: working memory refreshed, then pruned.
    fn request_history(&self, run: &TurnRun) -> Vec<ChatMessage> {
        let context = &self.settings.context;
        let messages = with_working_memory(&run.history, run.state.memory.render(context.memory_window));
        prune(&messages, context)
    }
}

/// State threaded through one `run_turn`.
struct TurnRun {
    state: OrchestratorState,
    history: Vec<ChatMessage>,
    limits: TurnLimits,
}

impl TurnRun {
    fn succeed(
        self,
        transcript: &mut Transcript,
        message_id: &str,
        assembler: &PartsAssembler,
    ) -> TurnOutcome {
        if let Err(e) = transcript.update_parts(message_id, assembler.snapshot()) {
            tracing::warn!(error = %e, "dropped final transcript update");
        }
        freeze(transcript, message_id);
        tracing::info!(iterations = self.state.iteration, "turn succeeded");
        TurnOutcome {
            termination: Termination::Success,
            final_text: assembler.text().to_string(),
            iterations: self.state.iteration,
            history: self.history,
        }
    }

    fn stop(
        self,
        transcript: &mut Transcript,
        message_id: &str,
        assembler: &mut PartsAssembler,
        reason: StopReason,
    ) -> TurnOutcome {
        assembler.append_notice(&reason.notice(&self.limits));
        if let Err(e) = transcript.update_parts(message_id, assembler.snapshot()) {
            tracing::warn!(error = %e, "dropped stop notice");
        }
        freeze(transcript, message_id);
        tracing::warn!(
            iterations = self.state.iteration,
            reason = %reason,
            strikes = self.state.protocol_strikes,
            "turn stopped"
        );
        TurnOutcome {
            termination: Termination::Stopped(reason),
            final_text: assembler.text().to_string(),
            iterations: self.state.iteration,
            history: self.history,
        }
    }
}

fn freeze(transcript: &mut Transcript, message_id: &str) {
    if let Err(e) = transcript.freeze(message_id) {
        tracing::warn!(error = %e, "could not freeze transcript message");
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
