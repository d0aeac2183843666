//! Inference: everything between the HTTP body and a finished assistant message.
//!
//! This module handles all communication with the model endpoint:
//! - SSE frame parsing (`frames`)
//! - Tool-call fragment merging (`accumulator`)
//! - Reasoning / answer separation (`reasoning`)
//! - Ordered message parts (`parts`)
//! - One streamed call with retry, cancellation and timing (`streamer`)
//! - The reqwest client for OpenAI-compatible servers (`client`)
//! - Configuration loading from `config/agent.yaml` (`config`)
//!
//! The client speaks the OpenAI Chat Completions API, so switching between
//! llama.cpp, Ollama or vLLM is a config change, not a code change.

pub mod accumulator;
pub mod client;
pub mod config;
pub mod errors;
pub mod frames;
pub mod parts;
pub mod reasoning;
pub mod streamer;
pub mod types;

// Re-exports for convenience
pub use client::InferenceClient;
pub use config::{AgentConfig, AgentSettings, ContextSettings, EndpointConfig, RetryPolicy};
pub use errors::InferenceError;
pub use parts::{MessagePart, PartsAssembler};
pub use streamer::{stream_completion, ChatBackend, CompletionRequest, CompletionResult, DeltaStream};
pub use types::{ChatMessage, Delta, FinishReason, Role, ToolCall, ToolDefinition};
