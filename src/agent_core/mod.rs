//! Agent Core: the tool-calling loop on top of the inference layer.
//!
//! Submodules:
//! - `orchestrator`: Loop controller, guards and termination
//! - `executor`: Bounded-concurrency tool execution with timeout and retry
//! - `registry`: The `ToolRegistry` seam
//! - `envelope`: The `{"type": "final"}` answer contract
//! - `memory`: Tool digests, working memory and call signatures
//! - `history`: Working-memory injection and history pruning
//! - `timing`: Per-message reasoning timing
//! - `transcript`: The renderable, id-keyed record of a turn
//! - `errors`: Tool and transcript error types

pub mod envelope;
pub mod errors;
pub mod executor;
pub mod history;
pub mod memory;
pub mod orchestrator;
pub mod registry;
pub mod timing;
pub mod transcript;

// Re-exports for convenience
pub use envelope::FinalEnvelope;
pub use errors::{ToolError, TranscriptError};
pub use executor::{ToolExecution, ToolExecutor};
pub use orchestrator::{
    LoopController, OrchestratorState, StopReason, Termination, TurnLimits, TurnOutcome,
};
pub use registry::{EmptyToolRegistry, ToolInvocation, ToolRegistry};
pub use timing::{TimingObserver, TimingTracker};
pub use transcript::{MessageId, Transcript, TurnBody, TurnMessage};
