//! Agent Core error types.

use thiserror::Error;

/// Errors a tool invocation can end with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    /// The model asked for a tool the registry does not offer.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// Arguments were not valid JSON or did not match the schema.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The invocation did not finish within the per-call budget.
    #[error("tool '{tool}' timed out after {duration_secs}s")]
    Timeout { tool: String, duration_secs: u64 },

    /// Transport failure reaching the tool's server.
    #[error("transport error calling '{tool}': {reason}")]
    Transport { tool: String, reason: String },

    /// The tool's server answered with an error status.
    #[error("tool '{tool}' returned status {status}: {message}")]
    Server {
        tool: String,
        status: u16,
        message: String,
    },

    /// The tool ran and reported failure.
    #[error("tool '{tool}' failed: {reason}")]
    Failed { tool: String, reason: String },

    /// The turn was cancelled before the tool finished.
    #[error("tool call cancelled")]
    Cancelled,
}

/// Errors from transcript updates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscriptError {
    #[error("no transcript message with id '{id}'")]
    UnknownMessage { id: String },

    /// Only assistant messages carry parts.
    #[error("message '{id}' is not an assistant message")]
    NotAssistant { id: String },

    /// The message finished streaming and the update would change more than results.
    #[error("message '{id}' is frozen")]
    Frozen { id: String },
}

impl ToolError {
    /// Whether retrying the same invocation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ToolError::Timeout { .. } | ToolError::Transport { .. } => true,
            ToolError::Server { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
