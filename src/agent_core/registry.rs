//! The seam between the loop and whatever actually runs tools.

use async_trait::async_trait;

use crate::inference::types::{ToolCall, ToolDefinition};

use super::errors::ToolError;

/// One call as handed to a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    /// Raw argument text as the model produced it.
    pub arguments_text: String,
}

impl From<&ToolCall> for ToolInvocation {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments_text: call.arguments_text.clone(),
        }
    }
}

/// Source of tool definitions and executor of tool calls.
///
/// Shared read-only across concurrent invocations.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Definitions offered to the model this turn.
    fn enabled_definitions(&self) -> Vec<ToolDefinition>;

    async fn execute(&self, invocation: &ToolInvocation) -> Result<serde_json::Value, ToolError>;
}

/// A registry with no tools. Every call is an unknown tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyToolRegistry;

#[async_trait]
impl ToolRegistry for EmptyToolRegistry {
    fn enabled_definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn execute(&self, invocation: &ToolInvocation) -> Result<serde_json::Value, ToolError> {
        Err(ToolError::UnknownTool {
            name: invocation.name.clone(),
        })
    }
}
