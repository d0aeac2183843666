//! Shared types for the inference client.
//!
//! The request side mirrors the OpenAI Chat Completions API. The response
//! side has two layers: the raw SSE chunk types (`ChatCompletionChunk` and
//! friends) and the normalized [`Delta`] the rest of the crate consumes.

use serde::{Deserialize, Serialize};

// ─── Request Types ───────────────────────────────────────────────────────────

/// One entry of the conversation history sent to the model.
///
/// Each role carries only the fields valid for it, so a tool result without a
/// `tool_call_id` or a user message with tool calls cannot be built.
///
/// Serialization notes for OpenAI-compatible local servers:
/// - Assistant `content` is emitted as `""` (not `null`) when absent. llama.cpp
///   and Ollama mishandle `null` content on tool-call round trips.
/// - Assistant `tool_calls` is omitted when empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default, serialize_with = "serialize_content")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallResponse>,
    },
    #[serde(rename = "tool")]
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage::User {
            content: content.into(),
        }
    }

    /// Plain assistant text with no tool calls.
    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage::ToolResult {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            ChatMessage::System { .. } => Role::System,
            ChatMessage::User { .. } => Role::User,
            ChatMessage::Assistant { .. } => Role::Assistant,
            ChatMessage::ToolResult { .. } => Role::Tool,
        }
    }

    /// The textual content, if any.
    pub fn content(&self) -> Option<&str> {
        match self {
            ChatMessage::System { content }
            | ChatMessage::User { content }
            | ChatMessage::ToolResult { content, .. } => Some(content),
            ChatMessage::Assistant { content, .. } => content.as_deref(),
        }
    }

    /// Approximate serialized size in characters, used for context budgeting.
    pub fn char_len(&self) -> usize {
        let content = self.content().map(|c| c.chars().count()).unwrap_or(0);
        let calls = match self {
            ChatMessage::Assistant { tool_calls, .. } => tool_calls
                .iter()
                .map(|c| c.function.name.len() + c.function.arguments.chars().count())
                .sum(),
            ChatMessage::ToolResult { tool_call_id, .. } => tool_call_id.len(),
            _ => 0,
        };
        content + calls
    }
}

/// Custom serializer for `content`: emit `""` instead of `null` when `None`.
fn serialize_content<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(s) => serializer.serialize_str(s),
        None => serializer.serialize_str(""),
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Tool definition sent in the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    /// Build a `function` tool definition.
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            r#type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Function definition within a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

/// Tool call as carried in assistant history messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCallResponse,
}

/// Function call details in a history message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub name: String,
    pub arguments: String,
}

// ─── Normalized Stream Types ─────────────────────────────────────────────────

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other(String),
}

impl From<&str> for FinishReason {
    fn from(raw: &str) -> Self {
        match raw {
            "stop" => FinishReason::Stop,
            "tool_calls" => FinishReason::ToolCalls,
            "length" => FinishReason::Length,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Length => "length",
            FinishReason::Other(s) => s,
        }
    }
}

/// One tool-call fragment, tagged with its position in the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub index: u32,
    pub id: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One parsed protocol event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    /// Answer-text fragment.
    pub content: Option<String>,
    /// Side-channel reasoning fragment.
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallFragment>,
    pub finish_reason: Option<FinishReason>,
}

impl Delta {
    /// True when the frame carried nothing worth forwarding (heartbeats).
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.reasoning.is_none()
            && self.tool_calls.is_empty()
            && self.finish_reason.is_none()
    }

    pub fn text(content: impl Into<String>) -> Self {
        Delta {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Delta {
            reasoning: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Delta {
            finish_reason: Some(reason),
            ..Default::default()
        }
    }
}

/// A complete tool call extracted from one streamed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw argument text exactly as streamed.
    pub arguments_text: String,
    /// Parsed arguments; `None` when the text never became valid JSON.
    pub arguments: Option<serde_json::Value>,
}

impl ToolCall {
    /// The history form of this call.
    pub fn to_response(&self) -> ToolCallResponse {
        ToolCallResponse {
            id: self.id.clone(),
            r#type: "function".to_string(),
            function: FunctionCallResponse {
                name: self.name.clone(),
                arguments: self.arguments_text.clone(),
            },
        }
    }
}

// ─── Raw SSE Types ───────────────────────────────────────────────────────────

/// Raw SSE chunk from the OpenAI-compatible API.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

/// A single choice within a streaming chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: Option<ChunkDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// The delta (incremental update) within a chunk choice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    /// llama.cpp / DeepSeek style reasoning side channel.
    #[serde(default)]
    pub reasoning_content: Option<String>,
    /// Ollama / GPT-OSS style reasoning side channel.
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ChunkToolCall>>,
}

/// A tool call fragment within a streaming delta.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkToolCall {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub function: Option<ChunkFunction>,
}

/// A function call fragment within a streaming tool call.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkFunction {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

impl ChatCompletionChunk {
    /// Normalize the first choice into a [`Delta`].
    ///
    /// Empty strings count as absent so keep-alive frames with `"content":""`
    /// are dropped by the caller.
    pub fn into_delta(self) -> Delta {
        let Some(choice) = self.choices.into_iter().next() else {
            return Delta::default();
        };
        let finish_reason = choice
            .finish_reason
            .as_deref()
            .filter(|r| !r.is_empty())
            .map(FinishReason::from);
        let delta = choice.delta.unwrap_or_default();

        let non_empty = |s: Option<String>| s.filter(|s| !s.is_empty());
        let reasoning = non_empty(delta.reasoning_content).or(non_empty(delta.reasoning));

        let tool_calls = delta
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                ToolCallFragment {
                    index: tc.index.unwrap_or(0),
                    id: non_empty(tc.id),
                    kind: non_empty(tc.kind),
                    name: non_empty(name),
                    arguments,
                }
            })
            .collect();

        Delta {
            content: non_empty(delta.content),
            reasoning,
            tool_calls,
            finish_reason,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
