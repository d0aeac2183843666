//! Aggregates one response into an ordered list of renderable parts.
//!
//! Snapshot order is fixed: every reasoning block (creation order), then at
//! most one text part, then tool-call parts (insertion order). Every caller
//! that renders or persists a turn relies on that order.

use serde::{Deserialize, Serialize};

use super::reasoning::Segment;

/// One renderable piece of an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Reasoning {
        text: String,
    },
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        args: Option<serde_json::Value>,
        args_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

impl MessagePart {
    fn rank(&self) -> u8 {
        match self {
            MessagePart::Reasoning { .. } => 0,
            MessagePart::Text { .. } => 1,
            MessagePart::ToolCall { .. } => 2,
        }
    }
}

/// Whether a list of parts honors the reasoning → text → tool-call order.
pub fn is_well_ordered(parts: &[MessagePart]) -> bool {
    let texts = parts
        .iter()
        .filter(|p| matches!(p, MessagePart::Text { .. }))
        .count();
    texts <= 1 && parts.windows(2).all(|w| w[0].rank() <= w[1].rank())
}

/// What applying a [`Segment`] did to the reasoning state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartEvent {
    /// Reasoning text was appended (a block is open).
    Reasoning,
    /// Non-reasoning output was accepted; any open block is now closed.
    Boundary,
    /// Nothing changed (e.g. leading whitespace before the answer).
    Ignored,
}

#[derive(Debug, Clone)]
struct ToolCallPart {
    id: String,
    name: String,
    args: Option<serde_json::Value>,
    args_text: String,
    result: Option<serde_json::Value>,
    is_error: Option<bool>,
}

/// Append-only aggregation of reasoning blocks, answer text and tool calls.
#[derive(Debug, Clone, Default)]
pub struct PartsAssembler {
    reasoning: Vec<String>,
    reasoning_open: bool,
    text: String,
    tool_calls: Vec<ToolCallPart>,
}

impl PartsAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one classified segment.
    pub fn apply(&mut self, segment: Segment) -> PartEvent {
        match segment {
            Segment::Reasoning(text) => {
                if self.push_reasoning(&text) {
                    PartEvent::Reasoning
                } else {
                    PartEvent::Ignored
                }
            }
            Segment::Text(text) => {
                if self.push_text(&text) {
                    PartEvent::Boundary
                } else {
                    PartEvent::Ignored
                }
            }
            Segment::Boundary => {
                self.close_reasoning();
                PartEvent::Boundary
            }
        }
    }

    /// Append to the open reasoning block, opening a new one if needed.
    pub fn push_reasoning(&mut self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        if !self.reasoning_open {
            self.reasoning.push(String::new());
            self.reasoning_open = true;
        }
        if let Some(block) = self.reasoning.last_mut() {
            block.push_str(text);
        }
        true
    }

    /// Close the open reasoning block. Returns whether one was open.
    pub fn close_reasoning(&mut self) -> bool {
        std::mem::replace(&mut self.reasoning_open, false)
    }

    /// Append answer text. Leading whitespace of the answer is dropped.
    pub fn push_text(&mut self, text: &str) -> bool {
        let effective = if self.text.is_empty() {
            text.trim_start()
        } else {
            text
        };
        if effective.is_empty() {
            return false;
        }
        self.close_reasoning();
        self.text.push_str(effective);
        true
    }

    /// Insert or update a tool-call part by id.
    pub fn upsert_tool_call(
        &mut self,
        id: &str,
        name: &str,
        args_text: &str,
        args: Option<serde_json::Value>,
    ) {
        match self.tool_calls.iter_mut().find(|p| p.id == id) {
            Some(part) => {
                if !name.is_empty() {
                    part.name = name.to_string();
                }
                part.args_text = args_text.to_string();
                if args.is_some() {
                    part.args = args;
                }
            }
            None => {
                self.close_reasoning();
                self.tool_calls.push(ToolCallPart {
                    id: id.to_string(),
                    name: name.to_string(),
                    args,
                    args_text: args_text.to_string(),
                    result: None,
                    is_error: None,
                });
            }
        }
    }

    /// Change the id of a tool-call part, keeping its position.
    pub fn rekey_tool_call(&mut self, old_id: &str, new_id: &str) -> bool {
        match self.tool_calls.iter_mut().find(|p| p.id == old_id) {
            Some(part) => {
                part.id = new_id.to_string();
                true
            }
            None => false,
        }
    }

    /// Attach an execution result. Unknown ids are ignored.
    pub fn attach_result(&mut self, id: &str, result: serde_json::Value, is_error: bool) -> bool {
        match self.tool_calls.iter_mut().find(|p| p.id == id) {
            Some(part) => {
                part.result = Some(result);
                part.is_error = Some(is_error);
                true
            }
            None => false,
        }
    }

    /// Replace the answer text wholesale (final envelope rendering).
    pub fn replace_text(&mut self, text: &str) {
        self.text = text.to_string();
    }

    /// Append a bracketed notice to the answer text.
    pub fn append_notice(&mut self, notice: &str) {
        if self.text.is_empty() {
            self.text = notice.to_string();
        } else {
            self.text.push_str("\n\n");
            self.text.push_str(notice);
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn reasoning_blocks(&self) -> &[String] {
        &self.reasoning
    }

    pub fn tool_call_count(&self) -> usize {
        self.tool_calls.len()
    }

    /// Ordered, renderable view of everything assembled so far.
    pub fn snapshot(&self) -> Vec<MessagePart> {
        let mut parts = Vec::with_capacity(self.reasoning.len() + 1 + self.tool_calls.len());
        parts.extend(
            self.reasoning
                .iter()
                .filter(|r| !r.is_empty())
                .map(|r| MessagePart::Reasoning { text: r.clone() }),
        );
        if !self.text.is_empty() {
            parts.push(MessagePart::Text {
                text: self.text.clone(),
            });
        }
        parts.extend(self.tool_calls.iter().map(|p| MessagePart::ToolCall {
            id: p.id.clone(),
            name: p.name.clone(),
            args: p.args.clone(),
            args_text: p.args_text.clone(),
            result: p.result.clone(),
            is_error: p.is_error,
        }));
        parts
    }
}
