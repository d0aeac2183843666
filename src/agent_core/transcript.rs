//! The renderable record of a turn.
//!
//! An owned, id-keyed table of messages in insertion order. Assistant
//! messages are updated in place while they stream; once frozen, the only
//! accepted change is attaching results to their tool-call parts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::inference::parts::MessagePart;
use crate::inference::types::Role;

use super::errors::TranscriptError;

pub type MessageId = String;

/// What a transcript entry holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnBody {
    Text { text: String },
    Parts { parts: Vec<MessagePart> },
}

/// One role-tagged transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnMessage {
    pub id: MessageId,
    pub role: Role,
    pub body: TurnBody,
    pub frozen: bool,
    pub created_at: DateTime<Utc>,
}

impl TurnMessage {
    fn with_body(role: Role, body: TurnBody) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            body,
            frozen: false,
            created_at: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_body(Role::System, TurnBody::Text { text: text.into() })
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_body(Role::User, TurnBody::Text { text: text.into() })
    }

    pub fn tool(text: impl Into<String>) -> Self {
        Self::with_body(Role::Tool, TurnBody::Text { text: text.into() })
    }

    /// Empty assistant message, ready to stream into.
    pub fn assistant() -> Self {
        Self::with_body(Role::Assistant, TurnBody::Parts { parts: Vec::new() })
    }

    pub fn parts(&self) -> &[MessagePart] {
        match &self.body {
            TurnBody::Parts { parts } => parts,
            TurnBody::Text { .. } => &[],
        }
    }

    /// Answer text: the text part for assistants, the body otherwise.
    pub fn text(&self) -> &str {
        match &self.body {
            TurnBody::Text { text } => text,
            TurnBody::Parts { parts } => parts
                .iter()
                .find_map(|p| match p {
                    MessagePart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .unwrap_or(""),
        }
    }
}

type Listener = Box<dyn FnMut(&TurnMessage) + Send>;

/// Messages of one turn plus the listeners observing them.
#[derive(Default)]
pub struct Transcript {
    messages: Vec<TurnMessage>,
    index: HashMap<MessageId, usize>,
    listeners: Vec<Listener>,
}

impl std::fmt::Debug for Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcript")
            .field("messages", &self.messages)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked on every insert and update.
    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: FnMut(&TurnMessage) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn push(&mut self, message: TurnMessage) -> MessageId {
        let id = message.id.clone();
        self.index.insert(id.clone(), self.messages.len());
        self.messages.push(message);
        self.notify(self.messages.len() - 1);
        id
    }

    /// Replace an assistant message's parts with a newer snapshot.
    pub fn update_parts(&mut self, id: &str, parts: Vec<MessagePart>) -> Result<(), TranscriptError> {
        let idx = *self.index.get(id).ok_or_else(|| TranscriptError::UnknownMessage {
            id: id.to_string(),
        })?;
        let message = &mut self.messages[idx];
        let TurnBody::Parts { parts: current } = &mut message.body else {
            return Err(TranscriptError::NotAssistant { id: id.to_string() });
        };
        if message.frozen && !only_attaches_results(current, &parts) {
            return Err(TranscriptError::Frozen { id: id.to_string() });
        }
        *current = parts;
        self.notify(idx);
        Ok(())
    }

    /// Mark a message as finished streaming.
    pub fn freeze(&mut self, id: &str) -> Result<(), TranscriptError> {
        let idx = *self.index.get(id).ok_or_else(|| TranscriptError::UnknownMessage {
            id: id.to_string(),
        })?;
        self.messages[idx].frozen = true;
        self.notify(idx);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&TurnMessage> {
        self.index.get(id).map(|&idx| &self.messages[idx])
    }

    pub fn messages(&self) -> &[TurnMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn notify(&mut self, idx: usize) {
        let message = &self.messages[idx];
        for listener in &mut self.listeners {
            listener(message);
        }
    }
}

/// True when `new` equals `old` except for results newly attached to tool-call parts.
fn only_attaches_results(old: &[MessagePart], new: &[MessagePart]) -> bool {
    old.len() == new.len()
        && old.iter().zip(new).all(|(a, b)| match (a, b) {
            (
                MessagePart::ToolCall {
                    id: ia,
                    name: na,
                    args: aa,
                    args_text: ta,
                    result: ra,
                    is_error: ea,
                },
                MessagePart::ToolCall {
                    id: ib,
                    name: nb,
                    args: ab,
                    args_text: tb,
                    result: rb,
                    is_error: eb,
                },
            ) => {
                ia == ib
                    && na == nb
                    && aa == ab
                    && ta == tb
                    && (ra.is_none() || ra == rb)
                    && (ea.is_none() || ea == eb)
            }
            _ => a == b,
        })
}
