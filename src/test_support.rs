//! Scripted fakes shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};

use crate::agent_core::errors::ToolError;
use crate::agent_core::registry::{ToolInvocation, ToolRegistry};
use crate::agent_core::timing::TimingObserver;
use crate::inference::errors::InferenceError;
use crate::inference::streamer::{ChatBackend, CompletionRequest, DeltaStream};
use crate::inference::types::{Delta, FinishReason, ToolCallFragment, ToolDefinition};

// ─── Backend ────────────────────────────────────────────────────────────────

/// What one `open_stream` call produces.
#[derive(Debug)]
pub enum Script {
    Deltas(Vec<Delta>),
    OpenError(InferenceError),
    DeltasThenError(Vec<Delta>, InferenceError),
    /// Yields the deltas, then never ends.
    DeltasThenHang(Vec<Delta>),
}

/// Plain answer text followed by `finish_reason: stop`.
pub fn text_reply(text: &str) -> Script {
    Script::Deltas(vec![Delta::text(text), Delta::finish(FinishReason::Stop)])
}

/// One fragment per `(id, name, arguments)` followed by `finish_reason: tool_calls`.
pub fn tool_reply(calls: &[(&str, &str, &str)]) -> Script {
    let mut deltas: Vec<Delta> = calls
        .iter()
        .enumerate()
        .map(|(index, (id, name, args))| Delta {
            tool_calls: vec![ToolCallFragment {
                index: index as u32,
                id: Some(id.to_string()),
                kind: Some("function".into()),
                name: Some(name.to_string()),
                arguments: Some(args.to_string()),
            }],
            ..Default::default()
        })
        .collect();
    deltas.push(Delta::finish(FinishReason::ToolCalls));
    Script::Deltas(deltas)
}

/// Replays scripts in order, one per `open_stream` call.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn open_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn open_stream(&self, request: &CompletionRequest) -> Result<DeltaStream, InferenceError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            None => Err(InferenceError::StreamError {
                reason: "script exhausted".into(),
            }),
            Some(Script::OpenError(e)) => Err(e),
            Some(Script::Deltas(deltas)) => Ok(stream::iter(deltas.into_iter().map(Ok)).boxed()),
            Some(Script::DeltasThenError(deltas, e)) => Ok(stream::iter(deltas.into_iter().map(Ok))
                .chain(stream::once(async move { Err(e) }))
                .boxed()),
            Some(Script::DeltasThenHang(deltas)) => Ok(stream::iter(deltas.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()),
        }
    }
}

// ─── Timing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimingEvent {
    ReasoningStarted(String),
    BoundaryReached(String),
    EndOfMessage(String),
}

/// Records every timing event in arrival order.
#[derive(Debug, Default)]
pub struct RecordingTiming {
    events: Mutex<Vec<TimingEvent>>,
}

impl RecordingTiming {
    pub fn events(&self) -> Vec<TimingEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl TimingObserver for RecordingTiming {
    fn reasoning_started(&self, message_id: &str) {
        self.events
            .lock()
            .unwrap()
            .push(TimingEvent::ReasoningStarted(message_id.to_string()));
    }

    fn boundary_reached(&self, message_id: &str) {
        self.events
            .lock()
            .unwrap()
            .push(TimingEvent::BoundaryReached(message_id.to_string()));
    }

    fn end_of_message(&self, message_id: &str) {
        self.events
            .lock()
            .unwrap()
            .push(TimingEvent::EndOfMessage(message_id.to_string()));
    }
}

// ─── Tools ──────────────────────────────────────────────────────────────────

type Handler = Arc<dyn Fn(&ToolInvocation, u32) -> Result<Value, ToolError> + Send + Sync>;

/// Registry whose tools are closures. The closure gets the invocation and
/// the 1-based count of calls made to that tool so far.
#[derive(Default)]
pub struct ScriptedTools {
    handlers: HashMap<String, Handler>,
    delays: HashMap<String, Duration>,
    counts: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<ToolInvocation>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&ToolInvocation, u32) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    pub fn with_delay(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    /// Definitions for every registered tool, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                ToolDefinition::function(
                    name.as_str(),
                    format!("Scripted tool {name}"),
                    json!({"type": "object", "properties": {}}),
                )
            })
            .collect()
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ToolRegistry for ScriptedTools {
    fn enabled_definitions(&self) -> Vec<ToolDefinition> {
        self.definitions()
    }

    async fn execute(&self, invocation: &ToolInvocation) -> Result<Value, ToolError> {
        self.calls.lock().unwrap().push(invocation.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let Some(handler) = self.handlers.get(&invocation.name).cloned() else {
            return Err(ToolError::UnknownTool {
                name: invocation.name.clone(),
            });
        };
        let count = {
            let mut counts = self.counts.lock().unwrap();
            let n = counts.entry(invocation.name.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if let Some(delay) = self.delays.get(&invocation.name) {
            tokio::time::sleep(*delay).await;
        }
        handler(invocation, count)
    }
}
