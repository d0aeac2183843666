//! The terminal payload a model emits to finish a tool-calling turn.

use serde_json::Value;

/// User-role reminder appended after a protocol strike.
pub const PROTOCOL_REMINDER: &str = "Your previous reply did not follow the protocol. \
Either call one of the available tools, or finish by replying with exactly one JSON \
object and nothing else: {\"type\": \"final\", \"result\": <your answer>}. \
An optional \"checks\" field may list what you verified.";

/// `{"type": "final", "result": ..., "checks": ...}`.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalEnvelope {
    pub result: Value,
    pub checks: Option<Value>,
}

impl FinalEnvelope {
    /// Strict parse: the whole trimmed text must be one JSON object whose
    /// `type` is `"final"` and which has a `result` key. Other keys are ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        let Value::Object(mut map) = serde_json::from_str::<Value>(trimmed).ok()? else {
            return None;
        };
        if map.get("type").and_then(Value::as_str) != Some("final") {
            return None;
        }
        let result = map.remove("result")?;
        Some(Self {
            result,
            checks: map.remove("checks"),
        })
    }

    /// Text shown in place of the raw envelope: strings verbatim, other JSON serialized.
    pub fn rendered_result(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}
