//! Merges index-keyed tool-call fragments into complete invocations.
//!
//! OpenAI-compatible servers stream one tool call as many deltas that share
//! an `index`: the first usually carries `id` and `function.name`, the rest
//! carry slices of `function.arguments`. Argument text is only concatenated
//! here; whether it is valid JSON is decided once the stream ends.

use std::collections::BTreeMap;

use super::types::ToolCallFragment;

/// One tool call as assembled so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulatedToolCall {
    pub id: String,
    pub kind: String,
    pub function_name: String,
    pub arguments_text: String,
}

/// Stateful merge of tool-call fragments for a single streamed response.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, AccumulatedToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one fragment.
    ///
    /// The first fragment for an index seeds every field; later fragments only
    /// overwrite `id`/`kind`/`function_name` when present and always append
    /// to `arguments_text`.
    pub fn push(&mut self, fragment: &ToolCallFragment) {
        match self.calls.get_mut(&fragment.index) {
            Some(call) => {
                if let Some(ref id) = fragment.id {
                    call.id = id.clone();
                }
                if let Some(ref kind) = fragment.kind {
                    call.kind = kind.clone();
                }
                if let Some(ref name) = fragment.name {
                    call.function_name = name.clone();
                }
                if let Some(ref args) = fragment.arguments {
                    call.arguments_text.push_str(args);
                }
            }
            None => {
                self.calls.insert(
                    fragment.index,
                    AccumulatedToolCall {
                        id: fragment.id.clone().unwrap_or_default(),
                        kind: fragment
                            .kind
                            .clone()
                            .unwrap_or_else(|| "function".to_string()),
                        function_name: fragment.name.clone().unwrap_or_default(),
                        arguments_text: fragment.arguments.clone().unwrap_or_default(),
                    },
                );
            }
        }
    }

    /// The call currently stored at `index`.
    pub fn get(&self, index: u32) -> Option<&AccumulatedToolCall> {
        self.calls.get(&index)
    }

    /// All calls, sorted by stream index.
    pub fn snapshot(&self) -> Vec<(u32, AccumulatedToolCall)> {
        self.calls
            .iter()
            .map(|(index, call)| (*index, call.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(index: u32, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> ToolCallFragment {
        ToolCallFragment {
            index,
            id: id.map(String::from),
            kind: None,
            name: name.map(String::from),
            arguments: args.map(String::from),
        }
    }

    #[test]
    fn test_first_fragment_seeds_defaults() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&frag(0, None, None, None));
        let call = acc.get(0).unwrap();
        assert_eq!(call.id, "");
        assert_eq!(call.kind, "function");
        assert_eq!(call.function_name, "");
        assert_eq!(call.arguments_text, "");
    }

    #[test]
    fn test_arguments_append_and_fields_overwrite_only_when_present() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&frag(0, Some("call_1"), Some("get_weather"), Some("{\"ci")));
        acc.push(&frag(0, None, None, Some("ty\":\"NY")));
        acc.push(&frag(0, Some("call_1b"), None, Some("C\"}")));

        let call = acc.get(0).unwrap();
        assert_eq!(call.id, "call_1b");
        assert_eq!(call.function_name, "get_weather");
        assert_eq!(call.arguments_text, "{\"city\":\"NYC\"}");
    }

    #[test]
    fn test_snapshot_sorted_by_index() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&frag(2, Some("c"), Some("third"), Some("{}")));
        acc.push(&frag(0, Some("a"), Some("first"), Some("{}")));
        acc.push(&frag(1, Some("b"), Some("second"), Some("{}")));

        let names: Vec<_> = acc
            .snapshot()
            .into_iter()
            .map(|(_, c)| c.function_name)
            .collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert_eq!(acc.len(), 3);
    }

    #[test]
    fn test_subchunking_yields_identical_arguments() {
        let full = "{\"path\": \"/tmp/ünïcode\", \"depth\": 3}";

        let mut whole = ToolCallAccumulator::new();
        whole.push(&frag(0, Some("id"), Some("ls"), Some(full)));

        let chars: Vec<char> = full.chars().collect();
        for size in 1..=5 {
            let mut split = ToolCallAccumulator::new();
            split.push(&frag(0, Some("id"), Some("ls"), None));
            for piece in chars.chunks(size) {
                let piece: String = piece.iter().collect();
                split.push(&frag(0, None, None, Some(&piece)));
            }
            assert_eq!(
                split.get(0).unwrap().arguments_text,
                whole.get(0).unwrap().arguments_text,
                "chunk size {size}"
            );
        }
    }

    #[test]
    fn test_no_json_validation() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&frag(0, Some("x"), Some("broken"), Some("{not json")));
        assert_eq!(acc.get(0).unwrap().arguments_text, "{not json");
        assert!(!acc.is_empty());
    }
}
