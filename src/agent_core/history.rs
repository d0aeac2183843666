//! Shapes the history sent with each request.
//!
//! The loop keeps the full history; every request gets a pruned copy with
//! the current working-memory entry inserted. The entry only ever lives in
//! that copy, so caller messages are never matched or rewritten. Pruning
//! never produces a window that starts with a tool result whose assistant
//! tool-call message was cut.

use crate::inference::config::ContextSettings;
use crate::inference::types::ChatMessage;

/// Replacement content for old tool results.
pub const STUB_TOOL_RESULT: &str = "[Earlier tool result omitted. See working memory.]";

/// Request copy of `history` with the working-memory system entry placed
/// right after the leading system messages. `None` leaves the copy as is.
pub fn with_working_memory(history: &[ChatMessage], rendered: Option<String>) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    let leading = history
        .iter()
        .take_while(|m| matches!(m, ChatMessage::System { .. }))
        .count();
    messages.extend_from_slice(&history[..leading]);
    if let Some(content) = rendered {
        messages.push(ChatMessage::system(content));
    }
    messages.extend_from_slice(&history[leading..]);
    messages
}

/// Total approximate size of a history in characters.
pub fn history_chars(history: &[ChatMessage]) -> usize {
    history.iter().map(ChatMessage::char_len).sum()
}

/// Prune a copy of `history` to fit `settings.char_budget`.
///
/// 1. Tool results older than the last `tool_result_keep` are stubbed.
/// 2. If still over budget, keep every system message plus the most recent
///    `keep_recent_messages` others.
pub fn prune(history: &[ChatMessage], settings: &ContextSettings) -> Vec<ChatMessage> {
    let mut pruned = history.to_vec();
    let before = history_chars(&pruned);
    if before <= settings.char_budget {
        return pruned;
    }

    stub_old_tool_results(&mut pruned, settings.tool_result_keep);
    let after_stub = history_chars(&pruned);
    if after_stub <= settings.char_budget {
        tracing::debug!(before, after = after_stub, "stubbed old tool results");
        return pruned;
    }

    let windowed = recent_window(pruned, settings.keep_recent_messages);
    tracing::debug!(
        before,
        after = history_chars(&windowed),
        messages = windowed.len(),
        "history windowed to recent messages"
    );
    windowed
}

fn stub_old_tool_results(history: &mut [ChatMessage], keep: usize) {
    let total = history
        .iter()
        .filter(|m| matches!(m, ChatMessage::ToolResult { .. }))
        .count();
    let mut to_stub = total.saturating_sub(keep);
    for message in history.iter_mut() {
        if to_stub == 0 {
            break;
        }
        if let ChatMessage::ToolResult { content, .. } = message {
            *content = STUB_TOOL_RESULT.to_string();
            to_stub -= 1;
        }
    }
}

fn recent_window(history: Vec<ChatMessage>, keep_recent: usize) -> Vec<ChatMessage> {
    let (system, rest): (Vec<_>, Vec<_>) = history
        .into_iter()
        .partition(|m| matches!(m, ChatMessage::System { .. }));

    let start = rest.len().saturating_sub(keep_recent);
    let mut window: Vec<ChatMessage> = rest
        .into_iter()
        .skip(start)
        .skip_while(|m| matches!(m, ChatMessage::ToolResult { .. }))
        .collect();

    let mut out = system;
    out.append(&mut window);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::memory::WORKING_MEMORY_HEADER;
    use crate::inference::types::{FunctionCallResponse, ToolCallResponse};

    fn tool_call_msg(id: &str) -> ChatMessage {
        ChatMessage::Assistant {
            content: None,
            tool_calls: vec![ToolCallResponse {
                id: id.into(),
                r#type: "function".into(),
                function: FunctionCallResponse {
                    name: "read".into(),
                    arguments: "{}".into(),
                },
            }],
        }
    }

    fn settings(budget: usize) -> ContextSettings {
        ContextSettings {
            char_budget: budget,
            tool_result_keep: 1,
            keep_recent_messages: 3,
            ..ContextSettings::default()
        }
    }

    #[test]
    fn test_working_memory_inserted_after_leading_system() {
        let history = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let with = with_working_memory(&history, Some(format!("{WORKING_MEMORY_HEADER}\n- a")));
        assert_eq!(with.len(), 3);
        assert_eq!(with[0], ChatMessage::system("sys"));
        assert!(with[1].content().unwrap().ends_with("- a"));
        assert_eq!(with[2], ChatMessage::user("hi"));

        assert_eq!(with_working_memory(&history, None), history);
    }

    #[test]
    fn test_caller_system_prompt_with_header_text_is_kept() {
        let own = ChatMessage::system(format!("{WORKING_MEMORY_HEADER} is what I call my notes."));
        let history = vec![own.clone(), ChatMessage::user("hi")];

        let without = with_working_memory(&history, None);
        assert_eq!(without, history);

        let with = with_working_memory(&history, Some(format!("{WORKING_MEMORY_HEADER}\n- a")));
        assert_eq!(with.len(), 3);
        assert_eq!(with[0], own);
        assert!(with[1].content().unwrap().ends_with("- a"));
    }

    #[test]
    fn test_under_budget_untouched() {
        let history = vec![ChatMessage::user("hi"), ChatMessage::tool_result("c1", "x")];
        assert_eq!(prune(&history, &settings(10_000)), history);
    }

    #[test]
    fn test_old_tool_results_stubbed_first() {
        let big = "r".repeat(200);
        let history = vec![
            ChatMessage::user("go"),
            tool_call_msg("c1"),
            ChatMessage::tool_result("c1", big.clone()),
            tool_call_msg("c2"),
            ChatMessage::tool_result("c2", "small"),
        ];
        let pruned = prune(&history, &settings(150));
        assert_eq!(pruned.len(), history.len());
        assert_eq!(pruned[2].content(), Some(STUB_TOOL_RESULT));
        assert_eq!(pruned[4].content(), Some("small"));
    }

    #[test]
    fn test_window_keeps_system_and_skips_orphan_tool_result() {
        let big = "u".repeat(500);
        let history = vec![
            ChatMessage::system("sys"),
            ChatMessage::user(big),
            tool_call_msg("c1"),
            ChatMessage::tool_result("c1", "res"),
            ChatMessage::user("next"),
            ChatMessage::assistant("reply"),
        ];
        let pruned = prune(&history, &settings(50));
        // Last three non-system: tool_result(c1), user, assistant. The orphan is dropped.
        assert_eq!(pruned.len(), 3);
        assert_eq!(pruned[0], ChatMessage::system("sys"));
        assert_eq!(pruned[1], ChatMessage::user("next"));
        assert!(history_chars(&pruned) <= history_chars(&history));
    }
}
