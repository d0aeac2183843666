//! Tool digests, call signatures and the working-memory summary.
//!
//! Digests are short, single-line records of what each tool call returned.
//! The most recent ones are rendered into one system entry so the model keeps
//! seeing results even after history pruning has stubbed the full content.

use std::collections::VecDeque;

use sha2::{Digest, Sha256};

use crate::inference::types::ToolCall;

/// First line of the working-memory system entry. Used to find and replace it.
pub const WORKING_MEMORY_HEADER: &str = "[Working memory]";

/// Hex characters of the argument hash kept in a tool signature.
const SIGNATURE_HASH_LEN: usize = 16;

// ─── Text helpers ───────────────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Keep the first `max_chars` characters, appending `marker` when cut.
pub(crate) fn truncate_chars(s: &str, max_chars: usize, marker: &str) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((byte_idx, _)) => {
            let mut out = truncate_utf8(s, byte_idx).to_string();
            out.push_str(marker);
            out
        }
    }
}

/// Lowercase hex SHA-256 of `text`.
pub fn hash_text(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

// ─── Signatures ─────────────────────────────────────────────────────────────

/// `name#<first 16 hex of sha256(arguments_text)>`.
///
/// Hashes the raw argument text, so semantically identical calls that differ
/// only in key order or whitespace get different signatures.
pub fn tool_signature(name: &str, arguments_text: &str) -> String {
    let hash = hash_text(arguments_text);
    format!("{name}#{}", &hash[..SIGNATURE_HASH_LEN])
}

/// Order-independent signature for a batch: sorted call signatures joined by `|`.
pub fn batch_signature(calls: &[ToolCall]) -> String {
    let mut signatures: Vec<String> = calls
        .iter()
        .map(|c| tool_signature(&c.name, &c.arguments_text))
        .collect();
    signatures.sort();
    signatures.join("|")
}

// ─── Digests ────────────────────────────────────────────────────────────────

/// Compact record of one tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDigest {
    pub signature: String,
    pub name: String,
    pub ok: bool,
    pub summary: String,
}

impl ToolDigest {
    /// Build a digest, flattening `content` to one line of at most `summary_chars`.
    pub fn new(call: &ToolCall, ok: bool, content: &str, summary_chars: usize) -> Self {
        let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
        Self {
            signature: tool_signature(&call.name, &call.arguments_text),
            name: call.name.clone(),
            ok,
            summary: truncate_chars(&flat, summary_chars, "…"),
        }
    }
}

/// Bounded, append-only list of digests for one turn.
#[derive(Debug, Clone)]
pub struct WorkingMemory {
    digests: VecDeque<ToolDigest>,
    capacity: usize,
}

impl WorkingMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            digests: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record a digest, evicting the oldest beyond capacity.
    pub fn record(&mut self, digest: ToolDigest) {
        if self.digests.len() == self.capacity {
            self.digests.pop_front();
        }
        self.digests.push_back(digest);
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// The last `window` digests, oldest first.
    pub fn recent(&self, window: usize) -> impl Iterator<Item = &ToolDigest> {
        let skip = self.digests.len().saturating_sub(window);
        self.digests.iter().skip(skip)
    }

    /// Render the working-memory system entry, or `None` when there is nothing to show.
    pub fn render(&self, window: usize) -> Option<String> {
        if self.digests.is_empty() || window == 0 {
            return None;
        }
        let mut out = String::from(WORKING_MEMORY_HEADER);
        out.push_str("\nRecent tool results (oldest first):");
        for digest in self.recent(window) {
            let status = if digest.ok { "ok" } else { "error" };
            out.push_str(&format!("\n- {} [{status}]: {}", digest.name, digest.summary));
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &str) -> ToolCall {
        ToolCall {
            id: format!("call_{name}"),
            name: name.into(),
            arguments_text: args.into(),
            arguments: serde_json::from_str(args).ok(),
        }
    }

    #[test]
    fn test_truncate_utf8_multibyte() {
        let s = "hello 世界";
        assert_eq!(truncate_utf8(s, 6), "hello ");
        assert_eq!(truncate_utf8(s, 7), "hello ");
        assert_eq!(truncate_utf8(s, 9), "hello 世");
        assert_eq!(truncate_utf8(s, 100), s);
    }

    #[test]
    fn test_truncate_chars_counts_characters() {
        assert_eq!(truncate_chars("日本語テキスト", 3, "…"), "日本語…");
        assert_eq!(truncate_chars("short", 10, "…"), "short");
        assert_eq!(truncate_chars("exact", 5, "…"), "exact");
    }

    #[test]
    fn test_signature_format() {
        let sig = tool_signature("get_weather", "{\"city\":\"NYC\"}");
        let (name, hash) = sig.split_once('#').unwrap();
        assert_eq!(name, "get_weather");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_uses_raw_text() {
        assert_ne!(
            tool_signature("f", "{\"a\":1,\"b\":2}"),
            tool_signature("f", "{\"b\":2,\"a\":1}")
        );
    }

    #[test]
    fn test_batch_signature_is_order_independent() {
        let a = call("read", "{\"path\":\"a\"}");
        let b = call("read", "{\"path\":\"b\"}");
        assert_eq!(
            batch_signature(&[a.clone(), b.clone()]),
            batch_signature(&[b, a])
        );
    }

    #[test]
    fn test_digest_flattens_and_truncates() {
        let digest = ToolDigest::new(&call("ls", "{}"), true, "a\n  b\tc", 240);
        assert_eq!(digest.summary, "a b c");
        let long = "x".repeat(500);
        let digest = ToolDigest::new(&call("ls", "{}"), false, &long, 10);
        assert_eq!(digest.summary.chars().count(), 11);
        assert!(digest.summary.ends_with('…'));
    }

    #[test]
    fn test_working_memory_window_and_capacity() {
        let mut memory = WorkingMemory::new(3);
        assert!(memory.render(8).is_none());
        for i in 0..5 {
            memory.record(ToolDigest::new(
                &call(&format!("t{i}"), "{}"),
                i % 2 == 0,
                "out",
                50,
            ));
        }
        assert_eq!(memory.len(), 3);
        let names: Vec<_> = memory.recent(2).map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["t3", "t4"]);

        let rendered = memory.render(8).unwrap();
        assert!(rendered.starts_with(WORKING_MEMORY_HEADER));
        assert!(rendered.contains("- t2 [ok]: out"));
        assert!(rendered.contains("- t3 [error]: out"));
        assert!(!rendered.contains("t1"));
    }
}
