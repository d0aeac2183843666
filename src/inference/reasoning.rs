//! Separates "thinking" output from the final answer text.
//!
//! Two encodings exist in the wild:
//! - a side channel (`reasoning_content` / `reasoning` deltas), and
//! - inline tags inside the ordinary content stream (`<think>…</think>`).
//!
//! Both are normalized into [`Segment`]s in arrival order. Grouping segments
//! into blocks (a block closes as soon as answer text or a tool call shows
//! up) is done by the [`PartsAssembler`](super::parts::PartsAssembler).

use super::parts::PartsAssembler;
use super::types::Delta;

pub const DEFAULT_OPEN_TAG: &str = "<think>";
pub const DEFAULT_CLOSE_TAG: &str = "</think>";

/// One piece of classified output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Reasoning(String),
    Text(String),
    /// A tool-call fragment was observed; closes any open reasoning block.
    Boundary,
}

/// Streaming splitter for one response.
#[derive(Debug, Clone)]
pub struct ReasoningSplitter {
    open_tag: String,
    close_tag: String,
    inside_tag: bool,
    /// Tail of the content stream that may be the start of a tag.
    carry: String,
}

impl Default for ReasoningSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_OPEN_TAG, DEFAULT_CLOSE_TAG)
    }
}

impl ReasoningSplitter {
    pub fn new(open_tag: impl Into<String>, close_tag: impl Into<String>) -> Self {
        Self {
            open_tag: open_tag.into(),
            close_tag: close_tag.into(),
            inside_tag: false,
            carry: String::new(),
        }
    }

    /// Classify one delta. Reasoning comes first, then content, then tool calls.
    pub fn feed(&mut self, delta: &Delta) -> Vec<Segment> {
        let mut out = Vec::new();

        if let Some(ref reasoning) = delta.reasoning {
            push_merged(&mut out, Segment::Reasoning(reasoning.clone()));
        }

        if let Some(ref content) = delta.content {
            for segment in self.split_content(content) {
                push_merged(&mut out, segment);
            }
        }

        if !delta.tool_calls.is_empty() {
            for segment in self.flush() {
                push_merged(&mut out, segment);
            }
            out.push(Segment::Boundary);
        }

        out
    }

    /// Release any held-back partial tag as ordinary output.
    pub fn flush(&mut self) -> Vec<Segment> {
        let carry = std::mem::take(&mut self.carry);
        if carry.is_empty() {
            Vec::new()
        } else {
            vec![self.classify(carry)]
        }
    }

    fn split_content(&mut self, chunk: &str) -> Vec<Segment> {
        let mut out = Vec::new();
        let mut buf = std::mem::take(&mut self.carry);
        buf.push_str(chunk);

        loop {
            let tag = if self.inside_tag {
                &self.close_tag
            } else {
                &self.open_tag
            };

            if let Some(pos) = buf.find(tag.as_str()) {
                let tag_len = tag.len();
                let before = buf[..pos].to_string();
                if !before.is_empty() {
                    out.push(self.classify(before));
                }
                buf.drain(..pos + tag_len);
                self.inside_tag = !self.inside_tag;
                continue;
            }

            let keep = partial_tag_suffix_len(&buf, tag);
            let emit_len = buf.len() - keep;
            if emit_len > 0 {
                let emit = buf[..emit_len].to_string();
                out.push(self.classify(emit));
            }
            self.carry = buf[emit_len..].to_string();
            break;
        }

        out
    }

    fn classify(&self, text: String) -> Segment {
        if self.inside_tag {
            Segment::Reasoning(text)
        } else {
            Segment::Text(text)
        }
    }
}

/// Length in bytes of the longest suffix of `buf` that is a proper prefix of `tag`.
fn partial_tag_suffix_len(buf: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(buf.len());
    (1..=max)
        .rev()
        .find(|&n| {
            let start = buf.len() - n;
            buf.is_char_boundary(start) && tag.starts_with(&buf[start..])
        })
        .unwrap_or(0)
}

fn push_merged(out: &mut Vec<Segment>, segment: Segment) {
    match (out.last_mut(), segment) {
        (Some(Segment::Reasoning(prev)), Segment::Reasoning(next)) => prev.push_str(&next),
        (Some(Segment::Text(prev)), Segment::Text(next)) => prev.push_str(&next),
        (_, segment) => out.push(segment),
    }
}

// ─── Whole-turn split ────────────────────────────────────────────────────────

/// Reasoning blocks and answer text for one complete turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Split {
    pub reasoning_blocks: Vec<String>,
    pub text: String,
}

/// Split every delta of one turn, in order, into reasoning blocks and text.
pub fn split_deltas(deltas: &[Delta], splitter: ReasoningSplitter) -> Split {
    let mut splitter = splitter;
    let mut assembler = PartsAssembler::new();
    for delta in deltas {
        for segment in splitter.feed(delta) {
            assembler.apply(segment);
        }
    }
    for segment in splitter.flush() {
        assembler.apply(segment);
    }
    Split {
        reasoning_blocks: assembler.reasoning_blocks().to_vec(),
        text: assembler.text().to_string(),
    }
}
