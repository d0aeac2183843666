//! SSE frame parser for OpenAI-compatible chat completion streams.
//!
//! Reads the HTTP body as raw bytes, splits it into newline-delimited lines,
//! strips the `data:` transport prefix (up to two levels, since some proxies
//! re-wrap an already framed upstream stream) and turns each JSON payload into
//! a normalized [`Delta`].
//!
//! Bytes are buffered until a full line is available, so a multi-byte UTF-8
//! sequence split across two network reads is decoded only once it is whole.
//! A payload that is cut in the middle of a JSON value is held back and glued
//! to the next payload before parsing again.

use futures::stream::{self, Stream, StreamExt};

use super::errors::InferenceError;
use super::types::{ChatCompletionChunk, Delta};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Sentinel payload that ends the stream.
const DONE_SENTINEL: &str = "[DONE]";

/// Upper bound for a held-back partial JSON payload.
const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Maximum number of nested `data:` prefixes stripped from one line.
const MAX_PREFIX_DEPTH: usize = 2;

// ─── Frame ───────────────────────────────────────────────────────────────────

/// One unit of parser output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Delta(Delta),
    /// The sentinel was seen; nothing after it is parsed.
    Done,
}

// ─── FrameParser ─────────────────────────────────────────────────────────────

/// Incremental, push-based SSE parser.
#[derive(Debug, Default)]
pub struct FrameParser {
    /// Bytes of the current, not yet terminated line.
    line_buf: Vec<u8>,
    /// Payload that looked like the start of a JSON value but did not parse.
    pending_json: String,
    done: bool,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes and collect every frame completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        if self.done {
            return frames;
        }

        let mut rest = bytes;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.line_buf.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];

            let line = std::mem::take(&mut self.line_buf);
            self.process_line(&line, &mut frames);
            if self.done {
                return frames;
            }
        }
        self.line_buf.extend_from_slice(rest);
        frames
    }

    /// Flush the trailing unterminated line at end of stream.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        if self.done {
            return frames;
        }
        let line = std::mem::take(&mut self.line_buf);
        if !line.is_empty() {
            self.process_line(&line, &mut frames);
        }
        if !self.pending_json.is_empty() {
            tracing::debug!(
                bytes = self.pending_json.len(),
                "dropping incomplete JSON payload at end of stream"
            );
            self.pending_json.clear();
        }
        frames
    }

    fn process_line(&mut self, raw: &[u8], frames: &mut Vec<Frame>) {
        let decoded = String::from_utf8_lossy(raw);
        let line = decoded.strip_suffix('\r').unwrap_or(decoded.as_ref());

        if line.trim().is_empty() || line.starts_with(':') {
            return; // event separator or comment
        }

        let Some(payload) = strip_data_prefix(line) else {
            // `event:`, `id:`, `retry:` and anything else outside the data field
            return;
        };

        if payload.trim() == DONE_SENTINEL {
            self.done = true;
            self.pending_json.clear();
            self.line_buf.clear();
            frames.push(Frame::Done);
            return;
        }

        if let Some(delta) = self.parse_payload(payload) {
            if !delta.is_empty() {
                frames.push(Frame::Delta(delta));
            }
        }
    }

    /// Parse one data payload, joining it with a held-back fragment if needed.
    fn parse_payload(&mut self, payload: &str) -> Option<Delta> {
        if !self.pending_json.is_empty() {
            let joined = format!("{}{payload}", self.pending_json);
            if let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(&joined) {
                self.pending_json.clear();
                return Some(chunk.into_delta());
            }
            if let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(payload) {
                tracing::debug!(
                    dropped_bytes = self.pending_json.len(),
                    "discarding held-back fragment superseded by a complete frame"
                );
                self.pending_json.clear();
                return Some(chunk.into_delta());
            }
            self.hold(joined);
            return None;
        }

        match serde_json::from_str::<ChatCompletionChunk>(payload) {
            Ok(chunk) => Some(chunk.into_delta()),
            Err(e) if looks_like_json_start(payload) => {
                tracing::debug!(error = %e, "holding back partial JSON payload");
                self.hold(payload.to_string());
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, payload, "skipping malformed frame");
                None
            }
        }
    }

    fn hold(&mut self, fragment: String) {
        if fragment.len() > MAX_PENDING_BYTES {
            tracing::warn!(
                bytes = fragment.len(),
                "held-back JSON payload exceeded limit, dropping it"
            );
            self.pending_json.clear();
        } else {
            self.pending_json = fragment;
        }
    }
}

/// Strip up to [`MAX_PREFIX_DEPTH`] nested `data:` prefixes, each followed
/// by at most one space. The rest of the payload is returned byte-exact so a
/// JSON value split across frames rejoins unchanged.
///
/// Returns `None` when the line is not a data line at all.
fn strip_data_prefix(line: &str) -> Option<&str> {
    fn field(s: &str) -> Option<&str> {
        let value = s.strip_prefix("data:")?;
        Some(value.strip_prefix(' ').unwrap_or(value))
    }
    let mut current = field(line)?;
    for _ in 1..MAX_PREFIX_DEPTH {
        match field(current) {
            Some(inner) => current = inner,
            None => break,
        }
    }
    Some(current)
}

fn looks_like_json_start(payload: &str) -> bool {
    matches!(payload.trim_start().chars().next(), Some('{') | Some('['))
}

// ─── Stream adapter ──────────────────────────────────────────────────────────

/// Turn a byte stream into a lazy stream of [`Delta`]s.
///
/// The stream ends at the `[DONE]` sentinel or when the body ends. Transport
/// errors are forwarded once and end the stream; malformed frames are skipped.
pub fn delta_stream<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<Delta, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let state = DeltaStreamState {
        bytes: byte_stream,
        parser: FrameParser::new(),
        ready: std::collections::VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.ready.pop_front() {
                match frame {
                    Frame::Delta(delta) => return Some((Ok(delta), state)),
                    Frame::Done => {
                        state.ready.clear();
                        state.finished = true;
                        return None;
                    }
                }
            }

            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    let frames = state.parser.push(bytes.as_ref());
                    state.ready.extend(frames);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((
                        Err(InferenceError::StreamError {
                            reason: format!("stream read error: {e}"),
                        }),
                        state,
                    ));
                }
                None => {
                    let frames = state.parser.finish();
                    state.ready.extend(frames);
                    state.finished = true;
                }
            }
        }
    })
}

struct DeltaStreamState<S> {
    bytes: S,
    parser: FrameParser,
    ready: std::collections::VecDeque<Frame>,
    finished: bool,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::FinishReason;

    fn content_frame(text: &str) -> String {
        let payload = serde_json::json!({"choices":[{"delta":{"content":text}}]});
        format!("data: {payload}\n\n")
    }

    fn collect_text(frames: &[Frame]) -> String {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Delta(d) => d.content.clone(),
                Frame::Done => None,
            })
            .collect()
    }

    fn parse_chunked(body: &[u8], split_points: &[usize]) -> Vec<Frame> {
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        let mut start = 0;
        for &p in split_points {
            frames.extend(parser.push(&body[start..p]));
            start = p;
        }
        frames.extend(parser.push(&body[start..]));
        frames.extend(parser.finish());
        frames
    }

    #[test]
    fn test_single_content_frame() {
        let mut parser = FrameParser::new();
        let frames = parser.push(content_frame("Hello").as_bytes());
        assert_eq!(collect_text(&frames), "Hello");
    }

    #[test]
    fn test_chunking_at_every_byte_preserves_text() {
        let text = "héllo wörld 日本語 🚀 {\"json\": [1,2]}";
        let mut body = String::new();
        for piece in ["héllo ", "wörld 日本語 ", "🚀 ", "{\"json\": [1,2]}"] {
            body.push_str(&content_frame(piece));
        }
        body.push_str("data: [DONE]\n\n");
        let bytes = body.as_bytes();

        let whole = collect_text(&parse_chunked(bytes, &[]));
        assert_eq!(whole, text);

        for split in 1..bytes.len() {
            let chunked = collect_text(&parse_chunked(bytes, &[split]));
            assert_eq!(chunked, text, "split at byte {split}");
        }
    }

    #[test]
    fn test_chunking_at_many_points_preserves_text() {
        let body = format!(
            "{}{}{}data: [DONE]\n",
            content_frame("α"),
            content_frame("βγ"),
            content_frame("δ")
        );
        let bytes = body.as_bytes();
        let splits: Vec<usize> = (1..bytes.len()).step_by(3).collect();
        assert_eq!(collect_text(&parse_chunked(bytes, &splits)), "αβγδ");
    }

    #[test]
    fn test_nested_data_prefix_is_stripped() {
        let mut parser = FrameParser::new();
        let frames = parser.push(
            b"data: data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\ndata:data:[DONE]\n",
        );
        assert_eq!(frames.len(), 2);
        assert_eq!(collect_text(&frames), "x");
        assert_eq!(frames[1], Frame::Done);
    }

    #[test]
    fn test_json_split_across_frames_is_rejoined() {
        let mut parser = FrameParser::new();
        let mut frames = parser.push(b"data: {\"choices\":[{\"delta\":{\"cont\n");
        assert!(frames.is_empty());
        frames.extend(parser.push(b"data: ent\":\"joined\"}}]}\n\n"));
        assert_eq!(collect_text(&frames), "joined");
    }

    #[test]
    fn test_split_next_to_space_keeps_whitespace() {
        let mut parser = FrameParser::new();
        let mut frames = parser.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"hello \n");
        assert!(frames.is_empty());
        frames.extend(parser.push(b"data: world\"}}]}\n\n"));
        assert_eq!(collect_text(&frames), "hello world");

        let mut parser = FrameParser::new();
        let mut frames = parser.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"hello\r\n");
        frames.extend(parser.push(b"data:  world\"}}]}\r\n\r\n"));
        assert_eq!(collect_text(&frames), "hello world");
    }

    #[test]
    fn test_held_fragment_dropped_when_next_frame_is_complete() {
        let mut parser = FrameParser::new();
        let mut frames = parser.push(b"data: {\"choices\":[{\"del\n");
        frames.extend(parser.push(content_frame("fresh").as_bytes()));
        assert_eq!(collect_text(&frames), "fresh");
    }

    #[test]
    fn test_heartbeats_and_comments_are_dropped() {
        let mut parser = FrameParser::new();
        let frames = parser.push(
            b": keep-alive\n\nevent: ping\ndata: {\"choices\":[{\"delta\":{}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n\n",
        );
        assert!(frames.is_empty());
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let mut parser = FrameParser::new();
        let mut frames = parser.push(b"data: not json at all\n\n");
        frames.extend(parser.push(content_frame("ok").as_bytes()));
        assert_eq!(collect_text(&frames), "ok");
    }

    #[test]
    fn test_sentinel_discards_trailing_input() {
        let mut parser = FrameParser::new();
        let body = format!("{}data: [DONE]\n\n{}", content_frame("a"), content_frame("b"));
        let frames = parser.push(body.as_bytes());
        assert_eq!(collect_text(&frames), "a");
        assert_eq!(frames.last(), Some(&Frame::Done));
        assert!(parser.is_done());
        assert!(parser.push(content_frame("c").as_bytes()).is_empty());
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut parser = FrameParser::new();
        let frames =
            parser.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"win\"}}]}\r\n\r\n");
        assert_eq!(collect_text(&frames), "win");
    }

    #[test]
    fn test_finish_reason_frame_kept() {
        let mut parser = FrameParser::new();
        let frames =
            parser.push(b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n");
        assert_eq!(
            frames,
            vec![Frame::Delta(Delta::finish(FinishReason::ToolCalls))]
        );
    }

    #[test]
    fn test_unterminated_last_line_flushed_on_finish() {
        let mut parser = FrameParser::new();
        let frames = parser.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}");
        assert!(frames.is_empty());
        assert_eq!(collect_text(&parser.finish()), "tail");
    }

    #[tokio::test]
    async fn test_delta_stream_yields_until_sentinel() {
        let body = format!(
            "{}{}data: [DONE]\n\n{}",
            content_frame("one "),
            content_frame("two"),
            content_frame("ignored")
        );
        let bytes = body.into_bytes();
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> =
            bytes.chunks(7).map(|c| Ok(c.to_vec())).collect();

        let deltas: Vec<_> = delta_stream(stream::iter(chunks)).collect().await;
        let text: String = deltas
            .into_iter()
            .map(|d| d.unwrap().content.unwrap_or_default())
            .collect();
        assert_eq!(text, "one two");
    }

    #[tokio::test]
    async fn test_delta_stream_propagates_transport_error() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(content_frame("partial").into_bytes()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let items: Vec<_> = delta_stream(stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(InferenceError::StreamError { .. })));
    }

    #[tokio::test]
    async fn test_delta_stream_handles_missing_trailing_newline() {
        let chunks: Vec<Result<&[u8], std::io::Error>> = vec![Ok(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"end\"}}]}".as_slice(),
        )];
        let items: Vec<_> = delta_stream(stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().content.as_deref(), Some("end"));
    }
}
