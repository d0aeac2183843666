//! Wall-clock timing of reasoning segments.
//!
//! Each assistant message may think several times (reasoning, tool call,
//! more reasoning). Every stretch of reasoning is one segment, numbered by
//! how many segments of that message closed before it started. The UI reads
//! durations from here to show "thought for 3.2s" per block.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Receiver of streaming timing events. Fire-and-forget.
pub trait TimingObserver: Send + Sync {
    /// Reasoning output was seen. Opens a segment unless one is already open.
    fn reasoning_started(&self, message_id: &str);
    /// Answer text or a tool call was seen. Closes the open segment, if any.
    fn boundary_reached(&self, message_id: &str);
    /// The stream ended (normally, with an error, or cancelled).
    fn end_of_message(&self, message_id: &str);
}

/// One timed reasoning stretch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingSegment {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TimingSegment {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Default)]
struct MessageTiming {
    segments: Vec<TimingSegment>,
}

impl MessageTiming {
    fn open_segment(&mut self) -> Option<&mut TimingSegment> {
        self.segments.last_mut().filter(|s| s.is_open())
    }
}

/// Per-conversation timing store, shareable via `Arc`.
#[derive(Debug, Default)]
pub struct TimingTracker {
    messages: Mutex<HashMap<String, MessageTiming>>,
}

impl TimingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_messages<R>(&self, f: impl FnOnce(&mut HashMap<String, MessageTiming>) -> R) -> R {
        // Segments stay consistent even if a holder panicked.
        let mut guard = self
            .messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    fn open(&self, message_id: &str, now: DateTime<Utc>) {
        self.with_messages(|messages| {
            let timing = messages.entry(message_id.to_string()).or_default();
            if timing.open_segment().is_none() {
                timing.segments.push(TimingSegment {
                    started_at: now,
                    ended_at: None,
                });
            }
        });
    }

    fn close(&self, message_id: &str, now: DateTime<Utc>) {
        self.with_messages(|messages| {
            if let Some(segment) = messages
                .get_mut(message_id)
                .and_then(MessageTiming::open_segment)
            {
                segment.ended_at = Some(now);
            }
        });
    }

    pub fn segment(&self, message_id: &str, index: usize) -> Option<TimingSegment> {
        self.with_messages(|messages| {
            messages
                .get(message_id)
                .and_then(|t| t.segments.get(index))
                .copied()
        })
    }

    /// Duration of a closed segment. `None` when unknown or still open.
    pub fn segment_duration(&self, message_id: &str, index: usize) -> Option<Duration> {
        let segment = self.segment(message_id, index)?;
        let ended_at = segment.ended_at?;
        (ended_at - segment.started_at).to_std().ok()
    }

    /// Like [`segment_duration`](Self::segment_duration), but an open segment
    /// reports the time since it started.
    pub fn elapsed(&self, message_id: &str, index: usize) -> Option<Duration> {
        let segment = self.segment(message_id, index)?;
        let end = segment.ended_at.unwrap_or_else(Utc::now);
        (end - segment.started_at).to_std().ok()
    }

    pub fn segment_count(&self, message_id: &str) -> usize {
        self.with_messages(|messages| messages.get(message_id).map_or(0, |t| t.segments.len()))
    }

    /// Whether the message currently has an open segment.
    pub fn is_open(&self, message_id: &str) -> bool {
        self.with_messages(|messages| {
            messages
                .get_mut(message_id)
                .is_some_and(|t| t.open_segment().is_some())
        })
    }

    pub fn clear_message(&self, message_id: &str) {
        self.with_messages(|messages| {
            messages.remove(message_id);
        });
    }

    pub fn clear_all(&self) {
        self.with_messages(HashMap::clear);
    }
}

impl TimingObserver for TimingTracker {
    fn reasoning_started(&self, message_id: &str) {
        self.open(message_id, Utc::now());
    }

    fn boundary_reached(&self, message_id: &str) {
        self.close(message_id, Utc::now());
    }

    fn end_of_message(&self, message_id: &str) {
        self.close(message_id, Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_segments_numbered_by_closed_count() {
        let tracker = TimingTracker::new();
        let t0 = Utc::now();
        tracker.open("m", t0);
        tracker.open("m", t0 + TimeDelta::milliseconds(5));
        tracker.close("m", t0 + TimeDelta::milliseconds(100));
        tracker.open("m", t0 + TimeDelta::milliseconds(200));
        tracker.close("m", t0 + TimeDelta::milliseconds(250));

        assert_eq!(tracker.segment_count("m"), 2);
        assert_eq!(
            tracker.segment_duration("m", 0),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            tracker.segment_duration("m", 1),
            Some(Duration::from_millis(50))
        );
        assert!(!tracker.is_open("m"));
    }

    #[test]
    fn test_open_segment_has_no_duration_but_elapsed() {
        let tracker = TimingTracker::new();
        tracker.open("m", Utc::now() - TimeDelta::milliseconds(30));
        assert!(tracker.is_open("m"));
        assert_eq!(tracker.segment_duration("m", 0), None);
        assert!(tracker.elapsed("m", 0).unwrap() >= Duration::from_millis(30));
    }

    #[test]
    fn test_unknown_lookups() {
        let tracker = TimingTracker::new();
        assert_eq!(tracker.segment_duration("nope", 0), None);
        assert_eq!(tracker.elapsed("nope", 3), None);
        assert_eq!(tracker.segment_count("nope"), 0);
        tracker.boundary_reached("nope");
        assert_eq!(tracker.segment_count("nope"), 0);
    }

    #[test]
    fn test_end_of_message_closes_open_segment() {
        let tracker = TimingTracker::new();
        tracker.reasoning_started("m");
        tracker.end_of_message("m");
        assert!(!tracker.is_open("m"));
        assert!(tracker.segment_duration("m", 0).is_some());
    }

    #[test]
    fn test_messages_are_independent_and_clearable() {
        let tracker = TimingTracker::new();
        tracker.reasoning_started("a");
        tracker.reasoning_started("b");
        tracker.boundary_reached("a");
        assert!(!tracker.is_open("a"));
        assert!(tracker.is_open("b"));

        tracker.clear_message("a");
        assert_eq!(tracker.segment_count("a"), 0);
        assert_eq!(tracker.segment_count("b"), 1);

        tracker.clear_all();
        assert_eq!(tracker.segment_count("b"), 0);
    }
}
