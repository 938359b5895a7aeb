//! Discrete time spans and span sets
//!
//! `TimeRange` is an inclusive span of frame numbers that may be open-ended
//! (`end == None` means "to infinity"). `FrameSet` is a normalized union of
//! spans, kept sorted and non-overlapping.
//!
//! **Used by**: FrameCache::invalidate, candidate scanning in the populator,
//! keyframe skip-range derivation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive span of frames. `end == None` = infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    start: i32,
    end: Option<i32>,
}

impl TimeRange {
    /// Finite span `[start, end]`. Swapped bounds are normalized.
    pub fn new(start: i32, end: i32) -> Self {
        Self {
            start: start.min(end),
            end: Some(start.max(end)),
        }
    }

    /// Open-ended span `[start, ∞)`
    pub fn infinite_from(start: i32) -> Self {
        Self { start, end: None }
    }

    /// Span covering exactly one frame
    pub fn single(time: i32) -> Self {
        Self::new(time, time)
    }

    pub fn start(&self) -> i32 {
        self.start
    }

    /// Last frame, or None for infinite spans
    pub fn end(&self) -> Option<i32> {
        self.end
    }

    pub fn is_infinite(&self) -> bool {
        self.end.is_none()
    }

    pub fn contains(&self, time: i32) -> bool {
        time >= self.start && self.end.is_none_or(|end| time <= end)
    }

    /// Number of frames, None when infinite
    pub fn len(&self) -> Option<usize> {
        self.end.map(|end| (end as i64 - self.start as i64 + 1) as usize)
    }

    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = match (self.end, other.end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        match end {
            Some(end) if end < start => None,
            _ => Some(TimeRange { start, end }),
        }
    }

    /// Touching or overlapping spans can be merged into one
    fn adjoins(&self, other: &TimeRange) -> bool {
        let (first, second) = if self.start <= other.start { (self, other) } else { (other, self) };
        match first.end {
            None => true,
            Some(end) => (second.start as i64) <= end as i64 + 1,
        }
    }

    fn merge(&self, other: &TimeRange) -> TimeRange {
        let end = match (self.end, other.end) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        TimeRange {
            start: self.start.min(other.start),
            end,
        }
    }

    /// Iterate frames in increasing order. Infinite spans are clipped to `limit`.
    pub fn frames_until(&self, limit: i32) -> impl Iterator<Item = i32> {
        let end = self.end.map_or(limit, |end| end.min(limit));
        self.start..=end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}..{}]", self.start, end),
            None => write!(f, "[{}..inf)", self.start),
        }
    }
}

/// Sorted, non-overlapping union of time ranges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSet {
    spans: Vec<TimeRange>,
}

impl FrameSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_range(range: TimeRange) -> Self {
        Self { spans: vec![range] }
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = TimeRange>) -> Self {
        let mut set = Self::empty();
        for range in ranges {
            set.add(range);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn spans(&self) -> &[TimeRange] {
        &self.spans
    }

    pub fn contains(&self, time: i32) -> bool {
        self.spans.iter().any(|span| span.contains(time))
    }

    pub fn is_infinite(&self) -> bool {
        self.spans.last().is_some_and(|span| span.is_infinite())
    }

    /// Insert a span, merging with any neighbour it touches
    pub fn add(&mut self, range: TimeRange) {
        let mut merged = range;
        let mut kept = Vec::with_capacity(self.spans.len() + 1);
        for span in self.spans.drain(..) {
            if span.adjoins(&merged) {
                merged = merged.merge(&span);
            } else {
                kept.push(span);
            }
        }
        kept.push(merged);
        kept.sort_by_key(|span| span.start);
        self.spans = kept;
    }

    pub fn union(&self, other: &FrameSet) -> FrameSet {
        let mut out = self.clone();
        for span in &other.spans {
            out.add(*span);
        }
        out
    }

    /// Restrict the set to `range`
    pub fn clip(&self, range: &TimeRange) -> FrameSet {
        FrameSet {
            spans: self.spans.iter().filter_map(|span| span.intersect(range)).collect(),
        }
    }
}

impl fmt::Display for FrameSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.spans.is_empty() {
            return write!(f, "{{}}");
        }
        let parts: Vec<String> = self.spans.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", parts.join(" + "))
    }
}
