//! Keyframe channels and the frames a keyframe edit touches.
//!
//! A channel holds keyframe times. Editing the content at `time` changes
//! every frame that shows the active keyframe at `time`: from that keyframe
//! up to the frame before the next one (or forever if it is the last).
//!
//! The populator uses the union of these spans over the active node's
//! channels as its skip range, so it does not regenerate frames that the
//! user is about to invalidate anyway.

use std::collections::BTreeSet;

use crate::core::time_range::{FrameSet, TimeRange};

#[derive(Debug, Clone, Default)]
pub struct KeyframeChannel {
    name: String,
    keys: BTreeSet<i32>,
}

impl KeyframeChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: BTreeSet::new(),
        }
    }

    pub fn with_keys(name: impl Into<String>, keys: impl IntoIterator<Item = i32>) -> Self {
        Self {
            name: name.into(),
            keys: keys.into_iter().collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_key(&mut self, time: i32) -> bool {
        self.keys.insert(time)
    }

    pub fn remove_key(&mut self, time: i32) -> bool {
        self.keys.remove(&time)
    }

    pub fn keys(&self) -> impl Iterator<Item = i32> + '_ {
        self.keys.iter().copied()
    }

    /// Keyframe in effect at `time` (last key at or before it)
    pub fn active_key_at(&self, time: i32) -> Option<i32> {
        self.keys.range(..=time).next_back().copied()
    }

    /// Frames that change when the content visible at `time` is edited
    pub fn affected_frames(&self, time: i32) -> TimeRange {
        if self.keys.is_empty() {
            return TimeRange::infinite_from(0);
        }

        // Before the first key the content is shared from 0 (or `time` if negative)
        let from = self.active_key_at(time).unwrap_or_else(|| time.min(0));
        let next = self.keys.range(time.saturating_add(1)..).next().copied();

        match next {
            Some(next) => TimeRange::new(from, next - 1),
            None => TimeRange::infinite_from(from),
        }
    }
}

/// Union of affected frames over all channels of a node
pub fn skip_range_at(channels: &[KeyframeChannel], time: i32) -> FrameSet {
    FrameSet::from_ranges(channels.iter().map(|ch| ch.affected_frames(time)))
}
