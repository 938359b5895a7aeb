//! Events emitted by frame caches and the populator.
//!
//! `CacheChangedEvent` is the "changed" notification: UI refresh logic polls
//! it, the populator subscribes to it to re-arm after going dormant.
//!
//! The cache cannot observe an image's validity set. An engine that widens
//! `frame_validity()` must also invalidate the newly valid range, or a
//! dormant populator will not notice the new work.

use uuid::Uuid;

use super::populator::PopulatorState;
use super::time_range::TimeRange;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheChange {
    /// Entries in the range were dropped (or the range was non-empty)
    Invalidated(TimeRange),
    /// A converted frame was stored at this time
    Committed(i32),
    /// Everything was dropped
    Cleared,
    /// A new cache was opened for the image
    Registered,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheChangedEvent {
    pub image: Uuid,
    pub change: CacheChange,
}

impl CacheChangedEvent {
    /// New regeneration work may exist after this change
    pub fn may_add_work(&self) -> bool {
        !matches!(self.change, CacheChange::Committed(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PopulatorStateChangedEvent {
    pub old: PopulatorState,
    pub new: PopulatorState,
}
