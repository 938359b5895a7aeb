//! Abstract traits for dependency inversion.
//!
//! The image/layer engine and the application shell live outside this
//! crate. These traits are the only surface `core` needs from them:
//! - `AnimatedImage`: one animated document image (renders frames on request)
//! - `HostContext`: application-wide state (idleness, focus, active node)
//!
//! Implementations must be thread-safe: the populator calls them from its
//! controller thread, the renderer calls back from its own threads.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::core::time_range::{FrameSet, TimeRange};

/// Pixel rectangle in image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Bounds {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Animated image as seen by the frame cache.
///
/// Regeneration is fire-and-forget: the engine renders on its own thread,
/// stages the result in the image's `FrameCache` and then sends a
/// `FrameReady` notification.
pub trait AnimatedImage: Send + Sync {
    /// Stable identity of the image (registry key)
    fn uuid(&self) -> Uuid;

    /// Full image bounds, used for regeneration requests
    fn bounds(&self) -> Bounds;

    /// Start rendering `time` within `bounds`. Must not block.
    fn request_frame_regeneration(&self, time: i32, bounds: Bounds);

    /// Time ranges whose frames are currently meaningful to cache.
    ///
    /// Nobody is notified when this changes: an implementation that makes
    /// new frames valid must also invalidate that range in its `FrameCache`.
    fn frame_validity(&self) -> FrameSet;

    /// Finite playback range of the document; clips infinite validity spans
    fn full_clip_range(&self) -> TimeRange;
}

/// Application-wide state consumed by the populator
pub trait HostContext: Send + Sync {
    /// No stroke or other foreground operation in progress anywhere
    fn is_idle(&self) -> bool;

    /// Image of the focused document, if any
    fn active_image(&self) -> Option<Uuid>;

    /// Frames about to be overwritten by edits to the active node at the
    /// current scrub position. Only applied to the active image's cache.
    fn skip_range(&self) -> FrameSet;
}

impl<T: AnimatedImage + ?Sized> AnimatedImage for Arc<T> {
    fn uuid(&self) -> Uuid {
        (**self).uuid()
    }

    fn bounds(&self) -> Bounds {
        (**self).bounds()
    }

    fn request_frame_regeneration(&self, time: i32, bounds: Bounds) {
        (**self).request_frame_regeneration(time, bounds)
    }

    fn frame_validity(&self) -> FrameSet {
        (**self).frame_validity()
    }

    fn full_clip_range(&self) -> TimeRange {
        (**self).full_clip_range()
    }
}

impl<T: HostContext + ?Sized> HostContext for Arc<T> {
    fn is_idle(&self) -> bool {
        (**self).is_idle()
    }

    fn active_image(&self) -> Option<Uuid> {
        (**self).active_image()
    }

    fn skip_range(&self) -> FrameSet {
        (**self).skip_range()
    }
}
