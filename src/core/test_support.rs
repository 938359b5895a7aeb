//! Fakes for the external collaborators, shared by unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::time_range::{FrameSet, TimeRange};
use crate::entities::{AnimatedImage, Bounds, HostContext};

/// Image that records regeneration requests and renders nothing by itself
pub struct FakeImage {
    uuid: Uuid,
    validity: Mutex<FrameSet>,
    clip: TimeRange,
    requests: Mutex<Vec<i32>>,
}

impl FakeImage {
    pub fn new(clip: TimeRange) -> Arc<Self> {
        Arc::new(Self {
            uuid: Uuid::new_v4(),
            validity: Mutex::new(FrameSet::from_range(clip)),
            clip,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn set_validity(&self, validity: FrameSet) {
        *self.validity.lock().unwrap() = validity;
    }

    pub fn requests(&self) -> Vec<i32> {
        self.requests.lock().unwrap().clone()
    }
}

impl AnimatedImage for FakeImage {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn bounds(&self) -> Bounds {
        Bounds::new(0, 0, 2, 2)
    }

    fn request_frame_regeneration(&self, time: i32, _bounds: Bounds) {
        self.requests.lock().unwrap().push(time);
    }

    fn frame_validity(&self) -> FrameSet {
        self.validity.lock().unwrap().clone()
    }

    fn full_clip_range(&self) -> TimeRange {
        self.clip
    }
}

/// Host with switchable idleness, focus and skip range
pub struct FakeHost {
    idle: AtomicBool,
    active: Mutex<Option<Uuid>>,
    skip: Mutex<FrameSet>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            idle: AtomicBool::new(true),
            active: Mutex::new(None),
            skip: Mutex::new(FrameSet::empty()),
        })
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::SeqCst);
    }

    pub fn set_active(&self, image: Option<Uuid>) {
        *self.active.lock().unwrap() = image;
    }

    pub fn set_skip(&self, skip: FrameSet) {
        *self.skip.lock().unwrap() = skip;
    }
}

impl HostContext for FakeHost {
    fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    fn active_image(&self) -> Option<Uuid> {
        *self.active.lock().unwrap()
    }

    fn skip_range(&self) -> FrameSet {
        self.skip.lock().unwrap().clone()
    }
}
