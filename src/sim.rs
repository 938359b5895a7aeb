//! Synthetic image engine and host for the demo binary and integration tests.
//!
//! `SimEngine` owns one render thread. Regeneration requests from any
//! `SimImage` are queued to it; it "renders" a linear-light gradient after a
//! configurable delay, stages it in the image's cache and notifies the
//! populator, like a real compositing engine would.

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

use crate::core::frame::RawFrame;
use crate::core::populator::FrameReadyNotifier;
use crate::core::registry::CacheRegistry;
use crate::core::time_range::{FrameSet, TimeRange};
use crate::entities::channel::{skip_range_at, KeyframeChannel};
use crate::entities::{AnimatedImage, Bounds, HostContext};

enum RenderJob {
    Frame { image: Uuid, time: i32, bounds: Bounds },
    Stop,
}

#[derive(Debug, Clone)]
pub struct SimEngineConfig {
    pub render_time: Duration,
    /// Every Nth job is silently lost (0 = never)
    pub lose_every: u32,
}

impl Default for SimEngineConfig {
    fn default() -> Self {
        Self {
            render_time: Duration::from_millis(5),
            lose_every: 0,
        }
    }
}

pub struct SimEngine {
    jobs: Sender<RenderJob>,
    handle: Option<thread::JoinHandle<u64>>,
}

impl SimEngine {
    pub fn start(
        config: SimEngineConfig,
        registry: Arc<CacheRegistry>,
        notifier: FrameReadyNotifier,
    ) -> std::io::Result<Self> {
        let (jobs, rx) = unbounded();
        let handle = thread::Builder::new()
            .name("animcache-render".into())
            .spawn(move || render_loop(config, rx, registry, notifier))?;
        Ok(Self {
            jobs,
            handle: Some(handle),
        })
    }

    /// New image of `bounds` size with clip range `clip`
    pub fn create_image(&self, bounds: Bounds, clip: TimeRange) -> Arc<SimImage> {
        Arc::new(SimImage {
            uuid: Uuid::new_v4(),
            bounds,
            clip,
            validity: Mutex::new(FrameSet::from_range(clip)),
            jobs: self.jobs.clone(),
        })
    }

    /// Stop the render thread; returns the number of frames it rendered
    pub fn stop(mut self) -> u64 {
        let _ = self.jobs.send(RenderJob::Stop);
        self.handle.take().and_then(|h| h.join().ok()).unwrap_or(0)
    }
}

impl Drop for SimEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.jobs.send(RenderJob::Stop);
            let _ = handle.join();
        }
    }
}

fn render_loop(
    config: SimEngineConfig,
    rx: Receiver<RenderJob>,
    registry: Arc<CacheRegistry>,
    notifier: FrameReadyNotifier,
) -> u64 {
    let mut received = 0u32;
    let mut rendered = 0u64;
    while let Ok(job) = rx.recv() {
        let RenderJob::Frame { image, time, bounds } = job else {
            break;
        };
        received = received.wrapping_add(1);
        thread::sleep(config.render_time);

        if config.lose_every > 0 && received % config.lose_every == 0 {
            debug!("Render of {}:{} lost", image, time);
            continue;
        }
        let Some(cache) = registry.get(image) else {
            trace!("Image {} has no cache anymore, render discarded", image);
            continue;
        };

        cache.stage(time, render_gradient(bounds, time));
        notifier.frame_ready(image, time);
        rendered += 1;
    }
    rendered
}

/// Horizontal gradient whose tint moves with `time`
fn render_gradient(bounds: Bounds, time: i32) -> RawFrame {
    let (w, h) = (bounds.width.max(1) as usize, bounds.height.max(1) as usize);
    let phase = (time.rem_euclid(24)) as f32 / 24.0;
    let mut buf = Vec::with_capacity(w * h * 4);
    for _y in 0..h {
        for x in 0..w {
            let u = x as f32 / w as f32;
            buf.extend_from_slice(&[u, phase, 1.0 - u, 1.0]);
        }
    }
    RawFrame::new(crate::core::frame::PixelBuffer::F32(buf), w, h)
}

pub struct SimImage {
    uuid: Uuid,
    bounds: Bounds,
    clip: TimeRange,
    validity: Mutex<FrameSet>,
    jobs: Sender<RenderJob>,
}

impl SimImage {
    /// Replace the validity set. Callers pair this with `FrameCache::invalidate`
    /// over the newly valid frames so a dormant populator picks them up.
    pub fn set_validity(&self, validity: FrameSet) {
        *self.validity.lock().unwrap_or_else(|e| e.into_inner()) = validity;
    }
}

impl AnimatedImage for SimImage {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn bounds(&self) -> Bounds {
        self.bounds
    }

    fn request_frame_regeneration(&self, time: i32, bounds: Bounds) {
        let _ = self.jobs.send(RenderJob::Frame {
            image: self.uuid,
            time,
            bounds,
        });
    }

    fn frame_validity(&self) -> FrameSet {
        self.validity.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn full_clip_range(&self) -> TimeRange {
        self.clip
    }
}

/// Host with a toggleable stroke and one active node
#[derive(Default)]
pub struct SimHost {
    stroke_active: AtomicBool,
    active: Mutex<Option<Uuid>>,
    node_channels: Mutex<Vec<KeyframeChannel>>,
    current_time: AtomicI32,
}

impl SimHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_stroke_active(&self, active: bool) {
        self.stroke_active.store(active, Ordering::SeqCst);
    }

    pub fn set_active_image(&self, image: Option<Uuid>) {
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = image;
    }

    pub fn set_active_node(&self, channels: Vec<KeyframeChannel>) {
        *self.node_channels.lock().unwrap_or_else(|e| e.into_inner()) = channels;
    }

    pub fn set_current_time(&self, time: i32) {
        self.current_time.store(time, Ordering::SeqCst);
    }
}

impl HostContext for SimHost {
    fn is_idle(&self) -> bool {
        !self.stroke_active.load(Ordering::SeqCst)
    }

    fn active_image(&self) -> Option<Uuid> {
        *self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn skip_range(&self) -> FrameSet {
        let channels = self.node_channels.lock().unwrap_or_else(|e| e.into_inner());
        skip_range_at(&channels, self.current_time.load(Ordering::SeqCst))
    }
}
