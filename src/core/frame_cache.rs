//! Per-image animation frame cache
//!
//! Structure: `HashMap<i32, Frame>` behind an RwLock, one cache per image.
//! - Entries are display-converted `Frame`s, inserted whole under the write
//!   lock, so readers see either nothing or a complete frame.
//! - A separate staging slot holds raw render output between the engine's
//!   "frame ready" notification and the populator picking it up.
//!
//! Every invalidation or clear bumps a generation counter. A payload taken
//! from staging carries the generation it was taken at, and
//! `commit_if_current` refuses it once the cache has been invalidated since.
//!
//! **Lifecycle**: created through `CacheRegistry::get_cache_for`, owned by
//! whoever holds the image's document. Dropping the last handle removes the
//! cache from the registry. The cache keeps only a weak back-reference to
//! its image.

use log::{debug, trace};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use uuid::Uuid;

use super::cache_events::{CacheChange, CacheChangedEvent};
use super::event_bus::EventEmitter;
use super::frame::{Frame, RawFrame};
use super::registry::CacheRegistry;
use super::time_range::TimeRange;
use crate::entities::AnimatedImage;

/// Cache status of a single frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Cached,
    Uncached,
}

/// Hit/miss counters for `fetch`
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }
}

pub struct FrameCache {
    image_uuid: Uuid,
    image: Weak<dyn AnimatedImage>,
    frames: RwLock<HashMap<i32, Frame>>,
    /// Raw render output waiting for conversion: time -> payload
    staging: Mutex<HashMap<i32, RawFrame>>,
    /// Bumped under both locks by invalidate/clear
    generation: AtomicU64,
    mem_bytes: AtomicUsize,
    stats: CacheStats,
    emitter: EventEmitter,
    registry: Weak<CacheRegistry>,
}

impl std::fmt::Debug for FrameCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCache")
            .field("image", &self.image_uuid)
            .field("frames", &self.len())
            .field("mem_bytes", &self.mem())
            .finish()
    }
}

impl FrameCache {
    pub(crate) fn new(image: &Arc<dyn AnimatedImage>, emitter: EventEmitter, registry: Weak<CacheRegistry>) -> Self {
        let image_uuid = image.uuid();
        debug!("FrameCache created for image {}", image_uuid);
        Self {
            image_uuid,
            image: Arc::downgrade(image),
            frames: RwLock::new(HashMap::new()),
            staging: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            mem_bytes: AtomicUsize::new(0),
            stats: CacheStats::default(),
            emitter,
            registry,
        }
    }

    pub fn image_uuid(&self) -> Uuid {
        self.image_uuid
    }

    /// Owning image, None once it has been destroyed
    pub fn image(&self) -> Option<Arc<dyn AnimatedImage>> {
        self.image.upgrade()
    }

    pub fn frame_status(&self, time: i32) -> FrameStatus {
        let frames = self.frames.read().unwrap_or_else(|e| e.into_inner());
        if frames.contains_key(&time) {
            FrameStatus::Cached
        } else {
            FrameStatus::Uncached
        }
    }

    /// Cached frame for `time`.
    ///
    /// On a miss this asks the image to regenerate the frame (fire-and-forget)
    /// and returns None. Never blocks on rendering.
    pub fn fetch(&self, time: i32) -> Option<Frame> {
        let cached = {
            let frames = self.frames.read().unwrap_or_else(|e| e.into_inner());
            frames.get(&time).cloned()
        };

        if cached.is_some() {
            self.stats.record_hit();
            return cached;
        }

        self.stats.record_miss();
        if let Some(image) = self.image.upgrade() {
            trace!("Cache miss {}:{}, requesting regeneration", self.image_uuid, time);
            image.request_frame_regeneration(time, image.bounds());
        }
        None
    }

    /// Drop every entry whose time falls in `range` (infinite ranges reach
    /// the last entry). Always emits a change notification.
    pub fn invalidate(&self, range: TimeRange) {
        let (removed, freed) = {
            let mut frames = self.frames.write().unwrap_or_else(|e| e.into_inner());
            let mut removed = 0usize;
            let mut freed = 0usize;
            frames.retain(|time, frame| {
                if range.contains(*time) {
                    removed += 1;
                    freed += frame.mem();
                    false
                } else {
                    true
                }
            });
            let mut staging = self.staging.lock().unwrap_or_else(|e| e.into_inner());
            staging.retain(|time, _| !range.contains(*time));
            self.generation.fetch_add(1, Ordering::AcqRel);
            (removed, freed)
        };
        self.free_memory(freed);

        if removed > 0 {
            debug!(
                "Invalidated {}:{}: {} frames, {} KB freed",
                self.image_uuid,
                range,
                removed,
                freed / 1024
            );
        }

        self.emitter.emit(CacheChangedEvent {
            image: self.image_uuid,
            change: CacheChange::Invalidated(range),
        });
    }

    /// Store a converted frame. Overwrites any existing entry.
    pub fn commit(&self, time: i32, frame: Frame) {
        let size = frame.mem();
        let old = {
            let mut frames = self.frames.write().unwrap_or_else(|e| e.into_inner());
            frames.insert(time, frame)
        };
        if let Some(old) = old {
            self.free_memory(old.mem());
        }
        self.mem_bytes.fetch_add(size, Ordering::Relaxed);

        debug!("Cached frame {}:{} ({} bytes)", self.image_uuid, time, size);
        self.emitter.emit(CacheChangedEvent {
            image: self.image_uuid,
            change: CacheChange::Committed(time),
        });
    }

    /// Store a converted frame unless the cache was invalidated or cleared
    /// after `generation` was observed. Returns whether it was stored.
    pub fn commit_if_current(&self, time: i32, frame: Frame, generation: u64) -> bool {
        let size = frame.mem();
        let old = {
            let mut frames = self.frames.write().unwrap_or_else(|e| e.into_inner());
            if self.generation.load(Ordering::Acquire) != generation {
                trace!("Dropping outdated frame {}:{}", self.image_uuid, time);
                return false;
            }
            frames.insert(time, frame)
        };
        if let Some(old) = old {
            self.free_memory(old.mem());
        }
        self.mem_bytes.fetch_add(size, Ordering::Relaxed);

        debug!("Cached frame {}:{} ({} bytes)", self.image_uuid, time, size);
        self.emitter.emit(CacheChangedEvent {
            image: self.image_uuid,
            change: CacheChange::Committed(time),
        });
        true
    }

    /// Drop every entry
    pub fn clear(&self) {
        let count = {
            let mut frames = self.frames.write().unwrap_or_else(|e| e.into_inner());
            let count = frames.len();
            frames.clear();
            self.staging.lock().unwrap_or_else(|e| e.into_inner()).clear();
            self.generation.fetch_add(1, Ordering::AcqRel);
            count
        };
        self.mem_bytes.store(0, Ordering::Relaxed);

        debug!("Cleared cache {}: {} frames", self.image_uuid, count);
        self.emitter.emit(CacheChangedEvent {
            image: self.image_uuid,
            change: CacheChange::Cleared,
        });
    }

    // ========== Staging (render thread -> populator) ==========

    /// Deposit raw render output for `time`. Called by the engine before it
    /// sends the matching frame-ready notification.
    pub fn stage(&self, time: i32, raw: RawFrame) {
        trace!("Staged raw frame {}:{} ({} bytes)", self.image_uuid, time, raw.mem());
        self.staging
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(time, raw);
    }

    /// Take the staged payload for `time`, if any
    pub fn take_staged(&self, time: i32) -> Option<RawFrame> {
        self.staging
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&time)
    }

    /// Take the staged payload for `time` together with the generation it
    /// belongs to, for a later `commit_if_current`
    pub fn take_staged_for_commit(&self, time: i32) -> Option<(RawFrame, u64)> {
        let mut staging = self.staging.lock().unwrap_or_else(|e| e.into_inner());
        let raw = staging.remove(&time)?;
        Some((raw, self.generation.load(Ordering::Acquire)))
    }

    /// Forget a staged payload (abandoned request)
    pub fn discard_staged(&self, time: i32) {
        if self.take_staged(time).is_some() {
            trace!("Discarded staged frame {}:{}", self.image_uuid, time);
        }
    }

    pub fn staged_count(&self) -> usize {
        self.staging.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    // ========== Queries ==========

    /// Cached times in increasing order
    pub fn cached_times(&self) -> Vec<i32> {
        let frames = self.frames.read().unwrap_or_else(|e| e.into_inner());
        let mut times: Vec<i32> = frames.keys().copied().collect();
        times.sort_unstable();
        times
    }

    pub fn len(&self) -> usize {
        self.frames.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by cached frames
    pub fn mem(&self) -> usize {
        self.mem_bytes.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn free_memory(&self, bytes: usize) {
        // Saturating: a concurrent clear() may already have reset the counter
        let _ = self
            .mem_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| Some(cur.saturating_sub(bytes)));
    }
}

impl Drop for FrameCache {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.image_uuid);
        }
        debug!("FrameCache for image {} destroyed", self.image_uuid);
    }
}
