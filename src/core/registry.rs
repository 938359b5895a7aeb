//! Table of live frame caches, keyed by image identity.
//!
//! Not a global: the application context owns one `Arc<CacheRegistry>` and
//! hands clones to whatever needs it. The registry holds weak handles only;
//! a cache unregisters itself when its last strong handle is dropped.
//!
//! Enumeration order is registration order (IndexMap), which is also the
//! order the populator scans non-active caches in.

use indexmap::IndexMap;
use log::debug;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

use super::cache_events::{CacheChange, CacheChangedEvent};
use super::event_bus::EventEmitter;
use super::frame_cache::FrameCache;
use crate::entities::AnimatedImage;

#[derive(Debug)]
pub struct CacheRegistry {
    caches: Mutex<IndexMap<Uuid, Weak<FrameCache>>>,
    emitter: EventEmitter,
}

impl CacheRegistry {
    /// New registry; caches it creates publish change events via `emitter`
    pub fn new(emitter: EventEmitter) -> Arc<Self> {
        Arc::new(Self {
            caches: Mutex::new(IndexMap::new()),
            emitter,
        })
    }

    /// Existing cache for `image`, or a freshly registered one.
    ///
    /// A new cache announces itself with `CacheChange::Registered`, emitted
    /// after the registry lock is released.
    pub fn get_cache_for(self: &Arc<Self>, image: Arc<dyn AnimatedImage>) -> Arc<FrameCache> {
        let uuid = image.uuid();
        let cache = {
            let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());

            if let Some(existing) = caches.get(&uuid).and_then(Weak::upgrade) {
                return existing;
            }

            let cache = Arc::new(FrameCache::new(&image, self.emitter.clone(), Arc::downgrade(self)));
            // Re-inserting a dead key keeps its original position
            caches.insert(uuid, Arc::downgrade(&cache));
            debug!("Registered frame cache for image {} ({} total)", uuid, caches.len());
            cache
        };

        self.emitter.emit(CacheChangedEvent {
            image: uuid,
            change: CacheChange::Registered,
        });
        cache
    }

    /// Cache for `image`, if one is alive
    pub fn get(&self, image: Uuid) -> Option<Arc<FrameCache>> {
        self.caches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&image)
            .and_then(Weak::upgrade)
    }

    /// Snapshot of live caches in registration order.
    ///
    /// Caches dropped after the snapshot stay alive until the returned
    /// handles are released.
    pub fn caches(&self) -> Vec<Arc<FrameCache>> {
        self.caches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.caches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Called from `FrameCache::drop`. Only removes the entry if it is dead,
    /// so a newer cache for the same image survives.
    pub(crate) fn unregister(&self, image: Uuid) {
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        let dead = caches.get(&image).is_some_and(|weak| weak.strong_count() == 0);
        if dead {
            caches.shift_remove(&image);
            debug!("Unregistered frame cache for image {} ({} left)", image, caches.len());
        }
    }
}
