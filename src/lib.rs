//! ANIMCACHE - animation frame cache with idle-time background population
//!
//! Re-exports all modules for use by binary targets.

// Core engine (cache, registry, populator, workers)
pub mod core;

// App modules
pub mod cli;
pub mod config;
pub mod entities;
pub mod sim;

// Re-export commonly used types from core
pub use core::event_bus::{downcast_event, BoxedEvent, EventBus, EventEmitter};
pub use core::frame_cache::{FrameCache, FrameStatus};
pub use core::populator::{CachePopulator, FrameReadyNotifier, PopulatorConfig, PopulatorState};
pub use core::registry::CacheRegistry;
pub use core::time_range::{FrameSet, TimeRange};

// Re-export entities
pub use entities::{AnimatedImage, Bounds, HostContext, KeyframeChannel};
