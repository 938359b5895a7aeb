//! Core engine modules - frame cache, populator, events, workers
//!
//! These modules are independent of any UI or document model; documents plug
//! in through the traits in `entities`.

pub mod cache_events;
pub mod color;
pub mod event_bus;
pub mod frame;
pub mod frame_cache;
pub mod populator;
pub mod registry;
pub mod time_range;
pub mod workers;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use cache_events::{CacheChange, CacheChangedEvent, PopulatorStateChangedEvent};
pub use color::{ConversionError, DisplayConverter, SrgbConverter};
pub use event_bus::{EventBus, EventEmitter};
pub use frame::{Frame, PixelBuffer, PixelFormat, RawFrame};
pub use frame_cache::{CacheStats, FrameCache, FrameStatus};
pub use populator::{CachePopulator, FrameReadyNotifier, PopulatorConfig, PopulatorState, PopulatorStats};
pub use registry::CacheRegistry;
pub use time_range::{FrameSet, TimeRange};
pub use workers::Workers;
