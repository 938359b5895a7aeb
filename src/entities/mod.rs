//! Document-side abstractions the cache talks to

pub mod channel;
pub mod traits;

pub use channel::{skip_range_at, KeyframeChannel};
pub use traits::{AnimatedImage, Bounds, HostContext};
