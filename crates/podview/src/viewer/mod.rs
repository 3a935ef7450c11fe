//! Viewer subsystem
//!
//! Stream controllers, retry and timer bookkeeping, multi-feed coordination,
//! and the engine thread that drives them.
//!

pub mod controller;
pub mod engine;
pub mod feeds;
pub mod retry;
pub mod stats;
pub mod timers;
pub mod types;

pub use controller::{ControllerConfig, StreamController};
pub use engine::{EngineOptions, ViewerCommand, ViewerEngine};
pub use feeds::FeedSet;
pub use retry::{RetryPolicy, RetryState};
pub use stats::{new_shared_stats, EventBus, FeedStats, SharedStats, ViewerEvent, ViewerStats};
pub use types::{
    AttemptId, DisplayState, Effect, FeedId, FrameRequest, Panel, SurfaceStatus, Visibility,
};
