//! Viewer statistics and event broadcasting
//!
//! `ViewerStats` is a shared snapshot of every feed, polled by the UI.
//! `EventBus` broadcasts discrete `ViewerEvent`s to subscribers.
//! `SurfaceCounters` are lock-free counters bumped by surface reader threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::types::{AttemptId, DisplayState, FeedId, Panel};

/// Snapshot of one feed
#[derive(Debug, Clone)]
pub struct FeedStats {
    pub source_url: String,
    pub display_state: DisplayState,
    pub panel: Panel,
    pub is_active: bool,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub attempt: Option<AttemptId>,
    pub last_frame_at: Option<Instant>,
    pub should_run: bool,
    pub in_viewport: bool,

    pub frames_received: u64,
    pub bytes_received: u64,
    /// Dimensions of the latest decoded frame
    pub frame_size: Option<(u16, u16)>,
    /// Frames per second over the last stats interval
    pub fps: f64,
    /// Frames held by the delayed frame cache
    pub cached_frames: usize,
    pub frames_served: u64,
    pub restarts: u64,
    pub errors: u64,
}

impl FeedStats {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            display_state: DisplayState::Loading,
            panel: Panel::Loading,
            is_active: false,
            retry_count: 0,
            retry_delay_ms: 0,
            attempt: None,
            last_frame_at: None,
            should_run: true,
            in_viewport: true,
            frames_received: 0,
            bytes_received: 0,
            frame_size: None,
            fps: 0.0,
            cached_frames: 0,
            frames_served: 0,
            restarts: 0,
            errors: 0,
        }
    }
}

/// Snapshot of all feeds, updated by the engine on its stats tick
#[derive(Debug, Clone, Default)]
pub struct ViewerStats {
    pub feeds: Vec<FeedStats>,
    pub started_at: Option<Instant>,
}

impl ViewerStats {
    pub fn feed(&self, feed: FeedId) -> Option<&FeedStats> {
        self.feeds.get(feed.0)
    }

    /// Number of feeds currently streaming
    pub fn streaming_count(&self) -> usize {
        self.feeds
            .iter()
            .filter(|f| f.display_state == DisplayState::Streaming)
            .count()
    }
}

/// Thread-safe handle to shared stats
pub type SharedStats = Arc<Mutex<ViewerStats>>;

pub fn new_shared_stats() -> SharedStats {
    Arc::new(Mutex::new(ViewerStats::default()))
}

/// Discrete events broadcast to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    /// A feed's visible panel changed
    PanelChanged { feed: FeedId, panel: Panel },
    /// A feed's display state changed
    StateChanged { feed: FeedId, state: DisplayState },
    /// A feed's request failed
    FrameError { feed: FeedId, message: String },
    /// A feed issued a new attempt
    Restarted { feed: FeedId, attempt: AttemptId },
}

/// Broadcast mechanism for viewer events
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ViewerEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to events. Returns a receiver that will get all future events.
    pub fn subscribe(&self) -> Receiver<ViewerEvent> {
        let (tx, rx) = unbounded();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Emit an event to all subscribers, dropping disconnected ones
    pub fn emit(&self, event: ViewerEvent) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Drop every subscriber so their receivers disconnect once drained
    pub fn close(&self) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.clear();
        }
    }
}

/// Lock-free counters written by a surface reader thread
#[derive(Debug, Default)]
pub struct SurfaceCounters {
    pub frames_received: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl SurfaceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_bytes(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// (frames, bytes)
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.frames_received.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
        )
    }
}
