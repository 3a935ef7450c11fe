//! Delayed frame cache
//!
//! Keeps every frame received during the last `cache_duration` and serves
//! the newest one that is at least `serve_delay` old. Running slightly
//! behind live means a short upstream gap is bridged by frames that were
//! already buffered, while the surface reconnects underneath.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::cache::{CACHE_DURATION_MS, SERVE_DELAY_MS};

use super::mjpeg::Frame;

/// Retention and delay of a [`FrameCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// How long a frame stays in the cache
    pub cache_duration: Duration,
    /// How far behind the newest frame the served frame runs
    pub serve_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_duration: Duration::from_millis(CACHE_DURATION_MS),
            serve_delay: Duration::from_millis(SERVE_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedFrame {
    frame: Frame,
    received_at: Instant,
}

/// Snapshot of a cache for monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStatus {
    pub frames_in_cache: usize,
    pub frames_received: u64,
    pub frames_served: u64,
    pub cache_duration: Duration,
    pub serve_delay: Duration,
    pub oldest_frame_age: Option<Duration>,
    pub newest_frame_age: Option<Duration>,
}

/// Time-bounded buffer of recent frames
#[derive(Debug)]
pub struct FrameCache {
    config: CacheConfig,
    frames: VecDeque<CachedFrame>,
    frames_received: u64,
    frames_served: u64,
}

/// Cache shared between a surface reader thread and its readers
pub type SharedCache = Arc<Mutex<FrameCache>>;

impl Default for FrameCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl FrameCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            frames: VecDeque::new(),
            frames_received: 0,
            frames_served: 0,
        }
    }

    pub fn shared(config: CacheConfig) -> SharedCache {
        Arc::new(Mutex::new(Self::new(config)))
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Store a frame received at `now` and drop frames past the retention window
    pub fn push(&mut self, frame: Frame, now: Instant) {
        self.frames.push_back(CachedFrame {
            frame,
            received_at: now,
        });
        self.frames_received += 1;
        self.evict(now);
    }

    /// Newest frame received at least `serve_delay` before `now`.
    ///
    /// `None` until the first frame has aged enough, and again once an
    /// outage has outlasted the retention window.
    pub fn frame_to_serve(&mut self, now: Instant) -> Option<Frame> {
        self.evict(now);
        let ready = self
            .frames
            .iter()
            .rev()
            .find(|f| now.saturating_duration_since(f.received_at) >= self.config.serve_delay)?;
        let frame = ready.frame.clone();
        self.frames_served += 1;
        Some(frame)
    }

    /// Most recently received frame, ignoring the serve delay
    pub fn newest(&self) -> Option<&Frame> {
        self.frames.back().map(|f| &f.frame)
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn status(&self, now: Instant) -> CacheStatus {
        let age = |f: &CachedFrame| now.saturating_duration_since(f.received_at);
        CacheStatus {
            frames_in_cache: self.frames.len(),
            frames_received: self.frames_received,
            frames_served: self.frames_served,
            cache_duration: self.config.cache_duration,
            serve_delay: self.config.serve_delay,
            oldest_frame_age: self.frames.front().map(age),
            newest_frame_age: self.frames.back().map(age),
        }
    }

    fn evict(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.config.cache_duration) else {
            return;
        };
        while self.frames.front().is_some_and(|f| f.received_at < cutoff) {
            self.frames.pop_front();
        }
    }
}
