//! Shared viewer types
//!
//! Pure data types used across the viewer subsystem.

use std::fmt;
use std::time::Instant;

/// Logical state of one stream controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayState {
    #[default]
    Loading,
    Streaming,
    Error,
}

impl fmt::Display for DisplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayState::Loading => write!(f, "LOADING"),
            DisplayState::Streaming => write!(f, "STREAMING"),
            DisplayState::Error => write!(f, "ERROR"),
        }
    }
}

/// The one UI region currently visible for a feed.
///
/// Mostly mirrors [`DisplayState`], except that a reconnect keeps the
/// previous panel on screen until the spinner reveal delay has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Panel {
    #[default]
    Loading,
    Stream,
    Error,
}

impl fmt::Display for Panel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Panel::Loading => write!(f, "loading"),
            Panel::Stream => write!(f, "stream"),
            Panel::Error => write!(f, "error"),
        }
    }
}

/// Generation number of one `start()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AttemptId(pub u64);

impl AttemptId {
    pub(crate) fn next(self) -> Self {
        AttemptId(self.0.wrapping_add(1))
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a controller inside a feed set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeedId(pub usize);

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "feed{}", self.0)
    }
}

/// Host visibility signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visibility {
    pub page_visible: bool,
    pub window_focused: bool,
    /// Whether the feed is scrolled into view. Only used as a resume trigger.
    pub in_viewport: bool,
}

impl Default for Visibility {
    fn default() -> Self {
        Self {
            page_visible: true,
            window_focused: true,
            in_viewport: true,
        }
    }
}

impl Visibility {
    /// Controllers only do work while the page is visible and focused
    pub fn should_run(&self) -> bool {
        self.page_visible && self.window_focused
    }
}

/// What the rendering surface reports about its current request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SurfaceStatus {
    /// At least one payload finished loading
    pub complete: bool,
    /// The latest payload rendered to something visible
    pub has_content: bool,
    /// When the latest payload with content arrived
    pub last_frame_at: Option<Instant>,
}

impl SurfaceStatus {
    /// Finished loading but nothing to show: the silent-stall symptom
    pub fn is_empty_payload(&self) -> bool {
        self.complete && !self.has_content
    }
}

/// A request for the rendering surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRequest {
    pub attempt: AttemptId,
    pub url: String,
}

/// Side effects a controller asks its host to carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Point the rendering surface at a fresh request, replacing any previous one
    Load(FrameRequest),
    /// Drop the active request
    Clear,
    /// Make this panel the only visible one
    Present(Panel),
    /// Fire-and-forget warmup hint
    Warmup { url: String },
    /// Ask the backend how many upstream relays are active
    QueryRelayStatus { url: String },
}
