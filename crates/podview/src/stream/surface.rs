//! HTTP rendering surface
//!
//! Holds at most one live request per feed. Each `load` spawns a reader
//! thread that streams the response body through [`MultipartParser`] into
//! the surface's [`FrameCache`] and reports the first frame or the failure
//! back to the engine. Replacing a request raises the old reader's stop
//! flag; anything it still sends is tagged with an attempt the controller
//! no longer accepts. The cache outlives individual requests.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::config::mjpeg::READ_CHUNK_SIZE;
use crate::error::ViewerError;
use crate::viewer::stats::SurfaceCounters;
use crate::viewer::types::{AttemptId, FeedId, FrameRequest, SurfaceStatus};

use super::backend::BackendClient;
use super::cache::{CacheConfig, CacheStatus, FrameCache, SharedCache};
use super::mjpeg::{Frame, MultipartParser};

/// What a reader thread observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEventKind {
    /// The first part of the response arrived
    FrameLoaded,
    /// The request failed or the stream ended
    FrameError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceEvent {
    pub feed: FeedId,
    pub attempt: AttemptId,
    pub kind: SurfaceEventKind,
}

/// Status of one request, written by its reader thread
#[derive(Default)]
struct LoadState {
    complete: AtomicBool,
    has_content: AtomicBool,
    /// Milliseconds since the surface epoch, plus one, of the latest frame
    /// with content; 0 while there is none
    last_frame_ms: AtomicU64,
}

struct ActiveLoad {
    attempt: AttemptId,
    stop: Arc<AtomicBool>,
    state: Arc<LoadState>,
}

/// Rendering surface for one feed
pub struct HttpSurface {
    feed: FeedId,
    client: BackendClient,
    events: Sender<SurfaceEvent>,
    counters: Arc<SurfaceCounters>,
    cache: SharedCache,
    epoch: Instant,
    active: Option<ActiveLoad>,
}

impl HttpSurface {
    pub fn new(feed: FeedId, client: BackendClient, events: Sender<SurfaceEvent>) -> Self {
        Self {
            feed,
            client,
            events,
            counters: Arc::new(SurfaceCounters::new()),
            cache: FrameCache::shared(CacheConfig::default()),
            epoch: Instant::now(),
            active: None,
        }
    }

    /// Replace the frame cache. Call before handing out [`cache_handle`](Self::cache_handle).
    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = FrameCache::shared(config);
        self
    }

    /// Point the surface at `request`, replacing the current one
    pub fn load(&mut self, request: &FrameRequest) {
        self.clear();

        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::new(LoadState::default());
        let reader = Reader {
            feed: self.feed,
            attempt: request.attempt,
            stop: Arc::clone(&stop),
            state: Arc::clone(&state),
            counters: Arc::clone(&self.counters),
            cache: Arc::clone(&self.cache),
            epoch: self.epoch,
            events: self.events.clone(),
        };

        let url = match self.client.resolve(&request.url) {
            Ok(url) => url,
            Err(e) => {
                reader.fail(e.to_string());
                return;
            }
        };
        let client = self.client.inner().clone();

        let spawned = thread::Builder::new()
            .name(format!("surface-{}", self.feed))
            .spawn(move || reader.run(&client, url));
        if let Err(e) = spawned {
            warn!(feed = %self.feed, "Failed to spawn surface reader: {e}");
            let _ = self.events.send(SurfaceEvent {
                feed: self.feed,
                attempt: request.attempt,
                kind: SurfaceEventKind::FrameError(e.to_string()),
            });
            return;
        }

        self.active = Some(ActiveLoad {
            attempt: request.attempt,
            stop,
            state,
        });
    }

    /// Drop the active request
    pub fn clear(&mut self) {
        if let Some(load) = self.active.take() {
            debug!(feed = %self.feed, attempt = %load.attempt, "Dropping surface request");
            load.stop.store(true, Ordering::SeqCst);
        }
    }

    /// Report of the active request. Idle surfaces report nothing loaded.
    pub fn status(&self) -> SurfaceStatus {
        match &self.active {
            Some(load) => {
                let last = load.state.last_frame_ms.load(Ordering::Relaxed);
                SurfaceStatus {
                    complete: load.state.complete.load(Ordering::Relaxed),
                    has_content: load.state.has_content.load(Ordering::Relaxed),
                    last_frame_at: (last > 0)
                        .then(|| self.epoch + Duration::from_millis(last - 1)),
                }
            }
            None => SurfaceStatus::default(),
        }
    }

    pub fn active_attempt(&self) -> Option<AttemptId> {
        self.active.as_ref().map(|l| l.attempt)
    }

    /// Frames and bytes received over the surface's lifetime
    pub fn counters(&self) -> (u64, u64) {
        self.counters.snapshot()
    }

    /// Frame due on screen now, running `serve_delay` behind the newest one
    pub fn latest_frame(&self) -> Option<Frame> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frame_to_serve(Instant::now())
    }

    /// Most recently received frame with content, ignoring the serve delay
    pub fn newest_frame(&self) -> Option<Frame> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .newest()
            .cloned()
    }

    /// Handle to the frame cache that outlives moving the surface to another thread
    pub fn cache_handle(&self) -> SharedCache {
        Arc::clone(&self.cache)
    }

    pub fn cache_status(&self) -> CacheStatus {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status(Instant::now())
    }

    pub fn latest_dimensions(&self) -> Option<(u16, u16)> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .newest()
            .and_then(|f| f.dimensions)
    }
}

impl Drop for HttpSurface {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Everything a reader thread needs, moved into the thread
struct Reader {
    feed: FeedId,
    attempt: AttemptId,
    stop: Arc<AtomicBool>,
    state: Arc<LoadState>,
    counters: Arc<SurfaceCounters>,
    cache: SharedCache,
    epoch: Instant,
    events: Sender<SurfaceEvent>,
}

impl Reader {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn send(&self, kind: SurfaceEventKind) {
        let _ = self.events.send(SurfaceEvent {
            feed: self.feed,
            attempt: self.attempt,
            kind,
        });
    }

    fn fail(&self, message: String) {
        if !self.stopped() {
            debug!(feed = %self.feed, attempt = %self.attempt, "Surface error: {message}");
            self.send(SurfaceEventKind::FrameError(message));
        }
    }

    fn run(self, client: &reqwest::blocking::Client, url: reqwest::Url) {
        debug!(feed = %self.feed, attempt = %self.attempt, %url, "Surface request");
        let mut response = match client.get(url).send() {
            Ok(r) => r,
            Err(e) => return self.fail(ViewerError::from(e).to_string()),
        };
        if !response.status().is_success() {
            return self.fail(format!("HTTP {}", response.status()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let mut parser = MultipartParser::for_content_type(content_type.as_deref());
        let mut loaded = false;
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        loop {
            if self.stopped() {
                return;
            }
            let n = match response.read(&mut buf) {
                Ok(0) => {
                    // A single still image is a complete response, not a drop
                    if loaded && !parser.is_multipart() {
                        debug!(feed = %self.feed, attempt = %self.attempt, "Still image complete");
                        return;
                    }
                    return self.fail("stream ended".to_string());
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return self.fail(format!("read failed: {e}")),
            };
            self.counters.record_bytes(n);

            for frame in parser.push(&buf[..n]) {
                if self.stopped() {
                    return;
                }
                self.counters.record_frame();
                self.state.complete.store(true, Ordering::Relaxed);
                self.state
                    .has_content
                    .store(frame.has_content(), Ordering::Relaxed);
                if frame.has_content() {
                    let now = Instant::now();
                    let since_epoch = now.saturating_duration_since(self.epoch).as_millis() as u64;
                    self.state
                        .last_frame_ms
                        .store(since_epoch + 1, Ordering::Relaxed);
                    self.cache
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(frame, now);
                }
                if !loaded {
                    loaded = true;
                    self.send(SurfaceEventKind::FrameLoaded);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::mjpeg::tests::{part, tiny_jpeg};
    use crate::stream::test_server;
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn surface_for(base: &str) -> (HttpSurface, Receiver<SurfaceEvent>) {
        let (tx, rx) = unbounded();
        let client = BackendClient::new(Some(base)).unwrap();
        (HttpSurface::new(FeedId(0), client, tx), rx)
    }

    fn request(attempt: u64, url: &str) -> FrameRequest {
        FrameRequest {
            attempt: AttemptId(attempt),
            url: url.to_string(),
        }
    }

    fn multipart_body(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        for f in frames {
            body.extend(part("frame", f, true));
        }
        body
    }

    #[test]
    fn idle_surface_reports_nothing() {
        let (surface, _rx) = surface_for("http://127.0.0.1:9/");
        assert_eq!(surface.status(), SurfaceStatus::default());
        assert!(surface.latest_frame().is_none());
        assert!(surface.active_attempt().is_none());
    }

    #[test]
    fn multipart_stream_loads_then_reports_drop() {
        let body = multipart_body(&[tiny_jpeg(64, 48), tiny_jpeg(64, 48)]);
        let server = test_server::serve_once(
            "200 OK",
            "multipart/x-mixed-replace; boundary=frame",
            body,
        );
        let (mut surface, rx) = surface_for(&server.base_url);
        surface.load(&request(1, "/feed?t=1"));

        let first = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(first.attempt, AttemptId(1));
        assert_eq!(first.kind, SurfaceEventKind::FrameLoaded);

        let second = rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(second.kind, SurfaceEventKind::FrameError(_)));

        let status = surface.status();
        assert!(status.complete);
        assert!(status.has_content);
        assert!(status.last_frame_at.is_some());
        assert_eq!(surface.latest_dimensions(), Some((64, 48)));
        assert_eq!(surface.cache_status().frames_received, 2);
        assert_eq!(surface.counters().0, 2);
        assert!(server.request_line().starts_with("GET /feed?t=1 "));
    }

    #[test]
    fn empty_part_reports_empty_payload() {
        let body = multipart_body(&[Vec::new()]);
        let server = test_server::serve_once(
            "200 OK",
            "multipart/x-mixed-replace; boundary=frame",
            body,
        );
        let (mut surface, rx) = surface_for(&server.base_url);
        surface.load(&request(4, "/feed"));

        assert_eq!(rx.recv_timeout(WAIT).unwrap().kind, SurfaceEventKind::FrameLoaded);
        let _ = rx.recv_timeout(WAIT);
        assert!(surface.status().is_empty_payload());
        assert!(surface.status().last_frame_at.is_none());
        assert!(surface.newest_frame().is_none());
    }

    #[test]
    fn still_image_completes_without_error() {
        let server = test_server::serve_once("200 OK", "image/jpeg", tiny_jpeg(32, 32));
        let (mut surface, rx) = surface_for(&server.base_url);
        surface.load(&request(2, "/snapshot.jpg"));

        assert_eq!(rx.recv_timeout(WAIT).unwrap().kind, SurfaceEventKind::FrameLoaded);
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        assert_eq!(surface.latest_dimensions(), Some((32, 32)));
    }

    #[test]
    fn latest_frame_runs_behind_newest() {
        let server = test_server::serve_once("200 OK", "image/jpeg", tiny_jpeg(32, 32));
        let (surface, rx) = surface_for(&server.base_url);
        let mut surface = surface.with_cache_config(CacheConfig {
            cache_duration: Duration::from_secs(15),
            serve_delay: Duration::from_millis(300),
        });
        surface.load(&request(7, "/snapshot.jpg"));

        assert_eq!(rx.recv_timeout(WAIT).unwrap().kind, SurfaceEventKind::FrameLoaded);
        assert!(surface.newest_frame().is_some());
        assert!(surface.latest_frame().is_none());
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(surface.latest_frame().and_then(|f| f.dimensions), Some((32, 32)));
    }

    #[test]
    fn cache_survives_a_new_request() {
        let server = test_server::serve_once("200 OK", "image/jpeg", tiny_jpeg(20, 10));
        let (surface, rx) = surface_for(&server.base_url);
        let mut surface = surface.with_cache_config(CacheConfig {
            cache_duration: Duration::from_secs(15),
            serve_delay: Duration::ZERO,
        });
        surface.load(&request(8, "/snapshot.jpg"));
        assert_eq!(rx.recv_timeout(WAIT).unwrap().kind, SurfaceEventKind::FrameLoaded);

        // The next attempt fails, but the buffered frame is still served
        surface.load(&request(9, "/unreachable"));
        assert_eq!(surface.latest_frame().and_then(|f| f.dimensions), Some((20, 10)));
        assert!(surface.status().last_frame_at.is_none());
    }

    #[test]
    fn http_error_reports_frame_error() {
        let server = test_server::serve_once("404 Not Found", "text/plain", b"nope".to_vec());
        let (mut surface, rx) = surface_for(&server.base_url);
        surface.load(&request(3, "/missing"));

        let event = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(event.attempt, AttemptId(3));
        match event.kind {
            SurfaceEventKind::FrameError(msg) => assert!(msg.contains("404")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn unresolvable_url_reports_frame_error() {
        let (tx, rx) = unbounded();
        let client = BackendClient::new(None).unwrap();
        let mut surface = HttpSurface::new(FeedId(1), client, tx);
        surface.load(&request(5, "/relative/only"));

        let event = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(event.feed, FeedId(1));
        assert!(matches!(event.kind, SurfaceEventKind::FrameError(_)));
    }

    #[test]
    fn clear_drops_active_request() {
        let (mut surface, _rx) = surface_for("http://127.0.0.1:9/");
        surface.load(&request(6, "/feed"));
        assert_eq!(surface.active_attempt(), Some(AttemptId(6)));
        surface.clear();
        assert!(surface.active_attempt().is_none());
        assert_eq!(surface.status(), SurfaceStatus::default());
    }
}
