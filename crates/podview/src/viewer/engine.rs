//! Viewer engine
//!
//! Runs every stream controller on a dedicated thread, accepting commands via
//! crossbeam channels and emitting events back. Surface reader threads and
//! monitoring requests report into the same loop. Per-feed statistics are
//! shared via `Arc<Mutex<ViewerStats>>`.

use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::config::engine::{IDLE_POLL_MS, STATS_REFRESH_MS};
use crate::config::health::SWEEP_INTERVAL_MS;
use crate::error::{Result, ViewerError};
use crate::stream::backend::{query_params, BackendClient};
use crate::stream::cache::{CacheConfig, SharedCache};
use crate::stream::mjpeg::Frame;
use crate::stream::surface::{HttpSurface, SurfaceEvent, SurfaceEventKind};

use super::controller::ControllerConfig;
use super::feeds::{FeedEffects, FeedSet};
use super::stats::{new_shared_stats, EventBus, FeedStats, SharedStats, ViewerEvent};
use super::types::{DisplayState, Effect, FeedId};

/// Commands accepted by the engine thread
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerCommand {
    /// Force-restart one feed
    RetryFeed(FeedId),
    /// Force-restart every feed
    RetryAll,
    SetPageVisible(bool),
    SetWindowFocused(bool),
    SetInViewport { feed: FeedId, in_viewport: bool },
    /// The page was shown again, `persisted` when restored from a history cache
    PageShown { persisted: bool },
    Shutdown,
}

/// Everything needed to start an engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub sources: Vec<String>,
    pub controller: ControllerConfig,
    /// Base for relative source, warmup, and relay-status URLs
    pub base_url: Option<String>,
    pub sweep_interval: Duration,
    /// Retention and delay of each feed's frame cache
    pub cache: CacheConfig,
}

impl EngineOptions {
    pub fn new(sources: Vec<String>) -> Self {
        Self {
            sources,
            controller: ControllerConfig::default(),
            base_url: None,
            sweep_interval: Duration::from_millis(SWEEP_INTERVAL_MS),
            cache: CacheConfig::default(),
        }
    }
}

/// Result of a relay-status request made off the engine thread
struct RelayReport {
    feed: FeedId,
    active: Option<u32>,
}

/// Viewer engine that drives every feed on a dedicated thread
pub struct ViewerEngine {
    cmd_tx: Sender<ViewerCommand>,
    event_rx: Receiver<ViewerEvent>,
    thread: Option<JoinHandle<()>>,
    shared_stats: SharedStats,
    event_bus: Arc<EventBus>,
    frames: Vec<SharedCache>,
}

impl ViewerEngine {
    /// Create the engine and launch every feed
    pub fn new(options: EngineOptions) -> Result<Self> {
        if options.sources.is_empty() {
            return Err(ViewerError::Config("no feeds configured".to_string()));
        }
        let client = BackendClient::new(options.base_url.as_deref())?;

        let (cmd_tx, cmd_rx) = bounded::<ViewerCommand>(16);
        let (event_tx, event_rx) = bounded::<ViewerEvent>(256);
        let (surface_tx, surface_rx) = unbounded::<SurfaceEvent>();

        let surfaces: Vec<HttpSurface> = (0..options.sources.len())
            .map(|i| {
                HttpSurface::new(FeedId(i), client.clone(), surface_tx.clone())
                    .with_cache_config(options.cache)
            })
            .collect();
        let frames = surfaces.iter().map(HttpSurface::cache_handle).collect();

        let feeds = FeedSet::new(options.sources.iter().cloned(), options.controller.clone())
            .with_sweep_interval(options.sweep_interval);

        let shared_stats = new_shared_stats();
        let event_bus = Arc::new(EventBus::new());

        let driver = Driver::new(
            feeds,
            surfaces,
            client,
            event_tx,
            Arc::clone(&event_bus),
            shared_stats.clone(),
        );

        let thread = thread::Builder::new()
            .name("viewer-engine".to_string())
            .spawn(move || driver.run(cmd_rx, surface_rx))
            .map_err(|e| ViewerError::Stream(format!("Failed to spawn engine thread: {e}")))?;

        Ok(Self {
            cmd_tx,
            event_rx,
            thread: Some(thread),
            shared_stats,
            event_bus,
            frames,
        })
    }

    pub fn send(&self, cmd: ViewerCommand) {
        let _ = self.cmd_tx.send(cmd);
    }

    pub fn retry_feed(&self, feed: FeedId) {
        self.send(ViewerCommand::RetryFeed(feed));
    }

    pub fn retry_all(&self) {
        self.send(ViewerCommand::RetryAll);
    }

    pub fn set_page_visible(&self, visible: bool) {
        self.send(ViewerCommand::SetPageVisible(visible));
    }

    pub fn set_window_focused(&self, focused: bool) {
        self.send(ViewerCommand::SetWindowFocused(focused));
    }

    pub fn set_in_viewport(&self, feed: FeedId, in_viewport: bool) {
        self.send(ViewerCommand::SetInViewport { feed, in_viewport });
    }

    pub fn page_shown(&self, persisted: bool) {
        self.send(ViewerCommand::PageShown { persisted });
    }

    pub fn feed_count(&self) -> usize {
        self.frames.len()
    }

    /// Non-blocking poll for the next event
    pub fn try_recv_event(&self) -> Option<ViewerEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Get a reference to the event receiver for use with `select!`
    pub fn event_receiver(&self) -> &Receiver<ViewerEvent> {
        &self.event_rx
    }

    pub fn shared_stats(&self) -> SharedStats {
        self.shared_stats.clone()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    /// JPEG due on screen for `feed`, served from its frame cache
    pub fn latest_frame(&self, feed: FeedId) -> Option<Frame> {
        self.frames
            .get(feed.0)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frame_to_serve(Instant::now())
    }

    /// Graceful shutdown (consumes self)
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let _ = self.cmd_tx.send(ViewerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ViewerEngine {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

/// State owned by the engine thread
struct Driver {
    feeds: FeedSet,
    surfaces: Vec<HttpSurface>,
    client: BackendClient,
    event_tx: Sender<ViewerEvent>,
    event_bus: Arc<EventBus>,
    shared_stats: SharedStats,
    relay_tx: Sender<RelayReport>,
    relay_rx: Receiver<RelayReport>,
    /// Last display state reported per feed
    states: Vec<DisplayState>,
    restarts: Vec<u64>,
    errors: Vec<u64>,
    last_frames: Vec<u64>,
    last_stats_at: Instant,
}

impl Driver {
    fn new(
        feeds: FeedSet,
        surfaces: Vec<HttpSurface>,
        client: BackendClient,
        event_tx: Sender<ViewerEvent>,
        event_bus: Arc<EventBus>,
        shared_stats: SharedStats,
    ) -> Self {
        let n = feeds.len();
        let (relay_tx, relay_rx) = unbounded();
        Self {
            feeds,
            surfaces,
            client,
            event_tx,
            event_bus,
            shared_stats,
            relay_tx,
            relay_rx,
            states: vec![DisplayState::Loading; n],
            restarts: vec![0; n],
            errors: vec![0; n],
            last_frames: vec![0; n],
            last_stats_at: Instant::now(),
        }
    }

    /// The engine's main loop, running on the dedicated thread
    fn run(mut self, cmd_rx: Receiver<ViewerCommand>, surface_rx: Receiver<SurfaceEvent>) {
        let started = Instant::now();
        if let Ok(mut stats) = self.shared_stats.lock() {
            stats.started_at = Some(started);
        }
        info!(feeds = self.feeds.len(), "Viewer engine started");
        let fx = self.feeds.launch(started);
        self.apply(fx);

        let idle = Duration::from_millis(IDLE_POLL_MS);
        let stats_every = Duration::from_millis(STATS_REFRESH_MS);
        let relay_rx = self.relay_rx.clone();

        loop {
            let now = Instant::now();
            let wait = self
                .feeds
                .next_deadline()
                .map(|at| at.saturating_duration_since(now))
                .unwrap_or(idle)
                .min(idle);

            let keep_running = select! {
                recv(cmd_rx) -> msg => match msg {
                    Ok(ViewerCommand::Shutdown) | Err(_) => false,
                    Ok(cmd) => {
                        self.handle_command(cmd);
                        true
                    }
                },
                recv(surface_rx) -> msg => {
                    if let Ok(event) = msg {
                        self.handle_surface_event(event);
                    }
                    true
                },
                recv(relay_rx) -> msg => {
                    if let Ok(report) = msg {
                        let now = Instant::now();
                        let fx = match self.feeds.get_mut(report.feed) {
                            Some(c) => c
                                .on_relay_status(report.active, now)
                                .into_iter()
                                .map(|e| (report.feed, e))
                                .collect(),
                            None => FeedEffects::new(),
                        };
                        self.apply(fx);
                    }
                    true
                },
                default(wait) => true,
            };
            if !keep_running {
                break;
            }

            let now = Instant::now();
            let surfaces = &self.surfaces;
            let fx = self
                .feeds
                .on_tick(now, |feed| surfaces[feed.0].status());
            self.apply(fx);

            if now.duration_since(self.last_stats_at) >= stats_every {
                self.publish_stats(now);
            }
        }

        let fx = self.feeds.teardown();
        self.apply(fx);
        self.publish_stats(Instant::now());
        self.event_bus.close();
        info!("Viewer engine stopped");
    }

    fn handle_command(&mut self, cmd: ViewerCommand) {
        let now = Instant::now();
        debug!(?cmd, "Engine command");
        let fx = match cmd {
            ViewerCommand::RetryFeed(feed) => self.feeds.force_restart(feed, now),
            ViewerCommand::RetryAll => self.feeds.force_restart_all(now),
            ViewerCommand::SetPageVisible(visible) => self.feeds.set_page_visible(visible, now),
            ViewerCommand::SetWindowFocused(focused) => {
                self.feeds.set_window_focused(focused, now)
            }
            ViewerCommand::SetInViewport { feed, in_viewport } => {
                self.feeds.set_in_viewport(feed, in_viewport, now)
            }
            ViewerCommand::PageShown { persisted } => self.feeds.on_page_shown(persisted, now),
            ViewerCommand::Shutdown => FeedEffects::new(),
        };
        self.apply(fx);
    }

    fn handle_surface_event(&mut self, event: SurfaceEvent) {
        let now = Instant::now();
        let feed = event.feed;
        let Some(current) = self.feeds.get(feed).map(|c| c.current_attempt()) else {
            return;
        };
        if let SurfaceEventKind::FrameError(message) = &event.kind {
            if current == Some(event.attempt) {
                self.errors[feed.0] += 1;
                self.emit(ViewerEvent::FrameError {
                    feed,
                    message: message.clone(),
                });
            }
        }
        let fx = match self.feeds.get_mut(feed) {
            Some(c) => match event.kind {
                SurfaceEventKind::FrameLoaded => c.on_frame_loaded(event.attempt, now),
                SurfaceEventKind::FrameError(_) => c.on_frame_error(event.attempt, now),
            },
            None => Vec::new(),
        };
        self.apply(fx.into_iter().map(|e| (feed, e)).collect());
    }

    fn apply(&mut self, fx: FeedEffects) {
        for (feed, effect) in fx {
            match effect {
                Effect::Load(request) => {
                    if let Some(surface) = self.surfaces.get_mut(feed.0) {
                        surface.load(&request);
                    }
                    self.restarts[feed.0] += 1;
                    self.emit(ViewerEvent::Restarted {
                        feed,
                        attempt: request.attempt,
                    });
                }
                Effect::Clear => {
                    if let Some(surface) = self.surfaces.get_mut(feed.0) {
                        surface.clear();
                    }
                }
                Effect::Present(panel) => self.emit(ViewerEvent::PanelChanged { feed, panel }),
                Effect::Warmup { url } => self.spawn_warmup(feed, url),
                Effect::QueryRelayStatus { url } => self.spawn_relay_query(feed, url),
            }
        }
        self.sync_states();
    }

    /// Emit `StateChanged` for every feed whose display state moved
    fn sync_states(&mut self) {
        let changed: Vec<(FeedId, DisplayState)> = self
            .feeds
            .iter()
            .filter(|(feed, c)| self.states[feed.0] != c.display_state())
            .map(|(feed, c)| (feed, c.display_state()))
            .collect();
        for (feed, state) in changed {
            self.states[feed.0] = state;
            self.emit(ViewerEvent::StateChanged { feed, state });
        }
    }

    fn emit(&self, event: ViewerEvent) {
        self.event_bus.emit(event.clone());
        if self.event_tx.try_send(event).is_err() {
            debug!("Event channel full, dropping event");
        }
    }

    fn spawn_warmup(&self, feed: FeedId, url: String) {
        let client = self.client.clone();
        let params = self
            .feeds
            .get(feed)
            .and_then(|c| client.resolve(c.source_url()).ok())
            .map(|u| query_params(&u))
            .unwrap_or_default();
        let spawned = thread::Builder::new()
            .name("viewer-warmup".to_string())
            .spawn(move || match client.warmup(&url, &params) {
                Ok(()) => debug!(%feed, %url, "Warmup acknowledged"),
                Err(e) => debug!(%feed, %url, "Warmup failed: {e}"),
            });
        if let Err(e) = spawned {
            warn!(%feed, "Failed to spawn warmup request: {e}");
        }
    }

    fn spawn_relay_query(&self, feed: FeedId, url: String) {
        let client = self.client.clone();
        let tx = self.relay_tx.clone();
        let spawned = thread::Builder::new()
            .name("viewer-relay-status".to_string())
            .spawn(move || {
                let active = match client.relay_status(&url) {
                    Ok(status) => Some(status.active_count()),
                    Err(e) => {
                        debug!(%feed, %url, "Relay status failed: {e}");
                        None
                    }
                };
                let _ = tx.send(RelayReport { feed, active });
            });
        if let Err(e) = spawned {
            warn!(%feed, "Failed to spawn relay status request: {e}");
        }
    }

    fn publish_stats(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_stats_at).as_secs_f64();
        self.last_stats_at = now;

        let mut snapshot = Vec::with_capacity(self.feeds.len());
        for (feed, c) in self.feeds.iter() {
            let surface = &self.surfaces[feed.0];
            let (frames, bytes) = surface.counters();
            let fps = if elapsed > 0.0 {
                frames.saturating_sub(self.last_frames[feed.0]) as f64 / elapsed
            } else {
                0.0
            };
            self.last_frames[feed.0] = frames;

            let visibility = c.visibility();
            let mut stats = FeedStats::new(c.source_url());
            stats.display_state = c.display_state();
            stats.panel = c.panel();
            stats.is_active = c.is_active();
            stats.retry_count = c.retry_count();
            stats.retry_delay_ms = c.retry_delay().as_millis() as u64;
            stats.attempt = c.current_attempt();
            stats.last_frame_at = c.last_frame_at();
            stats.should_run = visibility.should_run();
            stats.in_viewport = visibility.in_viewport;
            stats.frames_received = frames;
            stats.bytes_received = bytes;
            stats.frame_size = surface.latest_dimensions();
            stats.fps = fps;
            let cache = surface.cache_status();
            stats.cached_frames = cache.frames_in_cache;
            stats.frames_served = cache.frames_served;
            stats.restarts = self.restarts[feed.0];
            stats.errors = self.errors[feed.0];
            snapshot.push(stats);
        }

        if let Ok(mut shared) = self.shared_stats.lock() {
            shared.feeds = snapshot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::mjpeg::tests::{part, tiny_jpeg};
    use crate::viewer::types::Panel;
    use crate::stream::test_server;
    use std::net::TcpListener;

    /// Helper: wait for the first event matching `pred` within a timeout
    fn wait_for<F>(engine: &ViewerEngine, timeout_ms: u64, mut pred: F) -> Option<ViewerEvent>
    where
        F: FnMut(&ViewerEvent) -> bool,
    {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match engine.event_receiver().recv_timeout(left) {
                Ok(evt) if pred(&evt) => return Some(evt),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// A URL nothing listens on
    fn closed_port_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/stream")
    }

    fn mjpeg_server(frames: usize) -> test_server::TestServer {
        let mut body = Vec::new();
        for _ in 0..frames {
            body.extend(part("frame", &tiny_jpeg(320, 240), true));
        }
        test_server::serve_once("200 OK", "multipart/x-mixed-replace; boundary=frame", body)
    }

    // --- Lifecycle ---

    #[test]
    fn no_feeds_is_a_config_error() {
        let result = ViewerEngine::new(EngineOptions::new(Vec::new()));
        assert!(matches!(result, Err(ViewerError::Config(_))));
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let mut options = EngineOptions::new(vec!["/feed".to_string()]);
        options.base_url = Some("::nope::".to_string());
        assert!(matches!(ViewerEngine::new(options), Err(ViewerError::Url(_))));
    }

    #[test]
    fn create_and_shutdown() {
        let engine = ViewerEngine::new(EngineOptions::new(vec![closed_port_url()])).unwrap();
        assert_eq!(engine.feed_count(), 1);
        engine.shutdown();
    }

    #[test]
    fn drop_triggers_shutdown() {
        let engine = ViewerEngine::new(EngineOptions::new(vec![closed_port_url()])).unwrap();
        drop(engine);
        // If we get here without hanging, shutdown worked
    }

    // --- Streaming ---

    #[test]
    fn launch_issues_first_attempt() {
        let engine = ViewerEngine::new(EngineOptions::new(vec![closed_port_url()])).unwrap();
        let evt = wait_for(&engine, 2_000, |e| matches!(e, ViewerEvent::Restarted { .. }));
        assert!(matches!(
            evt,
            Some(ViewerEvent::Restarted {
                feed: FeedId(0),
                ..
            })
        ));
    }

    #[test]
    fn stream_reaches_streaming_panel() {
        let server = mjpeg_server(3);
        let mut options = EngineOptions::new(vec!["/cam/1".to_string()]);
        options.base_url = Some(server.base_url.clone());
        options.cache.serve_delay = Duration::ZERO;
        let engine = ViewerEngine::new(options).unwrap();

        let evt = wait_for(&engine, 5_000, |e| {
            matches!(e, ViewerEvent::PanelChanged { panel: Panel::Stream, .. })
        });
        assert!(evt.is_some(), "expected the stream panel");

        let frame = engine.latest_frame(FeedId(0)).expect("frame kept");
        assert_eq!(frame.dimensions, Some((320, 240)));
        assert!(server.request_line().starts_with("GET /cam/1?t="));
        assert!(engine.latest_frame(FeedId(7)).is_none());
    }

    #[test]
    fn served_frame_trails_the_live_one() {
        let server = mjpeg_server(2);
        let mut options = EngineOptions::new(vec!["/cam/2".to_string()]);
        options.base_url = Some(server.base_url.clone());
        options.cache.serve_delay = Duration::from_secs(60);
        let engine = ViewerEngine::new(options).unwrap();

        let evt = wait_for(&engine, 5_000, |e| {
            matches!(e, ViewerEvent::PanelChanged { panel: Panel::Stream, .. })
        });
        assert!(evt.is_some(), "expected the stream panel");
        assert!(engine.latest_frame(FeedId(0)).is_none());

        let stats = engine.shared_stats();
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let cached = stats
                .lock()
                .unwrap()
                .feed(FeedId(0))
                .map(|f| (f.cached_frames, f.frame_size));
            if cached == Some((2, Some((320, 240)))) {
                break;
            }
            assert!(Instant::now() < deadline, "cache never reported: {cached:?}");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn bus_subscribers_disconnect_on_shutdown() {
        let engine = ViewerEngine::new(EngineOptions::new(vec![closed_port_url()])).unwrap();
        let events = engine.event_bus().subscribe();
        assert!(events.recv_timeout(Duration::from_secs(2)).is_ok());
        engine.shutdown();
        while events.try_recv().is_ok() {}
        assert!(events.try_recv().unwrap_err().is_disconnected());
    }

    #[test]
    fn connection_failure_is_reported() {
        let engine = ViewerEngine::new(EngineOptions::new(vec![closed_port_url()])).unwrap();
        let evt = wait_for(&engine, 5_000, |e| matches!(e, ViewerEvent::FrameError { .. }));
        assert!(evt.is_some(), "expected a frame error");
    }

    #[test]
    fn retry_command_starts_new_attempt() {
        let engine = ViewerEngine::new(EngineOptions::new(vec![closed_port_url()])).unwrap();
        let first = wait_for(&engine, 2_000, |e| matches!(e, ViewerEvent::Restarted { .. }));
        engine.retry_feed(FeedId(0));
        let second = wait_for(&engine, 2_000, |e| matches!(e, ViewerEvent::Restarted { .. }));
        match (first, second) {
            (
                Some(ViewerEvent::Restarted { attempt: a, .. }),
                Some(ViewerEvent::Restarted { attempt: b, .. }),
            ) => assert!(b > a),
            other => panic!("expected two restarts, got {other:?}"),
        }
    }

    #[test]
    fn hidden_page_blocks_retry_command() {
        let engine = ViewerEngine::new(EngineOptions::new(vec![closed_port_url()])).unwrap();
        wait_for(&engine, 2_000, |e| matches!(e, ViewerEvent::Restarted { .. }));
        engine.set_page_visible(false);
        engine.retry_all();
        let evt = wait_for(&engine, 500, |e| matches!(e, ViewerEvent::Restarted { .. }));
        assert!(evt.is_none());
    }

    #[test]
    fn stats_snapshot_tracks_feeds() {
        let engine = ViewerEngine::new(EngineOptions::new(vec![
            closed_port_url(),
            closed_port_url(),
        ]))
        .unwrap();
        let stats = engine.shared_stats();
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let ready = stats.lock().map(|s| s.feeds.len() == 2).unwrap_or(false);
            if ready || Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        let snapshot = stats.lock().unwrap().clone();
        assert_eq!(snapshot.feeds.len(), 2);
        assert!(snapshot.started_at.is_some());
        assert!(snapshot.feeds.iter().all(|f| f.restarts >= 1));
        assert!(snapshot.feeds.iter().all(|f| f.panel != Panel::Stream));
    }
}
