//! Multi-feed coordination
//!
//! A page showing several feeds runs one controller per feed plus a shared
//! sweep that restarts any feed whose surface reports an empty payload.
//! Visibility signals are broadcast to every controller.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::health::SWEEP_INTERVAL_MS;

use super::controller::{ControllerConfig, StreamController};
use super::types::{Effect, FeedId, SurfaceStatus};

/// Effects tagged with the feed that produced them
pub type FeedEffects = Vec<(FeedId, Effect)>;

/// Independent controllers with a shared periodic sweep
pub struct FeedSet {
    controllers: Vec<StreamController>,
    sweep_interval: Duration,
    next_sweep: Option<Instant>,
}

impl FeedSet {
    /// One controller per source URL, all sharing `config`
    pub fn new<I, S>(sources: I, config: ControllerConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let controllers = sources
            .into_iter()
            .map(|url| StreamController::new(url, config.clone()))
            .collect();
        Self {
            controllers,
            sweep_interval: Duration::from_millis(SWEEP_INTERVAL_MS),
            next_sweep: None,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    pub fn get(&self, feed: FeedId) -> Option<&StreamController> {
        self.controllers.get(feed.0)
    }

    pub fn get_mut(&mut self, feed: FeedId) -> Option<&mut StreamController> {
        self.controllers.get_mut(feed.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeedId, &StreamController)> {
        self.controllers
            .iter()
            .enumerate()
            .map(|(i, c)| (FeedId(i), c))
    }

    pub fn feed_ids(&self) -> impl Iterator<Item = FeedId> {
        (0..self.controllers.len()).map(FeedId)
    }

    /// True when the shared sweep runs, i.e. more than one feed is shown
    pub fn sweep_enabled(&self) -> bool {
        self.controllers.len() > 1
    }

    pub fn next_sweep(&self) -> Option<Instant> {
        self.next_sweep
    }

    /// Launch every controller and arm the sweep
    pub fn launch(&mut self, now: Instant) -> FeedEffects {
        if self.sweep_enabled() {
            self.next_sweep = Some(now + self.sweep_interval);
        }
        self.each(|c| c.launch(now))
    }

    /// Earliest deadline over all controllers and the sweep
    pub fn next_deadline(&self) -> Option<Instant> {
        self.controllers
            .iter()
            .filter_map(StreamController::next_deadline)
            .chain(self.next_sweep)
            .min()
    }

    /// Fire due timers. `surface` reports the current status of a feed's surface.
    pub fn on_tick<F>(&mut self, now: Instant, mut surface: F) -> FeedEffects
    where
        F: FnMut(FeedId) -> SurfaceStatus,
    {
        let mut out = FeedEffects::new();
        for (i, c) in self.controllers.iter_mut().enumerate() {
            let feed = FeedId(i);
            let status = surface(feed);
            out.extend(c.on_tick(now, status).into_iter().map(|e| (feed, e)));
        }

        if let Some(at) = self.next_sweep {
            if at <= now {
                self.next_sweep = Some(now + self.sweep_interval);
                debug!(feeds = self.controllers.len(), "Running stall sweep");
                for (i, c) in self.controllers.iter_mut().enumerate() {
                    let feed = FeedId(i);
                    let status = surface(feed);
                    out.extend(c.check_surface(now, status).into_iter().map(|e| (feed, e)));
                }
            }
        }
        out
    }

    /// Force-restart a single feed
    pub fn force_restart(&mut self, feed: FeedId, now: Instant) -> FeedEffects {
        match self.controllers.get_mut(feed.0) {
            Some(c) => c.force_restart(now).into_iter().map(|e| (feed, e)).collect(),
            None => Vec::new(),
        }
    }

    pub fn force_restart_all(&mut self, now: Instant) -> FeedEffects {
        self.each(|c| c.force_restart(now))
    }

    pub fn set_page_visible(&mut self, visible: bool, now: Instant) -> FeedEffects {
        self.each(|c| c.set_page_visible(visible, now))
    }

    pub fn set_window_focused(&mut self, focused: bool, now: Instant) -> FeedEffects {
        self.each(|c| c.set_window_focused(focused, now))
    }

    /// Viewport membership is per feed
    pub fn set_in_viewport(&mut self, feed: FeedId, in_viewport: bool, now: Instant) -> FeedEffects {
        match self.controllers.get_mut(feed.0) {
            Some(c) => c
                .set_in_viewport(in_viewport, now)
                .into_iter()
                .map(|e| (feed, e))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn on_page_shown(&mut self, persisted: bool, now: Instant) -> FeedEffects {
        self.each(|c| c.on_page_shown(persisted, now))
    }

    pub fn teardown(&mut self) -> FeedEffects {
        self.next_sweep = None;
        self.each(StreamController::teardown)
    }

    fn each<F>(&mut self, mut f: F) -> FeedEffects
    where
        F: FnMut(&mut StreamController) -> Vec<Effect>,
    {
        let mut out = FeedEffects::new();
        for (i, c) in self.controllers.iter_mut().enumerate() {
            out.extend(f(c).into_iter().map(|e| (FeedId(i), e)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewer::types::{AttemptId, DisplayState};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn attempts(fx: &FeedEffects) -> Vec<(FeedId, AttemptId)> {
        fx.iter()
            .filter_map(|(feed, e)| match e {
                Effect::Load(req) => Some((*feed, req.attempt)),
                _ => None,
            })
            .collect()
    }

    const EMPTY: SurfaceStatus = SurfaceStatus {
        complete: true,
        has_content: false,
        last_frame_at: None,
    };

    const HEALTHY: SurfaceStatus = SurfaceStatus {
        complete: true,
        has_content: true,
        last_frame_at: None,
    };

    /// Three feeds launched and streaming at `t0`, with long per-controller
    /// probes so only the sweep acts inside the test window
    fn streaming_set() -> (FeedSet, Instant) {
        let cfg = ControllerConfig {
            stall_probe_interval: ms(600_000),
            health_check_interval: ms(600_000),
            ..ControllerConfig::default()
        };
        let mut set = FeedSet::new(["/feed/a", "/feed/b", "/feed/c"], cfg);
        let t0 = Instant::now();
        let fx = set.launch(t0);
        for (feed, attempt) in attempts(&fx) {
            set.get_mut(feed).unwrap().on_frame_loaded(attempt, t0);
        }
        (set, t0)
    }

    #[test]
    fn single_feed_has_no_sweep() {
        let mut set = FeedSet::new(["/feed/a"], ControllerConfig::default());
        assert!(!set.sweep_enabled());
        set.launch(Instant::now());
        assert!(set.next_sweep().is_none());
    }

    #[test]
    fn launch_starts_every_feed() {
        let mut set = FeedSet::new(["/feed/a", "/feed/b"], ControllerConfig::default());
        let t0 = Instant::now();
        let fx = set.launch(t0);
        let started: Vec<FeedId> = attempts(&fx).into_iter().map(|(f, _)| f).collect();
        assert_eq!(started, vec![FeedId(0), FeedId(1)]);
        assert_eq!(set.next_sweep(), Some(t0 + ms(120_000)));
    }

    #[test]
    fn sweep_restarts_only_stalled_feeds() {
        let (mut set, t0) = streaming_set();
        let fx = set.on_tick(t0 + ms(120_000), |feed| {
            if feed == FeedId(1) {
                EMPTY
            } else {
                HEALTHY
            }
        });
        let restarted: Vec<FeedId> = attempts(&fx).into_iter().map(|(f, _)| f).collect();
        assert_eq!(restarted, vec![FeedId(1)]);
        assert!(set.get(FeedId(0)).unwrap().is_active());
        assert!(!set.get(FeedId(1)).unwrap().is_active());
        assert_eq!(set.next_sweep(), Some(t0 + ms(240_000)));
    }

    #[test]
    fn sweep_waits_for_its_interval() {
        let (mut set, t0) = streaming_set();
        let fx = set.on_tick(t0 + ms(60_000), |_| EMPTY);
        assert!(attempts(&fx).is_empty());
    }

    #[test]
    fn sweep_skips_hidden_feeds() {
        let (mut set, t0) = streaming_set();
        set.set_page_visible(false, t0);
        let fx = set.on_tick(t0 + ms(120_000), |_| EMPTY);
        assert!(attempts(&fx).is_empty());
    }

    #[test]
    fn visibility_is_broadcast() {
        let (mut set, t0) = streaming_set();
        set.set_window_focused(false, t0);
        assert!(set.iter().all(|(_, c)| !c.should_run()));
        set.set_window_focused(true, t0);
        assert!(set.iter().all(|(_, c)| c.should_run()));
    }

    #[test]
    fn viewport_is_per_feed() {
        let mut set = FeedSet::new(["/feed/a", "/feed/b"], ControllerConfig::default());
        let t0 = Instant::now();
        let fx = set.launch(t0);
        let (_, a0) = attempts(&fx)[0];
        set.get_mut(FeedId(0)).unwrap().on_frame_error(a0, t0);

        set.set_in_viewport(FeedId(0), false, t0);
        assert!(!set.get(FeedId(0)).unwrap().visibility().in_viewport);
        assert!(set.get(FeedId(1)).unwrap().visibility().in_viewport);

        let fx = set.set_in_viewport(FeedId(0), true, t0 + ms(10));
        assert_eq!(attempts(&fx).len(), 1);
        assert_eq!(attempts(&fx)[0].0, FeedId(0));
    }

    #[test]
    fn force_restart_targets_one_feed() {
        let (mut set, t0) = streaming_set();
        let fx = set.force_restart(FeedId(2), t0 + ms(5));
        assert_eq!(attempts(&fx).len(), 1);
        assert!(set.force_restart(FeedId(9), t0).is_empty());
        assert_eq!(
            set.get(FeedId(0)).unwrap().display_state(),
            DisplayState::Streaming
        );
    }

    #[test]
    fn next_deadline_includes_sweep() {
        let (set, t0) = streaming_set();
        assert_eq!(set.next_deadline(), Some(t0 + ms(120_000)));
    }

    #[test]
    fn teardown_stops_all_feeds() {
        let (mut set, t0) = streaming_set();
        set.teardown();
        assert!(set.next_deadline().is_none());
        assert!(set.iter().all(|(_, c)| c.is_torn_down()));
        assert!(set.on_tick(t0 + ms(500_000), |_| EMPTY).is_empty());
    }
}
