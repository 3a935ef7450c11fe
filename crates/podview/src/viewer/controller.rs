//! Stream controller
//!
//! Pure-logic state machine that keeps one live image feed on screen. It
//! owns no I/O: the host feeds it signals (frame loaded, frame error, timer
//! ticks, visibility changes) together with the current `Instant`, and
//! carries out the [`Effect`]s it returns.
//!
//! Each `start()` opens a new [`AttemptId`]. Surface events for any other
//! attempt are ignored, so a request that outlives a restart can never touch
//! the state of its replacement.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::health::{HEALTH_CHECK_INTERVAL_MS, STALL_PROBE_INTERVAL_MS};
use crate::config::network::CACHE_BUSTER_PARAM;
use crate::config::timeouts::{LOAD_TIMEOUT_MS, SPINNER_REVEAL_MS, WARMUP_DELAY_MS};

use super::retry::{RetryPolicy, RetryState};
use super::timers::{TimerKind, Timers};
use super::types::{
    AttemptId, DisplayState, Effect, FrameRequest, Panel, SurfaceStatus, Visibility,
};

/// Timing and endpoint knobs for one controller
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub retry: RetryPolicy,
    pub load_timeout: Duration,
    pub spinner_reveal: Duration,
    pub stall_probe_interval: Duration,
    pub health_check_interval: Duration,
    pub warmup_delay: Duration,
    /// Optional backend warmup endpoint, hit once before the first attempt
    pub warmup_url: Option<String>,
    /// Optional relay-status endpoint polled by the health check
    pub relay_status_url: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            load_timeout: Duration::from_millis(LOAD_TIMEOUT_MS),
            spinner_reveal: Duration::from_millis(SPINNER_REVEAL_MS),
            stall_probe_interval: Duration::from_millis(STALL_PROBE_INTERVAL_MS),
            health_check_interval: Duration::from_millis(HEALTH_CHECK_INTERVAL_MS),
            warmup_delay: Duration::from_millis(WARMUP_DELAY_MS),
            warmup_url: None,
            relay_status_url: None,
        }
    }
}

/// Keeps one remote live image stream rendered, recovering from failures
pub struct StreamController {
    source_url: String,
    config: ControllerConfig,
    display_state: DisplayState,
    panel: Panel,
    is_active: bool,
    retry: RetryState,
    last_frame_at: Option<Instant>,
    visibility: Visibility,
    timers: Timers,
    /// Generation counter, bumped by every `start()`
    attempt_seq: AttemptId,
    /// Attempt whose surface events are still accepted
    current_attempt: Option<AttemptId>,
    /// A request was issued and has neither rendered nor failed yet
    in_flight: bool,
    last_cache_buster: u64,
    launched: bool,
    torn_down: bool,
}

impl StreamController {
    /// Create a controller for `source_url`. Nothing happens until [`launch`](Self::launch).
    pub fn new(source_url: impl Into<String>, config: ControllerConfig) -> Self {
        let retry = RetryState::new(config.retry);
        Self {
            source_url: source_url.into(),
            config,
            display_state: DisplayState::Loading,
            panel: Panel::Loading,
            is_active: false,
            retry,
            last_frame_at: None,
            visibility: Visibility::default(),
            timers: Timers::new(),
            attempt_seq: AttemptId::default(),
            current_attempt: None,
            in_flight: false,
            last_cache_buster: 0,
            launched: false,
            torn_down: false,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn display_state(&self) -> DisplayState {
        self.display_state
    }

    /// The panel currently presented to the user
    pub fn panel(&self) -> Panel {
        self.panel
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn retry_count(&self) -> u32 {
        self.retry.count()
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry.delay()
    }

    pub fn last_frame_at(&self) -> Option<Instant> {
        self.last_frame_at
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn should_run(&self) -> bool {
        self.visibility.should_run()
    }

    pub fn current_attempt(&self) -> Option<AttemptId> {
        self.current_attempt
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    /// Earliest instant at which [`on_tick`](Self::on_tick) has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Arm the background checks and begin loading.
    ///
    /// With a warmup endpoint configured, the hint goes out first and the
    /// first attempt follows after `warmup_delay` whatever the outcome.
    pub fn launch(&mut self, now: Instant) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.launched || self.torn_down {
            return fx;
        }
        self.launched = true;
        self.timers
            .arm(TimerKind::StallProbe, now + self.config.stall_probe_interval);
        self.timers
            .arm(TimerKind::HealthCheck, now + self.config.health_check_interval);
        fx.push(Effect::Present(self.panel));

        match self.config.warmup_url.clone() {
            Some(url) => {
                debug!(source = %self.source_url, warmup = %url, "Sending warmup hint");
                fx.push(Effect::Warmup { url });
                self.timers
                    .arm(TimerKind::Warmup, now + self.config.warmup_delay);
            }
            None => self.start_into(now, &mut fx),
        }
        fx
    }

    /// (Re)initiate an attempt to load the stream. No-op while the host
    /// says the controller should not run.
    pub fn start(&mut self, now: Instant) -> Vec<Effect> {
        let mut fx = Vec::new();
        self.start_into(now, &mut fx);
        fx
    }

    /// Cancel the pending attempt and drop the active request
    pub fn stop(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        self.stop_into(&mut fx);
        fx
    }

    /// Reset retry state and start over
    pub fn force_restart(&mut self, now: Instant) -> Vec<Effect> {
        let mut fx = Vec::new();
        self.force_restart_into(now, &mut fx);
        fx
    }

    /// Cancel everything. Every later signal is ignored.
    pub fn teardown(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.torn_down {
            return fx;
        }
        self.stop_into(&mut fx);
        self.timers.cancel_all();
        self.torn_down = true;
        debug!(source = %self.source_url, "Controller torn down");
        fx
    }

    // ------------------------------------------------------------------
    // Surface events
    // ------------------------------------------------------------------

    /// A frame of `attempt` decoded successfully
    pub fn on_frame_loaded(&mut self, attempt: AttemptId, now: Instant) -> Vec<Effect> {
        let mut fx = Vec::new();
        if !self.accepts(attempt) {
            return fx;
        }
        self.timers.cancel(TimerKind::LoadTimeout);
        self.timers.cancel(TimerKind::SpinnerReveal);
        self.timers.cancel(TimerKind::Retry);
        self.in_flight = false;
        self.last_frame_at = Some(now);
        if !self.is_active {
            info!(source = %self.source_url, %attempt, retries = self.retry.count(), "Stream active");
        }
        self.is_active = true;
        self.retry.reset();
        self.display_state = DisplayState::Streaming;
        self.present_into(Panel::Stream, &mut fx);
        fx
    }

    /// Transport failure for `attempt`
    pub fn on_frame_error(&mut self, attempt: AttemptId, now: Instant) -> Vec<Effect> {
        let mut fx = Vec::new();
        if !self.accepts(attempt) {
            return fx;
        }
        warn!(source = %self.source_url, %attempt, "Stream request failed");
        self.fail_into(now, &mut fx);
        fx
    }

    /// Result of a relay-status query; `None` when the query failed
    pub fn on_relay_status(&mut self, active_relays: Option<u32>, now: Instant) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.torn_down {
            return fx;
        }
        match active_relays {
            None => debug!(source = %self.source_url, "Relay status unavailable"),
            Some(0) if self.is_active && self.should_run() => {
                warn!(source = %self.source_url, "No active upstream relays, restarting");
                self.force_restart_into(now, &mut fx);
            }
            Some(count) => debug!(source = %self.source_url, count, "Relay status"),
        }
        fx
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Fire every timer due at `now`. `surface` is the rendering surface's
    /// current report, read by the stall probe and the health check.
    pub fn on_tick(&mut self, now: Instant, surface: SurfaceStatus) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.torn_down {
            return fx;
        }
        self.note_render(surface);
        let mut fired = Vec::with_capacity(TimerKind::ALL.len());
        while let Some(kind) = self.timers.pop_due_except(now, &fired) {
            fired.push(kind);
            match kind {
                TimerKind::Warmup => self.start_into(now, &mut fx),
                TimerKind::LoadTimeout => {
                    warn!(
                        source = %self.source_url,
                        timeout_ms = self.config.load_timeout.as_millis() as u64,
                        "No frame before load timeout"
                    );
                    self.fail_into(now, &mut fx);
                }
                TimerKind::SpinnerReveal => self.reveal_spinner_into(now, &mut fx),
                TimerKind::Retry => self.start_into(now, &mut fx),
                TimerKind::StallProbe => {
                    self.timers
                        .arm(TimerKind::StallProbe, now + self.config.stall_probe_interval);
                    if self.should_run() && self.is_stalled(surface) {
                        warn!(source = %self.source_url, "Stall probe found an empty payload");
                        self.force_restart_into(now, &mut fx);
                    }
                }
                TimerKind::HealthCheck => {
                    self.timers
                        .arm(TimerKind::HealthCheck, now + self.config.health_check_interval);
                    self.health_check_into(now, surface, &mut fx);
                }
            }
        }
        fx
    }

    /// Empty-payload check used by the shared multi-feed sweep
    pub fn check_surface(&mut self, now: Instant, surface: SurfaceStatus) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.torn_down || !self.should_run() {
            return fx;
        }
        if self.is_stalled(surface) {
            warn!(source = %self.source_url, "Sweep found an empty payload");
            self.force_restart_into(now, &mut fx);
        }
        fx
    }

    // ------------------------------------------------------------------
    // Visibility signals
    // ------------------------------------------------------------------

    pub fn set_page_visible(&mut self, visible: bool, now: Instant) -> Vec<Effect> {
        self.visibility.page_visible = visible;
        self.resume_if_needed(now)
    }

    pub fn set_window_focused(&mut self, focused: bool, now: Instant) -> Vec<Effect> {
        self.visibility.window_focused = focused;
        self.resume_if_needed(now)
    }

    pub fn set_in_viewport(&mut self, in_viewport: bool, now: Instant) -> Vec<Effect> {
        self.visibility.in_viewport = in_viewport;
        if in_viewport {
            self.resume_if_needed(now)
        } else {
            Vec::new()
        }
    }

    /// The page was shown again. A page restored from the history cache
    /// lost its connection while suspended, so it always restarts.
    pub fn on_page_shown(&mut self, persisted: bool, now: Instant) -> Vec<Effect> {
        if persisted && !self.torn_down && self.launched && self.should_run() {
            info!(source = %self.source_url, "Page restored from cache, restarting");
            return self.force_restart(now);
        }
        self.resume_if_needed(now)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn accepts(&self, attempt: AttemptId) -> bool {
        !self.torn_down && self.current_attempt == Some(attempt)
    }

    /// Follow the surface's per-frame timestamp while the stream is up
    fn note_render(&mut self, surface: SurfaceStatus) {
        let Some(at) = surface.last_frame_at else {
            return;
        };
        if self.is_active && self.last_frame_at.map_or(true, |prev| at > prev) {
            self.last_frame_at = Some(at);
        }
    }

    fn is_stalled(&self, surface: SurfaceStatus) -> bool {
        self.is_active && surface.is_empty_payload()
    }

    fn resume_if_needed(&mut self, now: Instant) -> Vec<Effect> {
        if self.torn_down || !self.launched || !self.should_run() || self.is_active {
            return Vec::new();
        }
        debug!(source = %self.source_url, "Visible again with no active stream");
        self.force_restart(now)
    }

    fn start_into(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        if self.torn_down || !self.should_run() {
            return;
        }
        self.timers.cancel(TimerKind::Warmup);
        self.timers.cancel(TimerKind::Retry);
        self.retry.record_attempt();
        self.attempt_seq = self.attempt_seq.next();
        let attempt = self.attempt_seq;
        self.current_attempt = Some(attempt);
        self.in_flight = true;
        self.is_active = false;
        if self.display_state == DisplayState::Streaming {
            self.display_state = DisplayState::Loading;
        }
        if self.display_state == DisplayState::Error {
            self.display_state = DisplayState::Loading;
            self.present_into(Panel::Loading, fx);
        }
        self.timers
            .arm(TimerKind::LoadTimeout, now + self.config.load_timeout);
        self.timers
            .arm(TimerKind::SpinnerReveal, now + self.config.spinner_reveal);

        let url = self.cache_busted_url();
        info!(
            source = %self.source_url,
            %attempt,
            retry = self.retry.count(),
            "Starting stream attempt"
        );
        fx.push(Effect::Load(FrameRequest { attempt, url }));
    }

    fn stop_into(&mut self, fx: &mut Vec<Effect>) {
        self.timers.cancel(TimerKind::LoadTimeout);
        self.timers.cancel(TimerKind::SpinnerReveal);
        self.timers.cancel(TimerKind::Retry);
        self.timers.cancel(TimerKind::Warmup);
        self.current_attempt = None;
        self.in_flight = false;
        self.is_active = false;
        if self.display_state == DisplayState::Streaming {
            self.display_state = DisplayState::Loading;
        }
        fx.push(Effect::Clear);
    }

    fn force_restart_into(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        if self.torn_down {
            return;
        }
        self.retry.reset();
        self.timers.cancel(TimerKind::Retry);
        self.is_active = false;
        if self.display_state == DisplayState::Streaming {
            self.display_state = DisplayState::Loading;
        }
        self.start_into(now, fx);
    }

    /// Shared path for transport errors and load timeouts
    fn fail_into(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        self.timers.cancel(TimerKind::LoadTimeout);
        self.current_attempt = None;
        self.in_flight = false;
        self.is_active = false;
        if self.display_state == DisplayState::Streaming {
            self.display_state = DisplayState::Loading;
        }
        if !self.should_run() {
            debug!(source = %self.source_url, "Failure while hidden, waiting for visibility");
            return;
        }
        if self.retry.can_retry() {
            let delay = self.retry.take_delay();
            info!(
                source = %self.source_url,
                retry = self.retry.count(),
                delay_ms = delay.as_millis() as u64,
                "Scheduling retry"
            );
            self.timers.arm(TimerKind::Retry, now + delay);
        } else {
            warn!(
                source = %self.source_url,
                retries = self.retry.count(),
                "Retries exhausted"
            );
            self.timers.cancel(TimerKind::SpinnerReveal);
            self.display_state = DisplayState::Error;
            self.present_into(Panel::Error, fx);
        }
    }

    fn reveal_spinner_into(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        if self.is_active || self.display_state != DisplayState::Loading {
            return;
        }
        let recent_frame = self
            .last_frame_at
            .is_some_and(|t| now.saturating_duration_since(t) < self.config.spinner_reveal);
        if !recent_frame {
            self.present_into(Panel::Loading, fx);
        }
    }

    fn health_check_into(&mut self, now: Instant, surface: SurfaceStatus, fx: &mut Vec<Effect>) {
        if !self.should_run() {
            return;
        }
        if self.is_stalled(surface) {
            warn!(source = %self.source_url, "Health check found an empty payload");
            self.force_restart_into(now, fx);
            return;
        }
        let idle = !self.is_active
            && !self.in_flight
            && self.display_state != DisplayState::Error
            && !self.timers.is_armed(TimerKind::Retry)
            && !self.timers.is_armed(TimerKind::Warmup);
        if idle {
            info!(source = %self.source_url, "Health check found no attempt running, starting");
            self.start_into(now, fx);
        }
        if let Some(url) = self.config.relay_status_url.clone() {
            fx.push(Effect::QueryRelayStatus { url });
        }
    }

    fn present_into(&mut self, panel: Panel, fx: &mut Vec<Effect>) {
        if self.panel != panel {
            self.panel = panel;
            fx.push(Effect::Present(panel));
        }
    }

    fn cache_busted_url(&mut self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let stamp = millis.max(self.last_cache_buster + 1);
        self.last_cache_buster = stamp;
        with_query_param(&self.source_url, CACHE_BUSTER_PARAM, &stamp.to_string())
    }
}

/// Append `key=value` to a possibly relative URL, keeping any fragment last
pub(crate) fn with_query_param(url: &str, key: &str, value: &str) -> String {
    let (base, fragment) = match url.find('#') {
        Some(pos) => (&url[..pos], &url[pos..]),
        None => (url, ""),
    };
    let sep = if !base.contains('?') {
        "?"
    } else if base.ends_with('?') || base.ends_with('&') {
        ""
    } else {
        "&"
    };
    format!("{base}{sep}{key}={value}{fragment}")
}
