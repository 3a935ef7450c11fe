//! Controller timers
//!
//! One optional deadline per timer kind. Arming a kind replaces its previous
//! deadline, so a controller never has two load timeouts or two spinner
//! reveals pending.

use std::time::Instant;

/// The timers a controller can have outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Delay between the warmup hint and the first attempt
    Warmup,
    /// Maximum wait for the first frame of the current attempt
    LoadTimeout,
    /// Delay before the loading panel is revealed
    SpinnerReveal,
    /// Backoff wait before the next attempt
    Retry,
    /// Recurring empty-payload probe
    StallProbe,
    /// Recurring health check
    HealthCheck,
}

impl TimerKind {
    pub const ALL: [TimerKind; 6] = [
        TimerKind::Warmup,
        TimerKind::LoadTimeout,
        TimerKind::SpinnerReveal,
        TimerKind::Retry,
        TimerKind::StallProbe,
        TimerKind::HealthCheck,
    ];

    fn slot(self) -> usize {
        match self {
            TimerKind::Warmup => 0,
            TimerKind::LoadTimeout => 1,
            TimerKind::SpinnerReveal => 2,
            TimerKind::Retry => 3,
            TimerKind::StallProbe => 4,
            TimerKind::HealthCheck => 5,
        }
    }
}

/// Pending deadlines of one controller
#[derive(Debug, Clone, Default)]
pub struct Timers {
    deadlines: [Option<Instant>; 6],
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `kind` at `at`, replacing any pending deadline of that kind
    pub fn arm(&mut self, kind: TimerKind, at: Instant) {
        self.deadlines[kind.slot()] = Some(at);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines[kind.slot()] = None;
    }

    pub fn cancel_all(&mut self) {
        self.deadlines = [None; 6];
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines[kind.slot()].is_some()
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines[kind.slot()]
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Remove and return the earliest timer that is due at `now`.
    ///
    /// Ties resolve in [`TimerKind::ALL`] order.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKind> {
        self.pop_due_except(now, &[])
    }

    /// Like [`pop_due`](Self::pop_due), but never returns a kind in `fired`.
    /// Lets a caller fire each kind at most once per tick even when a
    /// handler re-arms its own timer at `now`.
    pub fn pop_due_except(&mut self, now: Instant, fired: &[TimerKind]) -> Option<TimerKind> {
        let mut due: Option<(TimerKind, Instant)> = None;
        for kind in TimerKind::ALL {
            if fired.contains(&kind) {
                continue;
            }
            if let Some(at) = self.deadlines[kind.slot()] {
                if at <= now && due.map_or(true, |(_, best)| at < best) {
                    due = Some((kind, at));
                }
            }
        }
        let (kind, _) = due?;
        self.cancel(kind);
        Some(kind)
    }
}
