//! Timer state for the two periodic controllers.
//!
//! Both are passive: the engine's event loop asks them what is due on each
//! tick, performs the I/O itself, and reports back. Stopping either one is a
//! plain state reset, so disconnect cancels them at the current suspension
//! point.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Requests arriving within this window of an emission are coalesced.
pub const CLOCK_COALESCE: Duration = Duration::from_secs(2);

/// Groups covered by one resync status request.
pub const RESYNC_BLOCK: u8 = 32;

/// Status requests allowed in flight at once during a resync sweep.
pub const RESYNC_MAX_OUTSTANDING: usize = 4;

/// Schedules time broadcasts: periodically, and on request from the network.
pub struct ClockSync {
    interval: Duration,
    running: bool,
    next_due: Option<Instant>,
    pending: bool,
    last_emit: Option<Instant>,
}

impl ClockSync {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            running: false,
            next_due: None,
            pending: false,
            last_emit: None,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.running = true;
        self.next_due = Some(now + self.interval);
        self.pending = false;
        self.last_emit = None;
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.next_due = None;
        self.pending = false;
    }

    /// A clock request SAL arrived. Coalesced if an answer is already queued
    /// or one was emitted within the last [`CLOCK_COALESCE`].
    pub fn note_request(&mut self, now: Instant) {
        if !self.running || self.pending {
            return;
        }
        if let Some(t) = self.last_emit {
            if now.duration_since(t) < CLOCK_COALESCE {
                return;
            }
        }
        self.pending = true;
    }

    /// Force an emission outside the schedule (`publishTime`).
    pub fn force(&mut self) {
        if self.running {
            self.pending = true;
        }
    }

    pub fn due(&self, now: Instant) -> bool {
        self.running && (self.pending || self.next_due.is_some_and(|t| now >= t))
    }

    /// Record an emission: clears any pending request and restarts the
    /// periodic interval.
    pub fn emitted(&mut self, now: Instant) {
        self.pending = false;
        self.last_emit = Some(now);
        self.next_due = Some(now + self.interval);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.running {
            return None;
        }
        self.next_due
    }
}

/// Schedules bulk status-request sweeps over the 0..=255 group space of each
/// lighting application, throttled to a bounded in-flight count.
pub struct Resync {
    interval: Duration,
    running: bool,
    next_due: Option<Instant>,
    queue: VecDeque<(u8, u8)>,
    outstanding: usize,
}

impl Resync {
    /// A zero interval disables resync entirely.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            running: false,
            next_due: None,
            queue: VecDeque::new(),
            outstanding: 0,
        }
    }

    /// Start on connect. The first sweep is due immediately so the group
    /// database is rebuilt without waiting a full interval.
    pub fn start(&mut self, now: Instant) {
        if self.interval.is_zero() {
            return;
        }
        self.running = true;
        self.next_due = Some(now);
        self.queue.clear();
        self.outstanding = 0;
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.next_due = None;
        self.queue.clear();
        self.outstanding = 0;
    }

    /// Status requests to send now: starts a sweep when one is due and the
    /// previous sweep has fully drained, then releases queued blocks up to
    /// the in-flight cap.
    pub fn poll(&mut self, now: Instant, applications: &[u8]) -> Vec<(u8, u8)> {
        if !self.running {
            return Vec::new();
        }
        if self.queue.is_empty()
            && self.outstanding == 0
            && self.next_due.is_some_and(|t| now >= t)
        {
            for &app in applications {
                for block in (0u16..=255).step_by(RESYNC_BLOCK as usize) {
                    self.queue.push_back((app, block as u8));
                }
            }
            self.next_due = Some(now + self.interval);
        }
        let mut out = Vec::new();
        while self.outstanding < RESYNC_MAX_OUTSTANDING {
            match self.queue.pop_front() {
                Some(req) => {
                    self.outstanding += 1;
                    out.push(req);
                }
                None => break,
            }
        }
        out
    }

    /// One outstanding request finished (report arrived or timed out).
    pub fn request_done(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.running {
            return None;
        }
        self.next_due
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
