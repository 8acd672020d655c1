//! Liveness heartbeats for long-running jobs.
//!
//! There is no job timeout, so observers rely on heartbeats to tell a slow
//! job from a dead one. Time comes from an injectable [`Clock`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use docharvest_shared::JobId;

use crate::progress::{ProgressEvent, ProgressReporter, Stage};

/// Log line carried by heartbeat events.
pub const HEARTBEAT_LOG: &str = "Background task still running...";

/// Message carried by heartbeat events.
pub const HEARTBEAT_MESSAGE: &str = "Processing...";

/// Monotonic time source, as an offset from an arbitrary origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Wall-clock-independent system time based on [`Instant`].
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, now: Duration) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Emits a synthetic progress event when `interval` has passed since the
/// last emission, genuine or synthetic.
pub struct HeartbeatManager {
    job_id: JobId,
    interval: Duration,
    reporter: Option<Arc<dyn ProgressReporter>>,
    clock: Arc<dyn Clock>,
    last_heartbeat: Duration,
}

impl HeartbeatManager {
    /// A zero interval makes every [`send_if_needed`](Self::send_if_needed) emit.
    pub fn new(
        job_id: JobId,
        interval: Duration,
        reporter: Option<Arc<dyn ProgressReporter>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let last_heartbeat = clock.now();
        Self {
            job_id,
            interval,
            reporter,
            clock,
            last_heartbeat,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_heartbeat(&self) -> Duration {
        self.last_heartbeat
    }

    /// Emit a heartbeat if `now - last >= interval`. Returns whether one was sent.
    pub fn send_if_needed(&mut self, stage: Stage, progress: u8) -> bool {
        let job_id = self.job_id;
        self.send_with(|| ProgressEvent::new(job_id, stage, progress, HEARTBEAT_MESSAGE))
    }

    /// Like [`send_if_needed`](Self::send_if_needed), with the event's stage,
    /// percent and job context taken from `base`.
    pub fn send_with(&mut self, base: impl FnOnce() -> ProgressEvent) -> bool {
        let Some(reporter) = &self.reporter else {
            return false;
        };

        let now = self.clock.now();
        if now.saturating_sub(self.last_heartbeat) < self.interval {
            return false;
        }

        let mut event = base();
        event.message = HEARTBEAT_MESSAGE.to_string();
        event.error = None;
        event.heartbeat = true;
        event.log = Some(HEARTBEAT_LOG.to_string());
        reporter.report(&event);

        self.last_heartbeat = now;
        true
    }

    /// Restart the interval without emitting.
    pub fn reset(&mut self) {
        self.last_heartbeat = self.clock.now();
    }
}
