use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use super::{ConfigError, TimeWindow, instant_now, validate_rate};
use crate::internal_event::AdmissionDecision;

#[derive(Debug)]
struct Segment {
    started: Instant,
    permits_left: usize,
}

/// Counts ticks against a quota that resets on wall-clock window boundaries.
///
/// No background work: a window that has expired is replaced by the first tick that
/// observes it. Rollover uses a strict comparison, so a tick landing exactly one window
/// after the segment start still counts against the old segment.
///
/// ```rust
/// use bombardier_limiter::rate_limit::{FixedWindowLimiter, TimeWindow};
///
/// let limiter = FixedWindowLimiter::new(5, TimeWindow::Seconds).unwrap();
/// let admitted = (0..6).filter(|_| limiter.tick()).count();
/// assert_eq!(admitted, 5);
/// ```
pub struct FixedWindowLimiter {
    rate: usize,
    window: Duration,
    segment: Mutex<Segment>,
    admission: AdmissionDecision,
}

impl FixedWindowLimiter {
    /// The first window opens now with the full quota available.
    pub fn new(rate: usize, window: TimeWindow) -> Result<Self, ConfigError> {
        validate_rate(rate)?;

        Ok(Self {
            rate,
            window: window.duration(),
            segment: Mutex::new(Segment {
                started: instant_now(),
                permits_left: rate,
            }),
            admission: AdmissionDecision::register("fixed_window"),
        })
    }

    /// Takes one permit from the current window, rolling the window over first if it
    /// has expired. The tick that rolls the window over always succeeds.
    pub fn tick(&self) -> bool {
        let admitted = {
            let mut segment = self.segment.lock().unwrap_or_else(PoisonError::into_inner);
            let now = instant_now();

            if now.saturating_duration_since(segment.started) > self.window {
                *segment = Segment {
                    started: now,
                    permits_left: self.rate - 1,
                };
                trace!(message = "Window rolled over.", rate = self.rate);
                true
            } else if segment.permits_left > 0 {
                segment.permits_left -= 1;
                true
            } else {
                false
            }
        };

        self.admission.emit(admitted);
        admitted
    }

    /// Permits left in the current window, as last observed by a tick.
    pub fn permits_left(&self) -> usize {
        self.segment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .permits_left
    }

    pub fn rate(&self) -> usize {
        self.rate
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl std::fmt::Debug for FixedWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowLimiter")
            .field("rate", &self.rate)
            .field("window", &self.window)
            .field("segment", &self.segment)
            .finish()
    }
}
