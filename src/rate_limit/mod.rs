//! Bound the rate at which a load driver admits requests.

mod adaptive;
mod error;
pub mod factory;
mod fixed_window;
pub mod layer;
mod permit_pool;
mod scheduler;

use std::time::Duration;

use bon::Builder;
use serde::Deserialize;
use snafu::ensure;

pub use adaptive::{AdaptiveRateLimiter, LimiterState, RefillStats};
pub use error::{AcquireError, ConfigError, LifecycleError, PoolError, SchedulerError};
pub use fixed_window::FixedWindowLimiter;
pub use layer::{AdmissionLayer, RateLimit};
pub use permit_pool::{PermitPool, SemaphorePool};
pub use scheduler::RefillScheduler;

use error::{RateTooLargeSnafu, ZeroRampStepSnafu, ZeroRateSnafu};

fn instant_now() -> tokio::time::Instant {
    tokio::time::Instant::now()
}

/// The time span over which a rate quota is defined and replenished.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    Seconds,
    #[default]
    Minutes,
    Hours,
    Days,
}

impl TimeWindow {
    pub const fn duration(self) -> Duration {
        match self {
            TimeWindow::Seconds => Duration::from_secs(1),
            TimeWindow::Minutes => Duration::from_secs(60),
            TimeWindow::Hours => Duration::from_secs(60 * 60),
            TimeWindow::Days => Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Configuration of an [`AdaptiveRateLimiter`].
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `target_rate` | required | Permits admitted per window once the ramp is complete |
/// | `window` | `minutes` | Time span over which `target_rate` permits are allowed |
/// | `slow_start` | `true` | Start at one permit per window and ramp up towards `target_rate` |
/// | `ramp_step` | 100 | Increase of the effective rate applied on every refill while ramping |
///
/// # Example
///
/// ```rust
/// use bombardier_limiter::rate_limit::{AdaptiveRateSettings, TimeWindow};
///
/// let settings = AdaptiveRateSettings::builder()
///     .target_rate(300)
///     .window(TimeWindow::Minutes)
///     .slow_start(true)
///     .build();
/// assert_eq!(settings.get_initial_rate(), 1);
/// ```
#[derive(Clone, Copy, Debug, Builder, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdaptiveRateSettings {
    /// Final admission ceiling, reached after the slow start ramp.
    pub(crate) target_rate: usize,

    #[builder(default)]
    #[serde(default)]
    pub(crate) window: TimeWindow,

    /// When disabled the limiter admits `target_rate` permits from the first window.
    #[builder(default = default_slow_start())]
    #[serde(default = "default_slow_start")]
    pub(crate) slow_start: bool,

    #[builder(default = default_ramp_step())]
    #[serde(default = "default_ramp_step")]
    pub(crate) ramp_step: usize,
}

const fn default_slow_start() -> bool {
    true
}

/// Increase of the effective rate per refill cycle during slow start.
const fn default_ramp_step() -> usize {
    100
}

impl AdaptiveRateSettings {
    pub fn get_target_rate(&self) -> usize {
        self.target_rate
    }

    pub fn get_window(&self) -> TimeWindow {
        self.window
    }

    pub fn get_slow_start(&self) -> bool {
        self.slow_start
    }

    pub fn get_ramp_step(&self) -> usize {
        self.ramp_step
    }

    /// Effective rate of a freshly built limiter.
    pub fn get_initial_rate(&self) -> usize {
        if self.slow_start { 1 } else { self.target_rate }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_rate(self.target_rate)?;
        ensure!(self.ramp_step > 0, ZeroRampStepSnafu);
        Ok(())
    }
}

pub(crate) fn validate_rate(rate: usize) -> Result<(), ConfigError> {
    ensure!(rate > 0, ZeroRateSnafu);
    ensure!(
        rate <= tokio::sync::Semaphore::MAX_PERMITS,
        RateTooLargeSnafu {
            rate,
            max: tokio::sync::Semaphore::MAX_PERMITS,
        }
    );
    Ok(())
}
