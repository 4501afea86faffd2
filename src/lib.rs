//! Admission control for a load-generation harness.
//!
//! This crate bounds how fast a driver may issue requests against a system under
//! test, independent of how many concurrent callers want to issue them.
//!
//! # Limiters
//! - [`rate_limit::AdaptiveRateLimiter`]: a permit pool refilled once per window by a
//!   background job, with an optional slow-start ramp towards the target rate.
//! - [`rate_limit::FixedWindowLimiter`]: a lock-protected counter over wall-clock windows,
//!   no background work.
//! - [`rate_limit::factory::build_limiter`]: a `governor` limiter configured with a refresh
//!   period, a quota and a 5 ms acquisition timeout.
//!
//! # Refill scheduling
//! Refill loops run on a [`rate_limit::RefillScheduler`] owned by whoever composes the
//! limiters. Every limiter started on the same scheduler shares its worker, so a slow
//! refill in one instance delays the others.
//!
//! # Basic Usage
//! ```no_run
//! use bombardier_limiter::rate_limit::{
//!     AdaptiveRateLimiter, AdaptiveRateSettings, RefillScheduler, TimeWindow,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = RefillScheduler::dedicated("refill")?;
//! let settings = AdaptiveRateSettings::builder()
//!     .target_rate(300)
//!     .window(TimeWindow::Minutes)
//!     .build();
//! let limiter = AdaptiveRateLimiter::new(settings)?;
//! limiter.start(&scheduler)?;
//!
//! if limiter.try_acquire() {
//!     // issue a request
//! }
//! limiter.acquire().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Metrics
//! Emits metrics and tracing records through the `internal_event` module.
pub mod rate_limit;

mod internal_event;
#[cfg(test)]
pub mod test_utils;

#[macro_use]
extern crate tracing;
