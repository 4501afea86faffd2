//! Limiters built on `governor`, configured the way the driver's account limiters are:
//! a refresh period, a quota per period and a short acquisition timeout.

use std::{
    collections::HashMap,
    num::NonZeroU32,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use governor::{DefaultDirectRateLimiter, Quota};
use snafu::OptionExt;

use super::{
    ConfigError, TimeWindow,
    error::{RateTooLargeSnafu, ZeroRateSnafu},
};
use crate::internal_event::AdmissionDecision;

/// How long [`LimiterHandle::acquire`] waits before treating the attempt as a rejection.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(5);

const NAME_PREFIX: &str = "rate_limiter:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LimiterConfig {
    limit_refresh_period: Duration,
    limit_for_period: NonZeroU32,
    timeout: Duration,
    quota: Quota,
}

impl LimiterConfig {
    /// `rate` permits per second for [`TimeWindow::Seconds`], per minute for any other
    /// window.
    pub fn new(rate: usize, window: TimeWindow) -> Result<Self, ConfigError> {
        let limit = u32::try_from(rate)
            .ok()
            .context(RateTooLargeSnafu {
                rate,
                max: u32::MAX as usize,
            })?;
        let limit_for_period = NonZeroU32::new(limit).context(ZeroRateSnafu)?;

        let (limit_refresh_period, quota) = match window {
            TimeWindow::Seconds => (Duration::from_secs(1), Quota::per_second(limit_for_period)),
            _ => (Duration::from_secs(60), Quota::per_minute(limit_for_period)),
        };

        Ok(Self {
            limit_refresh_period,
            limit_for_period,
            timeout: ACQUIRE_TIMEOUT,
            quota,
        })
    }

    pub fn limit_refresh_period(&self) -> Duration {
        self.limit_refresh_period
    }

    pub fn limit_for_period(&self) -> u32 {
        self.limit_for_period.get()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// A named `governor` limiter. Clones share the same quota.
#[derive(Clone)]
pub struct LimiterHandle {
    name: Arc<str>,
    config: LimiterConfig,
    limiter: Arc<DefaultDirectRateLimiter>,
    admission: AdmissionDecision,
}

impl LimiterHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn try_acquire(&self) -> bool {
        let admitted = self.limiter.check().is_ok();
        self.admission.emit(admitted);
        admitted
    }

    /// Waits at most the configured timeout for a permit. Returns `false` when none
    /// became available in time.
    pub async fn acquire(&self) -> bool {
        let admitted = tokio::time::timeout(self.config.timeout, self.limiter.until_ready())
            .await
            .is_ok();
        if !admitted {
            trace!(message = "Acquisition timed out.", limiter = %self.name);
        }
        self.admission.emit(admitted);
        admitted
    }
}

impl std::fmt::Debug for LimiterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterHandle")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

/// Builds the limiter for `name` admitting `rate` permits per refresh period.
pub fn build_limiter(
    name: &str,
    rate: usize,
    window: TimeWindow,
) -> Result<LimiterHandle, ConfigError> {
    let config = LimiterConfig::new(rate, window)?;
    let name: Arc<str> = format!("{NAME_PREFIX}{name}").into();

    debug!(
        message = "Built limiter.",
        limiter = %name,
        limit_for_period = config.limit_for_period(),
        refresh_period_ms = config.limit_refresh_period.as_millis(),
    );
    Ok(LimiterHandle {
        name,
        limiter: Arc::new(DefaultDirectRateLimiter::direct(config.quota)),
        config,
        admission: AdmissionDecision::register("factory"),
    })
}

/// Hands out one limiter per name, building it on first use.
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    limiters: Mutex<HashMap<String, LimiterHandle>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the limiter registered under `name`. `rate` and `window` only apply the
    /// first time a name is seen.
    pub fn limiter(
        &self,
        name: &str,
        rate: usize,
        window: TimeWindow,
    ) -> Result<LimiterHandle, ConfigError> {
        let mut limiters = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(limiter) = limiters.get(name) {
            return Ok(limiter.clone());
        }

        let limiter = build_limiter(name, rate, window)?;
        limiters.insert(name.to_owned(), limiter.clone());
        Ok(limiter)
    }

    pub fn len(&self) -> usize {
        self.limiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
