use snafu::Snafu;

/// Rejected limiter configuration. Raised at construction so misuse surfaces
/// before any request is admitted.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("rate must be positive"))]
    ZeroRate,

    #[snafu(display("rate {rate} exceeds the maximum of {max} permits"))]
    RateTooLarge { rate: usize, max: usize },

    #[snafu(display("slow start ramp step must be positive"))]
    ZeroRampStep,
}

/// Failures of a single permit pool operation.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum PoolError {
    #[snafu(display("permit pool is closed"))]
    Closed,

    #[snafu(display("permit pool is already full ({capacity} permits)"))]
    Overflow { capacity: usize },
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum AcquireError {
    #[snafu(display("rate limiter {instance} has been stopped"))]
    Stopped { instance: u64 },
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum LifecycleError {
    #[snafu(display("rate limiter {instance} cannot be started from state {state:?}"))]
    NotIdle {
        instance: u64,
        state: super::LimiterState,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SchedulerError {
    #[snafu(display("failed to build refill runtime: {source}"))]
    BuildRuntime { source: std::io::Error },

    #[snafu(display("failed to spawn refill worker thread {name}: {source}"))]
    SpawnWorker {
        name: String,
        source: std::io::Error,
    },

    #[snafu(display("no tokio runtime available: {source}"))]
    NoRuntime {
        source: tokio::runtime::TryCurrentError,
    },
}
