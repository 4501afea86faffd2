use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::FutureExt;
use snafu::ensure;
use tokio::{sync::watch, task::JoinHandle, time::sleep};

use super::{
    AcquireError, AdaptiveRateSettings, ConfigError, LifecycleError, PermitPool, RefillScheduler,
    SemaphorePool,
    error::{NotIdleSnafu, StoppedSnafu},
    instant_now,
};
use crate::internal_event::{
    AdmissionDecision, PermitReleaseFailed, RampData, RefillCycleCompleted, RefillCycleData,
    RefillJobTerminated, SlowStartRamp,
};

static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Lifecycle of an [`AdaptiveRateLimiter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimiterState {
    /// Built but not started: the initial pool is available, nothing refills it.
    Idle,
    Running,
    /// Stopped explicitly or dropped. Acquirers are rejected.
    Stopped,
    /// The refill job died. Remaining permits can still be taken but the pool is never
    /// replenished again.
    Failed,
}

/// Counters describing the refill job's work so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefillStats {
    pub cycles: u64,
    pub permits_released: u64,
    pub release_failures: u64,
}

/// The admission ceiling and the pool sized to it. Replaced wholesale on every slow
/// start step so acquirers never observe one without the other.
struct RateSnapshot<P> {
    effective_rate: usize,
    pool: P,
}

impl<P: PermitPool> RateSnapshot<P> {
    fn full(effective_rate: usize) -> Arc<Self> {
        Arc::new(Self {
            effective_rate,
            pool: P::with_capacity(effective_rate),
        })
    }
}

struct Events {
    cycle: RefillCycleCompleted,
    ramp: SlowStartRamp,
    release_failed: PermitReleaseFailed,
    terminated: RefillJobTerminated,
    admission: AdmissionDecision,
}

impl Events {
    fn register(instance: u64) -> Self {
        Self {
            cycle: RefillCycleCompleted::register(instance),
            ramp: SlowStartRamp::register(instance),
            release_failed: PermitReleaseFailed::register(instance),
            terminated: RefillJobTerminated::register(instance),
            admission: AdmissionDecision::register("adaptive"),
        }
    }
}

struct Shared<P> {
    settings: AdaptiveRateSettings,
    instance: u64,
    snapshot: watch::Sender<Arc<RateSnapshot<P>>>,
    state: watch::Sender<LimiterState>,
    cycles: AtomicU64,
    permits_released: AtomicU64,
    release_failures: AtomicU64,
    events: Events,
}

impl<P: PermitPool> Shared<P> {
    fn current(&self) -> Arc<RateSnapshot<P>> {
        self.snapshot.borrow().clone()
    }

    fn is_stopped(&self) -> bool {
        *self.state.borrow() == LimiterState::Stopped
    }

    /// One refill cycle: top the pool back up to the effective rate, then advance the
    /// slow start ramp.
    fn refill(&self, started: tokio::time::Instant) {
        let snapshot = self.current();
        let ramping =
            self.settings.slow_start && snapshot.effective_rate < self.settings.target_rate;

        // A ramp installs a full pool. Permits released into the old one would be
        // admitted on top of it by acquirers still holding the old snapshot.
        let (released, failed) = if ramping {
            (0, 0)
        } else {
            self.top_up(&snapshot.pool, snapshot.effective_rate)
        };

        self.events.cycle.emit(RefillCycleData {
            released,
            failed,
            effective_rate: snapshot.effective_rate,
            elapsed: started.elapsed(),
        });

        if ramping {
            self.ramp(snapshot.effective_rate);
        }

        self.permits_released
            .fetch_add(released as u64, Ordering::Relaxed);
        self.release_failures
            .fetch_add(failed as u64, Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Release);
    }

    /// Releases permits one at a time until `pool` holds `effective_rate`. A failed
    /// release is logged and skipped.
    fn top_up(&self, pool: &P, effective_rate: usize) -> (usize, usize) {
        let permits_to_release = effective_rate.saturating_sub(pool.available());

        let mut released = 0;
        let mut failed = 0;
        for _ in 0..permits_to_release {
            match pool.release() {
                Ok(()) => released += 1,
                Err(error) => {
                    failed += 1;
                    self.events.release_failed.emit(&error);
                }
            }
        }
        (released, failed)
    }

    fn ramp(&self, from: usize) {
        let to = from
            .saturating_add(self.settings.ramp_step)
            .min(self.settings.target_rate);

        // Unconsumed permits of the old pool are not carried over.
        let previous = self.snapshot.send_replace(RateSnapshot::full(to));
        previous.pool.close();
        if self.is_stopped() {
            self.current().pool.close();
        }

        self.events.ramp.emit(RampData {
            from,
            to,
            target: self.settings.target_rate,
        });
    }

    /// Moves a running limiter to `Failed`. No-op once it was stopped or already failed.
    fn terminate(&self, reason: &str) {
        let failed = self.state.send_if_modified(|state| {
            if *state == LimiterState::Running {
                *state = LimiterState::Failed;
                true
            } else {
                false
            }
        });
        if failed {
            self.events.terminated.emit(reason);
        }
    }
}

fn panic_reason(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|reason| reason.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "refill job panicked".to_string())
}

/// Fails the limiter when the refill job is dropped without `stop`, which happens when
/// the scheduler's runtime shuts down under it.
struct RefillJobGuard<P: PermitPool> {
    shared: Arc<Shared<P>>,
}

impl<P: PermitPool> Drop for RefillJobGuard<P> {
    fn drop(&mut self) {
        self.shared.terminate("refill job cancelled by its scheduler");
    }
}

async fn run_refill_job<P: PermitPool>(shared: Arc<Shared<P>>) {
    let window = shared.settings.window.duration();
    loop {
        let started = instant_now();
        shared.refill(started);

        // Track window boundaries instead of accumulating the refill's own latency.
        sleep(window.saturating_sub(started.elapsed())).await;
    }
}

/// Permit pool refilled once per window, with an optional slow start.
///
/// With slow start the ceiling starts at a single permit and every refill raises it by
/// `ramp_step` until `target_rate` is reached. The first refill runs when the job
/// starts, so the ceiling is `1 + ramp_step` right after [`start`](Self::start).
/// The ceiling never decreases and never exceeds `target_rate`.
///
/// Refills happen on the [`RefillScheduler`] passed to [`start`](Self::start); the
/// limiter stops refilling once [`stop`](Self::stop) is called or it is dropped.
///
/// ```rust
/// use bombardier_limiter::rate_limit::{AdaptiveRateLimiter, AdaptiveRateSettings, TimeWindow};
///
/// let settings = AdaptiveRateSettings::builder()
///     .target_rate(2)
///     .window(TimeWindow::Seconds)
///     .slow_start(false)
///     .build();
/// let limiter = AdaptiveRateLimiter::new(settings).unwrap();
///
/// assert!(limiter.try_acquire());
/// assert!(limiter.try_acquire());
/// assert!(!limiter.try_acquire());
/// ```
pub struct AdaptiveRateLimiter<P: PermitPool = SemaphorePool> {
    shared: Arc<Shared<P>>,
    job: Mutex<Option<JoinHandle<()>>>,
}

impl AdaptiveRateLimiter {
    pub fn new(settings: AdaptiveRateSettings) -> Result<Self, ConfigError> {
        Self::with_permit_pool(settings)
    }
}

impl<P: PermitPool> AdaptiveRateLimiter<P> {
    /// Builds a limiter over a custom [`PermitPool`] implementation.
    pub fn with_permit_pool(settings: AdaptiveRateSettings) -> Result<Self, ConfigError> {
        settings.validate()?;

        let instance = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let (snapshot, _) = watch::channel(RateSnapshot::full(settings.get_initial_rate()));
        let (state, _) = watch::channel(LimiterState::Idle);

        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                instance,
                snapshot,
                state,
                cycles: AtomicU64::new(0),
                permits_released: AtomicU64::new(0),
                release_failures: AtomicU64::new(0),
                events: Events::register(instance),
            }),
            job: Mutex::new(None),
        })
    }

    /// Spawns the refill job. Its first cycle runs as soon as the scheduler polls it.
    pub fn start(&self, scheduler: &RefillScheduler) -> Result<(), LifecycleError> {
        let mut job = self.job.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self.state();
        ensure!(
            state == LimiterState::Idle,
            NotIdleSnafu {
                instance: self.shared.instance,
                state,
            }
        );
        self.shared.state.send_replace(LimiterState::Running);

        let shared = Arc::clone(&self.shared);
        *job = Some(scheduler.spawn(async move {
            let _guard = RefillJobGuard {
                shared: Arc::clone(&shared),
            };
            if let Err(panic) = AssertUnwindSafe(run_refill_job(Arc::clone(&shared)))
                .catch_unwind()
                .await
            {
                shared.terminate(&panic_reason(panic));
            }
        }));

        info!(
            message = "Rate limiter started.",
            instance = self.shared.instance,
            target_rate = self.shared.settings.target_rate,
            window = ?self.shared.settings.window,
            slow_start = self.shared.settings.slow_start,
        );
        Ok(())
    }

    /// Cancels the refill job and rejects current and future acquirers. Idempotent.
    pub fn stop(&self) {
        let job = self
            .job
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let previous = self.shared.state.send_replace(LimiterState::Stopped);
        if let Some(job) = job {
            job.abort();
        }
        self.shared.current().pool.close();

        if matches!(previous, LimiterState::Running | LimiterState::Failed) {
            info!(message = "Rate limiter stopped.", instance = self.shared.instance);
        }
    }

    /// Takes a permit if one is immediately available. Never waits.
    pub fn try_acquire(&self) -> bool {
        let admitted = self.shared.current().pool.try_acquire();
        self.shared.events.admission.emit(admitted);
        admitted
    }

    /// Waits until a permit is available and takes it.
    ///
    /// There is no timeout: callers needing a bounded wait wrap this future themselves.
    /// Fails only once the limiter is stopped. A limiter whose refill job failed keeps
    /// waiters parked forever.
    pub async fn acquire(&self) -> Result<(), AcquireError> {
        loop {
            ensure!(
                !self.shared.is_stopped(),
                StoppedSnafu {
                    instance: self.shared.instance,
                }
            );

            let snapshot = self.shared.current();
            if snapshot.pool.acquire().await.is_ok() {
                self.shared.events.admission.emit(true);
                return Ok(());
            }
            trace!(
                message = "Permit pool replaced while waiting.",
                instance = self.shared.instance,
            );
        }
    }

    pub fn effective_rate(&self) -> usize {
        self.shared.current().effective_rate
    }

    pub fn target_rate(&self) -> usize {
        self.shared.settings.target_rate
    }

    pub fn available_permits(&self) -> usize {
        self.shared.current().pool.available()
    }

    pub fn instance_id(&self) -> u64 {
        self.shared.instance
    }

    pub fn settings(&self) -> &AdaptiveRateSettings {
        &self.shared.settings
    }

    pub fn state(&self) -> LimiterState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LimiterState> {
        self.shared.state.subscribe()
    }

    pub fn refill_stats(&self) -> RefillStats {
        RefillStats {
            cycles: self.shared.cycles.load(Ordering::Acquire),
            permits_released: self.shared.permits_released.load(Ordering::Relaxed),
            release_failures: self.shared.release_failures.load(Ordering::Relaxed),
        }
    }
}

impl<P: PermitPool> Drop for AdaptiveRateLimiter<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<P: PermitPool> std::fmt::Debug for AdaptiveRateLimiter<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRateLimiter")
            .field("instance", &self.shared.instance)
            .field("settings", &self.shared.settings)
            .field("effective_rate", &self.effective_rate())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        future::Future,
        sync::atomic::AtomicUsize,
        time::{Duration, Instant},
    };

    use tokio::time::timeout;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok, task};

    use super::*;
    use crate::rate_limit::{PoolError, TimeWindow};

    const JUST_AFTER: Duration = Duration::from_millis(1);

    fn settings(target_rate: usize, window: TimeWindow, slow_start: bool) -> AdaptiveRateSettings {
        AdaptiveRateSettings::builder()
            .target_rate(target_rate)
            .window(window)
            .slow_start(slow_start)
            .build()
    }

    fn unpolled(target_rate: usize, window: TimeWindow, slow_start: bool) -> AdaptiveRateLimiter {
        let limiter = AdaptiveRateLimiter::new(settings(target_rate, window, slow_start)).unwrap();
        limiter.start(&RefillScheduler::current().unwrap()).unwrap();
        limiter
    }

    /// Starts a limiter and lets its first refill cycle run.
    async fn started(
        target_rate: usize,
        window: TimeWindow,
        slow_start: bool,
    ) -> AdaptiveRateLimiter {
        let limiter = unpolled(target_rate, window, slow_start);
        sleep(JUST_AFTER).await;
        limiter
    }

    fn drain<P: PermitPool>(limiter: &AdaptiveRateLimiter<P>) -> usize {
        std::iter::from_fn(|| limiter.try_acquire().then_some(())).count()
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
        let started = Instant::now();
        while !condition() {
            assert!(started.elapsed() < deadline, "condition not met within {deadline:?}");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_permit_per_second() {
        let limiter = started(1, TimeWindow::Seconds, false).await;

        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        sleep(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn first_cycle_runs_on_start() {
        let limiter = unpolled(300, TimeWindow::Minutes, true);
        assert_eq!(limiter.effective_rate(), 1);
        assert_eq!(limiter.refill_stats().cycles, 0);

        sleep(JUST_AFTER).await;
        assert_eq!(limiter.effective_rate(), 101);
        assert_eq!(limiter.refill_stats().cycles, 1);

        sleep(Duration::from_secs(59)).await;
        assert_eq!(limiter.effective_rate(), 101);
        assert_eq!(drain(&limiter), 101);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_start_ramps_to_target() {
        let limiter = unpolled(300, TimeWindow::Minutes, true);
        assert_eq!(limiter.effective_rate(), 1);

        sleep(JUST_AFTER).await;
        let mut observed = vec![limiter.effective_rate()];
        for _ in 0..3 {
            sleep(Duration::from_secs(60)).await;
            observed.push(limiter.effective_rate());
        }

        assert_eq!(observed, [101, 201, 300, 300]);
        assert_eq!(limiter.refill_stats().cycles, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_is_capped_at_target() {
        let limiter = AdaptiveRateLimiter::new(
            AdaptiveRateSettings::builder()
                .target_rate(250)
                .window(TimeWindow::Seconds)
                .ramp_step(100)
                .build(),
        )
        .unwrap();
        limiter.start(&RefillScheduler::current().unwrap()).unwrap();

        let mut observed = vec![limiter.effective_rate()];
        sleep(JUST_AFTER).await;
        observed.push(limiter.effective_rate());
        for _ in 0..4 {
            sleep(Duration::from_secs(1)).await;
            observed.push(limiter.effective_rate());
        }

        assert_eq!(observed, [1, 101, 201, 250, 250, 250]);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_step_resets_pool_to_new_ceiling() {
        let limiter = unpolled(300, TimeWindow::Seconds, true);
        assert_eq!(drain(&limiter), 1);

        sleep(JUST_AFTER).await;
        assert_eq!(limiter.available_permits(), 101);
        assert_eq!(drain(&limiter), 101);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(limiter.available_permits(), 201);
        assert_eq!(limiter.refill_stats().permits_released, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_restores_pool_under_zero_load() {
        let limiter = started(5, TimeWindow::Seconds, false).await;
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());

        sleep(Duration::from_secs(1)).await;
        assert_eq!(limiter.available_permits(), 5);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(limiter.available_permits(), 5);
        assert_eq!(
            limiter.refill_stats(),
            RefillStats {
                cycles: 3,
                permits_released: 3,
                release_failures: 0,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_try_acquire_bounded_by_effective_rate() {
        let limiter = Arc::new(started(20, TimeWindow::Seconds, false).await);

        for _ in 0..3 {
            let handles = (0..100)
                .map(|_| {
                    let limiter = Arc::clone(&limiter);
                    tokio::spawn(async move { limiter.try_acquire() })
                })
                .collect::<Vec<_>>();
            let admitted = futures::future::join_all(handles)
                .await
                .into_iter()
                .filter(|result| matches!(result, Ok(true)))
                .count();
            assert_eq!(admitted, 20);

            sleep(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let limiter = started(1, TimeWindow::Seconds, false).await;
        assert!(limiter.try_acquire());

        let mut acquire = task::spawn(limiter.acquire());
        assert_pending!(acquire.poll());

        sleep(Duration::from_millis(500)).await;
        assert_pending!(acquire.poll());

        sleep(Duration::from_millis(500)).await;
        assert!(acquire.is_woken());
        assert_ready_ok!(acquire.poll());
        assert_eq!(limiter.available_permits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn contended_acquirers_are_all_admitted_eventually() {
        let limiter = Arc::new(started(3, TimeWindow::Seconds, false).await);

        let handles = (0..10)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect::<Vec<_>>();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(handles))
            .await
            .expect("all acquirers admitted within five windows");
        assert!(results.into_iter().all(|result| matches!(result, Ok(Ok(())))));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_survives_pool_replacement() {
        let limiter = unpolled(300, TimeWindow::Seconds, true);
        assert!(limiter.try_acquire());

        let mut acquire = task::spawn(limiter.acquire());
        assert_pending!(acquire.poll());

        sleep(JUST_AFTER).await;
        assert_ready_ok!(acquire.poll());
        assert_eq!(limiter.effective_rate(), 101);
        assert_eq!(limiter.available_permits(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_rejects_acquirers_and_halts_refills() {
        let limiter = started(1, TimeWindow::Seconds, false).await;
        assert!(limiter.try_acquire());

        let mut waiting = task::spawn(limiter.acquire());
        assert_pending!(waiting.poll());

        limiter.stop();
        assert_eq!(limiter.state(), LimiterState::Stopped);
        assert_ready_err!(waiting.poll());
        drop(waiting);

        sleep(Duration::from_secs(3)).await;
        assert_eq!(limiter.refill_stats().cycles, 1);
        assert!(!limiter.try_acquire());
        assert_eq!(
            limiter.acquire().await,
            Err(AcquireError::Stopped {
                instance: limiter.instance_id(),
            })
        );

        // Idempotent.
        limiter.stop();
        assert_eq!(limiter.state(), LimiterState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn start_only_from_idle() {
        let limiter = started(1, TimeWindow::Seconds, false).await;
        let scheduler = RefillScheduler::current().unwrap();

        assert_eq!(
            limiter.start(&scheduler),
            Err(LifecycleError::NotIdle {
                instance: limiter.instance_id(),
                state: LimiterState::Running,
            })
        );

        limiter.stop();
        assert!(limiter.start(&scheduler).is_err());
    }

    #[test]
    fn idle_limiter_serves_initial_pool_only() {
        let limiter = AdaptiveRateLimiter::new(settings(10, TimeWindow::Seconds, true)).unwrap();

        assert_eq!(limiter.state(), LimiterState::Idle);
        assert_eq!(limiter.effective_rate(), 1);
        assert_eq!(limiter.target_rate(), 10);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn rejects_invalid_settings() {
        assert_eq!(
            AdaptiveRateLimiter::new(settings(0, TimeWindow::Seconds, false)).unwrap_err(),
            ConfigError::ZeroRate
        );
    }

    #[test]
    fn instance_ids_increase() {
        let first = AdaptiveRateLimiter::new(settings(1, TimeWindow::Seconds, false)).unwrap();
        let second = AdaptiveRateLimiter::new(settings(1, TimeWindow::Seconds, false)).unwrap();

        assert!(second.instance_id() > first.instance_id());
    }

    #[tokio::test(start_paused = true)]
    async fn limiters_share_one_scheduler() {
        let scheduler = RefillScheduler::current().unwrap();
        let fast = AdaptiveRateLimiter::new(settings(2, TimeWindow::Seconds, false)).unwrap();
        let slow = AdaptiveRateLimiter::new(settings(3, TimeWindow::Minutes, false)).unwrap();
        fast.start(&scheduler).unwrap();
        slow.start(&scheduler).unwrap();
        sleep(JUST_AFTER).await;

        assert_eq!(drain(&fast), 2);
        assert_eq!(drain(&slow), 3);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(fast.available_permits(), 2);
        assert_eq!(slow.available_permits(), 0);

        sleep(Duration::from_secs(59)).await;
        assert_eq!(slow.available_permits(), 3);
    }

    #[test]
    fn dedicated_scheduler_refills_in_real_time() {
        let scheduler = RefillScheduler::dedicated("adaptive-refill").unwrap();
        let limiter = AdaptiveRateLimiter::new(settings(1, TimeWindow::Seconds, false)).unwrap();
        limiter.start(&scheduler).unwrap();
        wait_until(Duration::from_secs(5), || limiter.refill_stats().cycles >= 1);

        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        std::thread::sleep(Duration::from_millis(1_300));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn dropping_the_scheduler_fails_the_limiter() {
        crate::test_utils::trace_init();

        let scheduler = RefillScheduler::dedicated("adaptive-orphaned").unwrap();
        let limiter = AdaptiveRateLimiter::new(settings(1, TimeWindow::Seconds, false)).unwrap();
        limiter.start(&scheduler).unwrap();
        wait_until(Duration::from_secs(5), || limiter.refill_stats().cycles >= 1);
        assert!(limiter.try_acquire());

        drop(scheduler);
        wait_until(Duration::from_secs(5), || limiter.state() == LimiterState::Failed);

        std::thread::sleep(Duration::from_millis(1_300));
        assert_eq!(limiter.refill_stats().cycles, 1);
        assert!(!limiter.try_acquire());

        limiter.stop();
        assert_eq!(limiter.state(), LimiterState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_not_reported_as_failure() {
        let limiter = started(1, TimeWindow::Seconds, false).await;
        let mut state = limiter.watch_state();

        limiter.stop();
        sleep(Duration::from_secs(2)).await;

        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), LimiterState::Stopped);
    }

    static FLAKY_RELEASES: AtomicUsize = AtomicUsize::new(0);

    /// Fails the second release it is ever asked for.
    struct FlakyPool(SemaphorePool);

    impl PermitPool for FlakyPool {
        fn with_capacity(capacity: usize) -> Self {
            Self(SemaphorePool::with_capacity(capacity))
        }

        fn capacity(&self) -> usize {
            self.0.capacity()
        }

        fn available(&self) -> usize {
            self.0.available()
        }

        fn try_acquire(&self) -> bool {
            self.0.try_acquire()
        }

        fn acquire(&self) -> impl Future<Output = Result<(), PoolError>> + Send + '_ {
            self.0.acquire()
        }

        fn release(&self) -> Result<(), PoolError> {
            if FLAKY_RELEASES.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(PoolError::Closed);
            }
            self.0.release()
        }

        fn close(&self) {
            self.0.close()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_release_does_not_abort_cycle() {
        crate::test_utils::trace_init();

        let limiter =
            AdaptiveRateLimiter::<FlakyPool>::with_permit_pool(settings(5, TimeWindow::Seconds, false))
                .unwrap();
        limiter.start(&RefillScheduler::current().unwrap()).unwrap();
        sleep(JUST_AFTER).await;
        assert_eq!(drain(&limiter), 5);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(limiter.available_permits(), 4);
        assert_eq!(
            limiter.refill_stats(),
            RefillStats {
                cycles: 2,
                permits_released: 4,
                release_failures: 1,
            }
        );

        sleep(Duration::from_secs(1)).await;
        assert_eq!(limiter.available_permits(), 5);
        assert_eq!(limiter.state(), LimiterState::Running);
        assert_eq!(
            limiter.refill_stats(),
            RefillStats {
                cycles: 3,
                permits_released: 5,
                release_failures: 1,
            }
        );
    }

    static RACED_RELEASES: AtomicUsize = AtomicUsize::new(0);

    /// Hands every released permit straight to a competing acquirer, the way a caller
    /// holding the previous snapshot would take it.
    struct RacingPool(SemaphorePool);

    impl PermitPool for RacingPool {
        fn with_capacity(capacity: usize) -> Self {
            Self(SemaphorePool::with_capacity(capacity))
        }

        fn capacity(&self) -> usize {
            self.0.capacity()
        }

        fn available(&self) -> usize {
            self.0.available()
        }

        fn try_acquire(&self) -> bool {
            self.0.try_acquire()
        }

        fn acquire(&self) -> impl Future<Output = Result<(), PoolError>> + Send + '_ {
            self.0.acquire()
        }

        fn release(&self) -> Result<(), PoolError> {
            self.0.release()?;
            if self.0.try_acquire() {
                RACED_RELEASES.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn close(&self) {
            self.0.close()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_does_not_refill_the_replaced_pool() {
        let limiter = AdaptiveRateLimiter::<RacingPool>::with_permit_pool(settings(
            300,
            TimeWindow::Seconds,
            true,
        ))
        .unwrap();
        limiter.start(&RefillScheduler::current().unwrap()).unwrap();
        assert_eq!(drain(&limiter), 1);

        sleep(JUST_AFTER).await;
        let admitted = drain(&limiter) + RACED_RELEASES.load(Ordering::SeqCst);
        assert_eq!(limiter.effective_rate(), 101);
        assert_eq!(admitted, 101);
        assert_eq!(limiter.refill_stats().permits_released, 0);
    }

    /// Records when each refill cycle reads the pool, then blocks the worker for
    /// `LATENCY_MS`.
    struct SlowPool<const LATENCY_MS: u64>(SemaphorePool);

    static CYCLE_STARTS: Mutex<Option<HashMap<u64, Vec<Instant>>>> = Mutex::new(None);

    impl<const LATENCY_MS: u64> SlowPool<LATENCY_MS> {
        fn cycle_starts() -> Vec<Instant> {
            CYCLE_STARTS
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|starts| starts.get(&LATENCY_MS).cloned())
                .unwrap_or_default()
        }
    }

    impl<const LATENCY_MS: u64> PermitPool for SlowPool<LATENCY_MS> {
        fn with_capacity(capacity: usize) -> Self {
            Self(SemaphorePool::with_capacity(capacity))
        }

        fn capacity(&self) -> usize {
            self.0.capacity()
        }

        fn available(&self) -> usize {
            CYCLE_STARTS
                .lock()
                .unwrap()
                .get_or_insert_with(HashMap::new)
                .entry(LATENCY_MS)
                .or_default()
                .push(Instant::now());
            std::thread::sleep(Duration::from_millis(LATENCY_MS));
            self.0.available()
        }

        fn try_acquire(&self) -> bool {
            self.0.try_acquire()
        }

        fn acquire(&self) -> impl Future<Output = Result<(), PoolError>> + Send + '_ {
            self.0.acquire()
        }

        fn release(&self) -> Result<(), PoolError> {
            self.0.release()
        }

        fn close(&self) {
            self.0.close()
        }
    }

    fn slow_cycle_starts<const LATENCY_MS: u64>(cycles: u64) -> Vec<Instant> {
        let scheduler = RefillScheduler::dedicated(format!("slow-refill-{LATENCY_MS}")).unwrap();
        let limiter = AdaptiveRateLimiter::<SlowPool<LATENCY_MS>>::with_permit_pool(settings(
            1,
            TimeWindow::Seconds,
            false,
        ))
        .unwrap();
        limiter.start(&scheduler).unwrap();
        wait_until(Duration::from_secs(10), || {
            limiter.refill_stats().cycles >= cycles
        });
        limiter.stop();

        SlowPool::<LATENCY_MS>::cycle_starts()
    }

    #[test]
    fn refill_latency_is_taken_out_of_the_next_sleep() {
        let starts = slow_cycle_starts::<300>(3);

        let span = starts[2] - starts[0];
        assert!(
            span >= Duration::from_millis(1_950) && span < Duration::from_millis(2_300),
            "third cycle started {span:?} after the first"
        );
    }

    #[test]
    fn overlong_refill_starts_next_cycle_immediately() {
        let starts = slow_cycle_starts::<1_200>(3);

        for pair in starts[..3].windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= Duration::from_millis(1_200) && gap < Duration::from_millis(1_500),
                "cycles {gap:?} apart"
            );
        }
    }

    /// Panics on any release, killing the refill job.
    struct PoisonedPool(SemaphorePool);

    impl PermitPool for PoisonedPool {
        fn with_capacity(capacity: usize) -> Self {
            Self(SemaphorePool::with_capacity(capacity))
        }

        fn capacity(&self) -> usize {
            self.0.capacity()
        }

        fn available(&self) -> usize {
            self.0.available()
        }

        fn try_acquire(&self) -> bool {
            self.0.try_acquire()
        }

        fn acquire(&self) -> impl Future<Output = Result<(), PoolError>> + Send + '_ {
            self.0.acquire()
        }

        fn release(&self) -> Result<(), PoolError> {
            panic!("permit accounting corrupted");
        }

        fn close(&self) {
            self.0.close()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refill_job_failure_is_observable() {
        let limiter = AdaptiveRateLimiter::<PoisonedPool>::with_permit_pool(settings(
            2,
            TimeWindow::Seconds,
            false,
        ))
        .unwrap();
        limiter.start(&RefillScheduler::current().unwrap()).unwrap();
        assert!(limiter.try_acquire());

        let mut state = limiter.watch_state();
        timeout(
            Duration::from_secs(5),
            state.wait_for(|state| *state == LimiterState::Failed),
        )
        .await
        .expect("refill job failure observed")
        .unwrap();

        sleep(Duration::from_secs(10)).await;
        assert_eq!(limiter.refill_stats().cycles, 0);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        limiter.stop();
        assert_eq!(limiter.state(), LimiterState::Stopped);
    }
}
