// demos/load_driver.rs
//
// Drives a fake system under test through the three limiters for a few seconds and
// reports how many requests each one admitted.
//
// - The adaptive limiter ramps 1 -> 101 -> 201 -> 250 permits per second.
// - The fixed-window counter admits at most 50 ticks per second.
// - The factory limiter admits 20 requests per second and gives up after 5 ms.
//
// Run with `RUST_LOG=bombardier_limiter=debug cargo run --example load_driver` to see
// every refill cycle.

use std::{
    env,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bombardier_limiter::rate_limit::{
    AdaptiveRateLimiter, AdaptiveRateSettings, FixedWindowLimiter, RefillScheduler, TimeWindow,
    factory::LimiterRegistry,
};
use futures::future::join_all;
use tokio::time::{Instant, sleep};
use tracing::info;

const CALLERS: usize = 32;
const RUN_FOR: Duration = Duration::from_secs(4);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let default_log_filter = "info";
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| default_log_filter.to_string()))
        .init();

    let scheduler = RefillScheduler::dedicated("refill")?;
    let adaptive = Arc::new(AdaptiveRateLimiter::new(
        AdaptiveRateSettings::builder()
            .target_rate(250)
            .window(TimeWindow::Seconds)
            .build(),
    )?);
    adaptive.start(&scheduler)?;

    let fixed = Arc::new(FixedWindowLimiter::new(50, TimeWindow::Seconds)?);
    let registry = LimiterRegistry::new();
    let account = registry.limiter("demo-account", 20, TimeWindow::Seconds)?;

    let adaptive_admitted = Arc::new(AtomicUsize::new(0));
    let fixed_admitted = Arc::new(AtomicUsize::new(0));
    let account_admitted = Arc::new(AtomicUsize::new(0));
    let deadline = Instant::now() + RUN_FOR;

    let callers = (0..CALLERS).map(|_| {
        let adaptive = Arc::clone(&adaptive);
        let fixed = Arc::clone(&fixed);
        let account = account.clone();
        let adaptive_admitted = Arc::clone(&adaptive_admitted);
        let fixed_admitted = Arc::clone(&fixed_admitted);
        let account_admitted = Arc::clone(&account_admitted);

        tokio::spawn(async move {
            while Instant::now() < deadline {
                // Blocking admission, bounded by the caller.
                if tokio::time::timeout(Duration::from_millis(200), adaptive.acquire())
                    .await
                    .is_ok_and(|result| result.is_ok())
                {
                    adaptive_admitted.fetch_add(1, Ordering::Relaxed);
                }
                if fixed.tick() {
                    fixed_admitted.fetch_add(1, Ordering::Relaxed);
                }
                if account.acquire().await {
                    account_admitted.fetch_add(1, Ordering::Relaxed);
                }

                sleep(Duration::from_millis(rand::random_range(1..20))).await;
            }
        })
    });
    join_all(callers).await;

    info!(
        adaptive = adaptive_admitted.load(Ordering::Relaxed),
        effective_rate = adaptive.effective_rate(),
        fixed_window = fixed_admitted.load(Ordering::Relaxed),
        factory = account_admitted.load(Ordering::Relaxed),
        "Load run finished."
    );

    adaptive.stop();
    Ok(())
}
