use std::sync::Once;

use tracing_subscriber::EnvFilter;

static TRACE_INIT: Once = Once::new();

/// Installs a test-writer subscriber once per test binary. Honours `RUST_LOG`.
pub fn trace_init() {
    TRACE_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}
