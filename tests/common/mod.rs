#![allow(dead_code)]
//! Shared integration test utilities.

use std::sync::Once;
use std::time::{Duration, Instant};

static INIT_LOGGING: Once = Once::new();

/// Default deadline for asynchronous assertions.
pub const DEADLINE: Duration = Duration::from_secs(5);

/// Initializes tracing output for tests (idempotent).
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Polls `predicate` until it holds or `deadline` elapses. Returns whether
/// it held.
pub fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    predicate()
}

/// Asserts that `predicate` holds within the default deadline.
pub fn assert_eventually(what: &str, predicate: impl Fn() -> bool) {
    assert!(wait_until(DEADLINE, predicate), "timed out waiting: {what}");
}
