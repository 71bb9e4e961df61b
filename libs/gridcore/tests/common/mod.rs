//! Common test utilities for gridcore integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gridcore::infrastructure::exchange::testing::FakeExchange;
use gridcore::infrastructure::exchange::RetryPolicy;

/// Macro for verbose test output (controlled by TEST_VERBOSE env var)
#[macro_export]
macro_rules! verbose_println {
    ($($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            println!($($arg)*);
        }
    };
}

/// In-process exchange with millisecond retry waits
pub fn fast_exchange(symbol: &str) -> Arc<FakeExchange> {
    Arc::new(FakeExchange::new(symbol).with_retry_policy(RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        ban_margin: Duration::from_millis(1),
        ..RetryPolicy::default()
    }))
}
