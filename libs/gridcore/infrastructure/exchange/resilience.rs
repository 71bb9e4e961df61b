//! Retry and polling discipline shared by every adapter
//!
//! - Polling calls are spaced by at least `min_interval` per adapter instance.
//! - A rate-limit error carrying "banned until <unix-ms>" sleeps until that
//!   instant plus a margin, at most `max_ban_wait`; other retryable errors
//!   back off exponentially, capped at `max_delay`.
//! - After `max_attempts` the last error is wrapped in
//!   [`ExchangeError::RetriesExhausted`].
//! - With a shutdown handle attached, a pending retry wait ends with
//!   [`ExchangeError::Cancelled`] as soon as shutdown is triggered.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{ExchangeError, Result};
use crate::infrastructure::shutdown::ShutdownManager;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Added on top of an exchange-reported ban expiry
    pub ban_margin: Duration,
    /// Upper bound for one ban wait, margin included
    pub max_ban_wait: Duration,
    /// Interrupts retry waits when triggered
    pub shutdown: Option<Arc<ShutdownManager>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            ban_margin: Duration::from_secs(1),
            max_ban_wait: Duration::from_secs(300),
            shutdown: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownManager>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Exponential delay for a 0-indexed attempt: base * 2^attempt, capped
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis.min(self.max_delay.as_millis() as u64))
    }

    /// Delay before retrying a rate-limited call made at `now_ms`
    pub fn rate_limit_delay(&self, message: &str, attempt: u32, now_ms: i64) -> Duration {
        match parse_ban_until(message) {
            Some(until_ms) if until_ms > now_ms => {
                let wait = Duration::from_millis((until_ms - now_ms) as u64) + self.ban_margin;
                wait.min(self.max_ban_wait)
            }
            Some(_) => self.ban_margin.min(self.max_ban_wait),
            None => self.backoff_delay(attempt),
        }
    }
}

/// Extract the ban expiry from messages like
/// "Way too many requests; IP banned until 1767288777555."
///
/// Ten digits or fewer are read as Unix seconds.
pub fn parse_ban_until(message: &str) -> Option<i64> {
    let lower = message.to_lowercase();
    let idx = lower.find("banned until")?;
    let rest = lower[idx + "banned until".len()..].trim_start();

    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }

    let value = digits.parse::<i64>().ok()?;
    if digits.len() <= 10 {
        Some(value * 1000)
    } else {
        Some(value)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent.
pub async fn with_retry_when<T, F, Fut, P>(
    policy: &RetryPolicy,
    operation: &str,
    retryable: P,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&ExchangeError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if retryable(&e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    warn!(
                        "[Exchange] {} giving up after {} attempts: {}",
                        operation, attempt, e
                    );
                    return Err(ExchangeError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }

                let delay = match &e {
                    ExchangeError::RateLimited(msg) => {
                        policy.rate_limit_delay(msg, attempt - 1, now_ms())
                    }
                    _ => policy.backoff_delay(attempt - 1),
                };

                warn!(
                    "[Exchange] {} failed (attempt {}/{}): {} - retrying in {:?}",
                    operation, attempt, max_attempts, e, delay
                );
                match &policy.shutdown {
                    Some(shutdown) => tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => {
                            info!("[Exchange] {} retry abandoned on shutdown", operation);
                            return Err(ExchangeError::Cancelled(operation.to_string()));
                        }
                    },
                    None => tokio::time::sleep(delay).await,
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retry transient errors (rate limits, timeouts, transport failures)
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_when(policy, operation, ExchangeError::is_transient, call).await
}

/// Enforces a minimum spacing between polling calls of one adapter
///
/// Each caller reserves the next free slot under the mutex and sleeps
/// after releasing it.
pub struct PollThrottle {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl PollThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait(&self) {
        let start = {
            let mut next = self.next_slot.lock();
            let now = Instant::now();
            let start = match *next {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next = Some(start + self.min_interval);
            start
        };

        if start > Instant::now() {
            debug!("[Exchange] Poll throttled until {:?}", start);
            tokio::time::sleep_until(start).await;
        }
    }
}

impl Default for PollThrottle {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(60));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_ban_until() {
        assert_eq!(
            parse_ban_until("Way too many requests; IP banned until 1767288777555."),
            Some(1767288777555)
        );
        assert_eq!(
            parse_ban_until("IP(1.2.3.4) Banned Until 1767288777"),
            Some(1767288777000)
        );
        assert_eq!(parse_ban_until("Too many requests"), None);
        assert_eq!(parse_ban_until("banned until soon"), None);
    }

    #[test]
    fn test_rate_limit_delay_uses_ban_time() {
        let policy = RetryPolicy::default();
        let msg = "banned until 1767288777555";

        let delay = policy.rate_limit_delay(msg, 0, 1767288777555 - 5000);
        assert_eq!(delay, Duration::from_millis(6000));

        // expired ban: only the margin
        let delay = policy.rate_limit_delay(msg, 3, 1767288777555 + 10);
        assert_eq!(delay, Duration::from_secs(1));

        // no ban text: exponential back-off
        let delay = policy.rate_limit_delay("Too many requests", 2, 0);
        assert_eq!(delay, Duration::from_secs(4));
    }

    #[test]
    fn test_ban_wait_is_capped() {
        let policy = RetryPolicy {
            max_ban_wait: Duration::from_secs(120),
            ..RetryPolicy::default()
        };
        let now = 1767288777555;
        // banned for a day
        let msg = format!("IP banned until {}", now + 86_400_000);

        assert_eq!(policy.rate_limit_delay(&msg, 0, now), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_ban_wait() {
        let shutdown = Arc::new(ShutdownManager::new());
        let policy = RetryPolicy::default().with_shutdown(Arc::clone(&shutdown));
        let ban_until = chrono::Utc::now().timestamp_millis() + 3_600_000;
        let message = format!("Way too many requests; IP banned until {}.", ban_until);
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let retry = {
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                with_retry(&policy, "get_positions", || {
                    let calls = Arc::clone(&calls);
                    let message = message.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(ExchangeError::RateLimited(message))
                    }
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        shutdown.trigger();
        let result = retry.await.unwrap();

        assert!(matches!(result, Err(ExchangeError::Cancelled(op)) if op == "get_positions"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_shutdown_does_not_wait() {
        let shutdown = Arc::new(ShutdownManager::new());
        shutdown.trigger();
        let policy = RetryPolicy::default().with_shutdown(shutdown);
        let start = Instant::now();

        let result: Result<()> = with_retry(&policy, "cancel_all_orders", || async {
            Err(ExchangeError::Timeout("slow".into()))
        })
        .await;

        assert!(matches!(result, Err(ExchangeError::Cancelled(_))));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let result = with_retry(&policy, "get_positions", || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExchangeError::Timeout("slow".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_wraps_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };

        let result: Result<()> = with_retry(&policy, "get_open_orders", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::RateLimited("Too many requests".into()))
            }
        })
        .await;

        match result {
            Err(ExchangeError::RetriesExhausted {
                operation,
                attempts,
                source,
            }) => {
                assert_eq!(operation, "get_open_orders");
                assert_eq!(attempts, 3);
                assert!(source.is_rate_limit());
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let result: Result<()> = with_retry(&policy, "place_order", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::InsufficientMargin("margin is insufficient".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(ExchangeError::InsufficientMargin(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_sleeps_until_ban_expiry() {
        let policy = RetryPolicy::default();
        let ban_until = chrono::Utc::now().timestamp_millis() + 5_000;
        let message = format!("Way too many requests; IP banned until {}.", ban_until);

        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result = with_retry(&policy, "get_open_orders", || {
            let calls = Arc::clone(&calls);
            let message = message.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ExchangeError::RateLimited(message))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        let waited = start.elapsed();
        // ban (~5s) plus the 1s margin, far beyond the 1s first back-off step
        assert!(waited >= Duration::from_millis(5_500), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(6_100), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_throttle_spacing() {
        let throttle = Arc::new(PollThrottle::new(Duration::from_millis(200)));
        let start = Instant::now();

        throttle.wait().await;
        throttle.wait().await;
        throttle.wait().await;

        assert!(start.elapsed() >= Duration::from_millis(400));
        assert!(start.elapsed() < Duration::from_millis(600));
    }
}
