//! Exchange adapters
//!
//! [`ExchangeAdapter`] is the contract every venue implements; the Binance
//! futures adapter is the reference implementation.

pub mod adapter;
pub mod batch;
pub mod binance;
pub mod error;
pub mod resilience;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

use std::sync::Arc;
use tracing::warn;

pub use adapter::{ExchangeAdapter, DEFAULT_BATCH_LIMIT};
pub use batch::{BatchPlaceOutcome, FailedPlacement};
pub use error::{ExchangeError, Result};
pub use resilience::{parse_ban_until, with_retry, with_retry_when, PollThrottle, RetryPolicy};

use crate::infrastructure::config::{InstanceConfig, ResilienceConfig};
use crate::infrastructure::shutdown::ShutdownManager;
use binance::{BinanceFutures, BinanceSettings};

/// Build the adapter for one configured instance. Retry waits of the
/// adapter end early once `shutdown` is triggered.
pub async fn connect_adapter(
    instance: &InstanceConfig,
    resilience: &ResilienceConfig,
    shutdown: Arc<ShutdownManager>,
) -> Result<Arc<dyn ExchangeAdapter>> {
    match instance.exchange.as_str() {
        "binance" => {
            let settings = BinanceSettings::from_instance(instance, resilience).with_shutdown(shutdown);
            let adapter = BinanceFutures::connect(settings).await?;
            if instance.leverage > 1 {
                if let Err(e) = adapter.set_leverage(instance.leverage).await {
                    warn!(
                        "[Exchange] Could not set leverage for {}: {}",
                        instance.label(),
                        e
                    );
                }
            }
            Ok(Arc::new(adapter))
        }
        other => Err(ExchangeError::Unsupported {
            exchange: other.to_string(),
            operation: "connect".to_string(),
        }),
    }
}
