//! Exchange adapter contract
//!
//! An adapter supplies the raw REST/WebSocket calls of one exchange. The
//! resilience protocol (poll spacing, rate-limit retries, idempotent cancel,
//! batch chunking with sequential fallback) lives in the provided methods
//! so every adapter behaves the same way.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::debug;

use super::batch::{self, BatchPlaceOutcome};
use super::error::{ExchangeError, Result};
use super::resilience::{with_retry, with_retry_when, PollThrottle, RetryPolicy};
use crate::domain::{Account, FundingRate, Kline, Order, OrderRequest, OrderUpdate, Position, PriceTick};
use crate::infrastructure::shutdown::ShutdownManager;

/// Default number of orders per batch request
pub const DEFAULT_BATCH_LIMIT: usize = 5;

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    // ==================== INSTRUMENT ====================

    /// Exchange name, lowercase ("binance")
    fn name(&self) -> &str;

    /// Symbol this adapter instance trades
    fn symbol(&self) -> &str;

    fn price_decimals(&self) -> u32;

    fn quantity_decimals(&self) -> u32;

    fn base_asset(&self) -> &str;

    fn quote_asset(&self) -> &str;

    /// Maximum orders per batch request
    fn batch_limit(&self) -> usize {
        DEFAULT_BATCH_LIMIT
    }

    fn retry_policy(&self) -> &RetryPolicy;

    fn poll_throttle(&self) -> &PollThrottle;

    // ==================== RAW CALLS ====================

    /// Submit one order, no retries
    async fn send_order(&self, request: &OrderRequest) -> Result<Order>;

    /// Submit up to `batch_limit` orders in one request.
    ///
    /// The outer error means the whole request failed; inner results are
    /// per order, in request order.
    async fn send_order_batch(&self, _requests: &[OrderRequest]) -> Result<Vec<Result<Order>>> {
        Err(ExchangeError::Unsupported {
            exchange: self.name().to_string(),
            operation: "batch_place".to_string(),
        })
    }

    /// Cancel one order, no retries
    async fn send_cancel(&self, symbol: &str, order_id: &str) -> Result<()>;

    async fn send_cancel_batch(&self, _symbol: &str, _order_ids: &[String]) -> Result<Vec<Result<()>>> {
        Err(ExchangeError::Unsupported {
            exchange: self.name().to_string(),
            operation: "batch_cancel".to_string(),
        })
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<Order>>;

    async fn fetch_positions(&self, symbol: &str) -> Result<Vec<Position>>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()>;

    async fn get_account(&self) -> Result<Account>;

    /// Available balance of `asset`
    async fn get_balance(&self, asset: &str) -> Result<f64>;

    // ==================== STREAMS ====================

    /// Spawn the order update stream. The task reconnects on its own and
    /// exits when `shutdown` fires.
    async fn start_order_stream(
        &self,
        tx: UnboundedSender<OrderUpdate>,
        shutdown: Arc<ShutdownManager>,
    ) -> Result<JoinHandle<()>>;

    async fn start_price_stream(
        &self,
        symbol: &str,
        tx: UnboundedSender<PriceTick>,
        shutdown: Arc<ShutdownManager>,
    ) -> Result<JoinHandle<()>>;

    async fn start_kline_stream(
        &self,
        symbol: &str,
        interval: &str,
        tx: UnboundedSender<Kline>,
        shutdown: Arc<ShutdownManager>,
    ) -> Result<JoinHandle<()>>;

    // ==================== ANALYTICS ====================

    async fn get_historical_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>>;

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate>;

    async fn get_spot_price(&self, symbol: &str) -> Result<f64>;

    // ==================== RESILIENT OPERATIONS ====================

    /// Place one order, retrying rate limits only
    async fn place_order(&self, request: &OrderRequest) -> Result<Order> {
        with_retry_when(
            self.retry_policy(),
            "place_order",
            ExchangeError::is_rate_limit,
            || self.send_order(request),
        )
        .await
    }

    /// Cancel one order. An order the exchange no longer knows is a success.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        match with_retry(self.retry_policy(), "cancel_order", || {
            self.send_cancel(symbol, order_id)
        })
        .await
        {
            Err(e) if e.is_order_not_found() => {
                debug!("[Exchange] Cancel of {} ignored: order already gone", order_id);
                Ok(())
            }
            other => other,
        }
    }

    /// Throttled, retried open-order poll
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<Order>> {
        with_retry(self.retry_policy(), "get_open_orders", || async move {
            self.poll_throttle().wait().await;
            self.fetch_open_orders(symbol).await
        })
        .await
    }

    /// Throttled, retried position poll
    async fn get_positions(&self, symbol: &str) -> Result<Vec<Position>> {
        with_retry(self.retry_policy(), "get_positions", || async move {
            self.poll_throttle().wait().await;
            self.fetch_positions(symbol).await
        })
        .await
    }

    /// Place orders in chunks of `batch_limit`, falling back to sequential
    /// placement when a chunk fails as a whole or per item.
    async fn batch_place_orders(&self, requests: &[OrderRequest]) -> BatchPlaceOutcome {
        batch::place_in_chunks(self, requests).await
    }

    /// Cancel orders in chunks, treating not-found as success
    async fn batch_cancel_orders(&self, symbol: &str, order_ids: &[String]) -> Result<()> {
        batch::cancel_in_chunks(self, symbol, order_ids).await
    }
}
