//! Order executor façade
//!
//! The ledger only ever talks to an [`OrderExecutor`]; it never sees the
//! adapter directly.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::{Order, OrderRequest};
use crate::infrastructure::exchange::{ExchangeAdapter, Result};

#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<Order>;

    /// Place many orders. Returns the orders the exchange accepted and
    /// whether any placement was rejected for insufficient margin.
    async fn batch_place_orders(&self, requests: &[OrderRequest]) -> (Vec<Order>, bool);

    async fn batch_cancel_orders(&self, order_ids: &[String]) -> Result<()>;
}

/// Executor bound to one adapter and symbol
pub struct ExchangeExecutor {
    adapter: Arc<dyn ExchangeAdapter>,
    symbol: String,
}

impl ExchangeExecutor {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>) -> Self {
        let symbol = adapter.symbol().to_string();
        Self { adapter, symbol }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

#[async_trait]
impl OrderExecutor for ExchangeExecutor {
    async fn place_order(&self, request: &OrderRequest) -> Result<Order> {
        self.adapter.place_order(request).await
    }

    async fn batch_place_orders(&self, requests: &[OrderRequest]) -> (Vec<Order>, bool) {
        if requests.is_empty() {
            return (Vec::new(), false);
        }

        let outcome = self.adapter.batch_place_orders(requests).await;
        for failed in &outcome.failed {
            warn!(
                "[Executor] {} placement {} failed: {}",
                self.symbol, failed.client_order_id, failed.reason
            );
        }
        debug!(
            "[Executor] {} batch placed {}/{} orders",
            self.symbol,
            outcome.orders.len(),
            requests.len()
        );
        (outcome.orders, outcome.has_margin_error)
    }

    async fn batch_cancel_orders(&self, order_ids: &[String]) -> Result<()> {
        if order_ids.is_empty() {
            return Ok(());
        }
        self.adapter.batch_cancel_orders(&self.symbol, order_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use crate::infrastructure::exchange::testing::FakeExchange;
    use crate::infrastructure::exchange::ExchangeError;

    #[tokio::test]
    async fn test_batch_place_reports_margin_error() {
        let fake = Arc::new(FakeExchange::new("BTCUSDT"));
        fake.reject_coid_for_margin("b");
        let executor = ExchangeExecutor::new(fake.clone());

        let requests = vec![
            OrderRequest::limit("BTCUSDT", Side::Buy, 100.0, 1.0, "a"),
            OrderRequest::limit("BTCUSDT", Side::Buy, 99.0, 1.0, "b"),
        ];
        let (orders, margin) = executor.batch_place_orders(&requests).await;

        assert!(margin);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].client_order_id, "a");
    }

    #[tokio::test]
    async fn test_cancel_of_unknown_order_succeeds() {
        let fake = Arc::new(FakeExchange::new("BTCUSDT"));
        let executor = ExchangeExecutor::new(fake.clone());

        let order = executor
            .place_order(&OrderRequest::limit("BTCUSDT", Side::Buy, 100.0, 1.0, "a"))
            .await
            .unwrap();

        let ids = vec![order.order_id.clone(), "999".to_string()];
        executor.batch_cancel_orders(&ids).await.unwrap();
        assert_eq!(fake.open_order_count(), 0);

        // cancelling twice is still fine
        executor.batch_cancel_orders(&ids).await.unwrap();
    }

    #[tokio::test]
    async fn test_place_order_surfaces_margin_error() {
        let fake = Arc::new(FakeExchange::new("BTCUSDT"));
        fake.reject_coid_for_margin("a");
        let executor = ExchangeExecutor::new(fake);

        let err = executor
            .place_order(&OrderRequest::limit("BTCUSDT", Side::Buy, 100.0, 1.0, "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientMargin(_)));
    }
}
