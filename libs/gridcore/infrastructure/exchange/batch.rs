//! Chunked batch placement and cancellation with sequential fallback

use tracing::{debug, info, warn};

use super::adapter::ExchangeAdapter;
use super::error::{ExchangeError, Result};
use super::resilience::with_retry_when;
use crate::domain::{Order, OrderRequest};

/// A request that did not produce an order
#[derive(Debug, Clone, PartialEq)]
pub struct FailedPlacement {
    pub client_order_id: String,
    pub reason: String,
    pub margin: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BatchPlaceOutcome {
    pub orders: Vec<Order>,
    pub failed: Vec<FailedPlacement>,
    /// A margin rejection was seen; remaining requests were not sent
    pub has_margin_error: bool,
}

impl BatchPlaceOutcome {
    fn record_error(&mut self, request: &OrderRequest, error: &ExchangeError) {
        if error.is_margin() {
            self.has_margin_error = true;
        }
        self.failed.push(FailedPlacement {
            client_order_id: request.client_order_id.clone(),
            reason: error.to_string(),
            margin: error.is_margin(),
        });
    }

    fn record_skipped(&mut self, request: &OrderRequest) {
        self.failed.push(FailedPlacement {
            client_order_id: request.client_order_id.clone(),
            reason: "skipped after margin error".to_string(),
            margin: false,
        });
    }
}

/// One order at a time through the resilient `place_order`
async fn place_one<A: ExchangeAdapter + ?Sized>(
    adapter: &A,
    request: &OrderRequest,
    outcome: &mut BatchPlaceOutcome,
) {
    if outcome.has_margin_error {
        outcome.record_skipped(request);
        return;
    }

    match adapter.place_order(request).await {
        Ok(order) => outcome.orders.push(order),
        Err(e) => {
            warn!(
                "[Exchange] Order {} {} @ {} failed: {}",
                request.client_order_id, request.side, request.price, e
            );
            outcome.record_error(request, &e);
        }
    }
}

pub async fn place_in_chunks<A: ExchangeAdapter + ?Sized>(
    adapter: &A,
    requests: &[OrderRequest],
) -> BatchPlaceOutcome {
    let mut outcome = BatchPlaceOutcome::default();
    let limit = adapter.batch_limit().max(1);
    let mut shutting_down = false;

    for chunk in requests.chunks(limit) {
        if outcome.has_margin_error {
            chunk.iter().for_each(|r| outcome.record_skipped(r));
            continue;
        }
        if shutting_down {
            let cancelled = ExchangeError::Cancelled("batch_place_orders".to_string());
            chunk.iter().for_each(|r| outcome.record_error(r, &cancelled));
            continue;
        }

        if chunk.len() == 1 {
            place_one(adapter, &chunk[0], &mut outcome).await;
            continue;
        }

        let batch_result = with_retry_when(
            adapter.retry_policy(),
            "batch_place_orders",
            ExchangeError::is_rate_limit,
            || adapter.send_order_batch(chunk),
        )
        .await;

        match batch_result {
            Ok(results) if results.len() == chunk.len() => {
                for (request, result) in chunk.iter().zip(results) {
                    match result {
                        Ok(order) => outcome.orders.push(order),
                        Err(e) if e.is_margin() => {
                            warn!(
                                "[Exchange] Margin rejection for {}: {}",
                                request.client_order_id, e
                            );
                            outcome.record_error(request, &e);
                        }
                        Err(e) => {
                            debug!(
                                "[Exchange] Batch item {} failed ({}), retrying alone",
                                request.client_order_id, e
                            );
                            place_one(adapter, request, &mut outcome).await;
                        }
                    }
                }
            }
            Ok(results) => {
                warn!(
                    "[Exchange] Batch returned {} results for {} orders, placing sequentially",
                    results.len(),
                    chunk.len()
                );
                for request in chunk {
                    place_one(adapter, request, &mut outcome).await;
                }
            }
            Err(e) if e.is_margin() => {
                warn!("[Exchange] Batch rejected for margin: {}", e);
                chunk.iter().for_each(|r| outcome.record_error(r, &e));
            }
            Err(ExchangeError::Unsupported { .. }) => {
                for request in chunk {
                    place_one(adapter, request, &mut outcome).await;
                }
            }
            Err(e @ ExchangeError::Cancelled(_)) => {
                chunk.iter().for_each(|r| outcome.record_error(r, &e));
                shutting_down = true;
            }
            Err(e) => {
                warn!(
                    "[Exchange] Batch of {} failed ({}), placing sequentially",
                    chunk.len(),
                    e
                );
                for request in chunk {
                    place_one(adapter, request, &mut outcome).await;
                }
            }
        }
    }

    if !outcome.failed.is_empty() {
        info!(
            "[Exchange] Batch placement: {} placed, {} failed{}",
            outcome.orders.len(),
            outcome.failed.len(),
            if outcome.has_margin_error { " (margin)" } else { "" }
        );
    }

    outcome
}

pub async fn cancel_in_chunks<A: ExchangeAdapter + ?Sized>(
    adapter: &A,
    symbol: &str,
    order_ids: &[String],
) -> Result<()> {
    let limit = adapter.batch_limit().max(1);
    let mut first_error: Option<ExchangeError> = None;
    let mut failures = 0usize;

    for chunk in order_ids.chunks(limit) {
        let mut sequential: Vec<&String> = Vec::new();

        if chunk.len() == 1 {
            sequential.push(&chunk[0]);
        } else {
            let batch_result = with_retry_when(
                adapter.retry_policy(),
                "batch_cancel_orders",
                ExchangeError::is_rate_limit,
                || adapter.send_cancel_batch(symbol, chunk),
            )
            .await;

            match batch_result {
                Ok(results) if results.len() == chunk.len() => {
                    for (order_id, result) in chunk.iter().zip(results) {
                        match result {
                            Ok(()) => {}
                            Err(e) if e.is_order_not_found() => {}
                            Err(_) => sequential.push(order_id),
                        }
                    }
                }
                Ok(_) | Err(ExchangeError::Unsupported { .. }) => sequential.extend(chunk.iter()),
                Err(e @ ExchangeError::Cancelled(_)) => return Err(e),
                Err(e) => {
                    warn!(
                        "[Exchange] Batch cancel of {} failed ({}), cancelling sequentially",
                        chunk.len(),
                        e
                    );
                    sequential.extend(chunk.iter());
                }
            }
        }

        for order_id in sequential {
            if let Err(e) = adapter.cancel_order(symbol, order_id).await {
                warn!("[Exchange] Cancel {} failed: {}", order_id, e);
                failures += 1;
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => {
            warn!("[Exchange] {} cancellations failed", failures);
            Err(e)
        }
        None => Ok(()),
    }
}
