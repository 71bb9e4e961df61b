//! Integration tests for a full grid cycle
//!
//! Ledger, executor and reconciler wired together over the in-process
//! `FakeExchange`.

mod common;

use common::fast_exchange;
use gridcore::application::{
    ExchangeExecutor, LedgerConfig, ReconcileOutcome, Reconciler, ReconcilerConfig, SlotLedger,
};
use gridcore::domain::{PositionStatus, Side};
use gridcore::infrastructure::exchange::testing::FakeExchange;
use gridcore::infrastructure::InMemoryLock;
use std::sync::Arc;
use std::time::Duration;

fn ledger_config() -> LedgerConfig {
    LedgerConfig {
        symbol: "BTCUSDT".to_string(),
        price_interval: 100.0,
        order_quantity: 0.01,
        buy_window_size: 5,
        sell_window_size: 3,
        price_decimals: 1,
        quantity_decimals: 3,
        margin_pause: Duration::from_secs(60),
    }
}

fn build(exchange: &Arc<FakeExchange>) -> (Arc<SlotLedger>, Reconciler) {
    let executor = Arc::new(ExchangeExecutor::new(exchange.clone()));
    let ledger = Arc::new(SlotLedger::new(ledger_config(), executor).unwrap());
    let reconciler = Reconciler::new(
        ReconcilerConfig::new(
            Duration::from_secs(60),
            Duration::from_secs(30),
            1e-4,
            Duration::from_secs(30),
        ),
        exchange.clone(),
        ledger.clone(),
        Arc::new(InMemoryLock::new()),
        ledger.risk_pause(),
    );
    (ledger, reconciler)
}

#[tokio::test]
async fn test_buy_sell_round_trip_books_profit() {
    verbose_println!("Testing a full buy/sell round trip...");

    let exchange = fast_exchange("BTCUSDT");
    let (ledger, reconciler) = build(&exchange);

    let placed = ledger.initialize(50000.0, "50000.0").await.unwrap();
    assert_eq!(placed, 5);
    assert_eq!(exchange.open_orders().len(), 5);

    let buy = exchange.best(Side::Buy).unwrap();
    verbose_println!("  Filling buy {} at {}", buy.order_id, buy.price);
    assert_eq!(buy.price, 49900.0);
    ledger.on_order_update(&exchange.fill(&buy.order_id).unwrap()).await;

    let sell = exchange.best(Side::Sell).unwrap();
    assert_eq!(sell.price, 50000.0);
    assert_eq!(sell.quantity, 0.01);

    match reconciler.reconcile().await.unwrap() {
        ReconcileOutcome::Completed(report) => {
            verbose_println!("  Reconcile record: {:?}", report.record);
            assert!((report.record.local_position - 0.01).abs() < 1e-9);
            assert!((report.record.exchange_position - 0.01).abs() < 1e-9);
            assert_eq!(report.record.active_buy_orders, 4);
            assert_eq!(report.record.active_sell_orders, 1);
            assert_eq!(report.exchange_open_orders, 5);
            assert!(report.forced_sync.is_none());
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    ledger.on_order_update(&exchange.fill(&sell.order_id).unwrap()).await;

    let totals = ledger.totals();
    assert!((totals.total_buy_qty - 0.01).abs() < 1e-9);
    assert!((totals.total_sell_qty - 0.01).abs() < 1e-9);
    assert!((totals.estimated_profit - 1.0).abs() < 1e-9);
    assert_eq!(exchange.position(), 0.0);

    let slot = ledger.snapshot(-1).unwrap();
    assert_eq!(slot.position_status, PositionStatus::Empty);
    assert_eq!(reconciler.reconcile_count(), 1);
}

#[tokio::test]
async fn test_flat_exchange_clears_local_inventory() {
    let exchange = fast_exchange("BTCUSDT");
    let (ledger, reconciler) = build(&exchange);

    ledger.initialize(50000.0, "50000.0").await.unwrap();
    let buy = exchange.best(Side::Buy).unwrap();
    ledger.on_order_update(&exchange.fill(&buy.order_id).unwrap()).await;
    assert!(exchange.best(Side::Sell).is_some());

    // position closed outside the bot
    exchange.set_position(0.0);

    match reconciler.reconcile().await.unwrap() {
        ReconcileOutcome::Completed(report) => {
            let synced = report.forced_sync.expect("force sync expected");
            verbose_println!("  Force sync: {:?}", synced);
            assert_eq!(synced.slots_cleared, 1);
            assert!((synced.qty_cleared - 0.01).abs() < 1e-9);
            assert_eq!(synced.orders_canceled, 1);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let slot = ledger.snapshot(-1).unwrap();
    assert_eq!(slot.position_status, PositionStatus::Empty);
    assert_eq!(slot.position_qty, 0.0);
    assert!(exchange.best(Side::Sell).is_none());
}

#[tokio::test]
async fn test_failed_batch_falls_back_to_single_orders() {
    let exchange = fast_exchange("BTCUSDT");
    exchange.fail_batches(true);
    let (ledger, _reconciler) = build(&exchange);

    let placed = ledger.initialize(50000.0, "50000.0").await.unwrap();

    verbose_println!(
        "  batch calls: {}, single calls: {}",
        exchange.batch_calls(),
        exchange.single_order_count()
    );
    assert_eq!(placed, 5);
    assert_eq!(exchange.batch_calls(), 1);
    assert_eq!(exchange.single_order_count(), 5);
    assert!(ledger.is_initialized());
}

#[tokio::test]
async fn test_price_drift_moves_buy_window() {
    let exchange = fast_exchange("BTCUSDT");
    let (ledger, _reconciler) = build(&exchange);

    ledger.initialize(50000.0, "50000.0").await.unwrap();

    // window top becomes 50200, bottom 49800
    let summary = ledger.adjust_orders(50250.0).await;
    verbose_println!("  Adjust summary: {:?}", summary);
    assert_eq!(summary.buys_placed, 3);
    assert_eq!(summary.cancels_sent, 3);

    let mut prices: Vec<f64> = exchange
        .open_orders()
        .iter()
        .filter(|o| o.side == Side::Buy)
        .map(|o| o.price)
        .collect();
    prices.sort_by(|a, b| a.total_cmp(b));
    assert_eq!(prices, vec![49800.0, 49900.0, 50000.0, 50100.0, 50200.0]);
}
