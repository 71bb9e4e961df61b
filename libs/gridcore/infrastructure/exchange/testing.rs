//! In-memory exchange for tests
//!
//! Implements only the raw adapter calls, so the resilient provided methods
//! run exactly as in production. Available to integration tests through the
//! `test-util` feature.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::adapter::ExchangeAdapter;
use super::error::{ExchangeError, Result};
use super::resilience::{PollThrottle, RetryPolicy};
use crate::domain::{
    Account, FundingRate, Kline, Order, OrderRequest, OrderStatus, OrderUpdate, Position,
    PriceTick, Side,
};
use crate::infrastructure::shutdown::ShutdownManager;

#[derive(Default)]
struct FakeState {
    open: BTreeMap<String, Order>,
    next_id: u64,
    position_size: f64,
    balance: f64,
    batch_sizes: Vec<usize>,
    batch_calls: usize,
    single_orders: usize,
    fail_next_batch: Option<ExchangeError>,
    fail_batches: bool,
    margin_coids: HashSet<String>,
    position_errors: VecDeque<ExchangeError>,
    placed: Vec<OrderRequest>,
    canceled: Vec<String>,
    position_calls: usize,
    order_tx: Option<UnboundedSender<OrderUpdate>>,
    price_tx: Option<UnboundedSender<PriceTick>>,
}

pub struct FakeExchange {
    symbol: String,
    policy: RetryPolicy,
    throttle: PollThrottle,
    state: Mutex<FakeState>,
}

impl FakeExchange {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            policy: RetryPolicy::default(),
            throttle: PollThrottle::default(),
            state: Mutex::new(FakeState {
                balance: 10_000.0,
                ..FakeState::default()
            }),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overwrite the exchange position, as after a manual close
    pub fn set_position(&self, size: f64) {
        self.state.lock().position_size = size;
    }

    /// Net position, moved by every [`FakeExchange::fill`]
    pub fn position(&self) -> f64 {
        self.state.lock().position_size
    }

    pub fn set_balance(&self, balance: f64) {
        self.state.lock().balance = balance;
    }

    pub fn fail_next_batch(&self, error: ExchangeError) {
        self.state.lock().fail_next_batch = Some(error);
    }

    /// Make every batch request fail as a whole
    pub fn fail_batches(&self, fail: bool) {
        self.state.lock().fail_batches = fail;
    }

    pub fn reject_coid_for_margin(&self, coid: &str) {
        self.state.lock().margin_coids.insert(coid.to_string());
    }

    pub fn queue_position_error(&self, error: ExchangeError) {
        self.state.lock().position_errors.push_back(error);
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().batch_sizes.clone()
    }

    /// Batch requests received, failed ones included
    pub fn batch_calls(&self) -> usize {
        self.state.lock().batch_calls
    }

    pub fn single_order_count(&self) -> usize {
        self.state.lock().single_orders
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        self.state.lock().placed.clone()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.state.lock().canceled.clone()
    }

    pub fn open_order_count(&self) -> usize {
        self.state.lock().open.len()
    }

    pub fn position_calls(&self) -> usize {
        self.state.lock().position_calls
    }

    /// Deliver a tick to the price stream, if started
    pub fn push_price(&self, bid: f64, ask: f64) -> bool {
        let state = self.state.lock();
        match &state.price_tx {
            Some(tx) => tx
                .send(PriceTick {
                    symbol: self.symbol.clone(),
                    bid,
                    ask,
                    time: Utc::now(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Deliver an update to the order stream, if started
    pub fn push_update(&self, update: OrderUpdate) -> bool {
        let state = self.state.lock();
        match &state.order_tx {
            Some(tx) => tx.send(update).is_ok(),
            None => false,
        }
    }

    /// Highest-priced open order on `side`
    pub fn best(&self, side: Side) -> Option<Order> {
        self.open_orders()
            .into_iter()
            .filter(|o| o.side == side)
            .max_by(|a, b| a.price.total_cmp(&b.price))
    }

    /// Mark an open order filled and build the matching stream event
    pub fn fill(&self, order_id: &str) -> Option<OrderUpdate> {
        let mut state = self.state.lock();
        let order = state.open.remove(order_id)?;
        match order.side {
            Side::Buy => state.position_size += order.quantity,
            Side::Sell => state.position_size -= order.quantity,
        }
        Some(OrderUpdate {
            order_id: order.order_id,
            client_order_id: order.client_order_id,
            symbol: order.symbol,
            side: order.side,
            order_type: order.order_type,
            status: OrderStatus::Filled,
            price: order.price,
            quantity: order.quantity,
            executed_qty: order.quantity,
            avg_price: order.price,
            update_time: Utc::now(),
        })
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.state.lock().open.values().cloned().collect()
    }

    fn accept(&self, request: &OrderRequest) -> Result<Order> {
        let mut state = self.state.lock();
        if state.margin_coids.contains(&request.client_order_id) {
            return Err(ExchangeError::InsufficientMargin(
                "Margin is insufficient.".to_string(),
            ));
        }

        state.next_id += 1;
        let order = Order {
            order_id: state.next_id.to_string(),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            status: OrderStatus::Placed,
            price: request.price,
            quantity: request.quantity,
            executed_qty: 0.0,
            created_at: Utc::now(),
        };
        state.open.insert(order.order_id.clone(), order.clone());
        state.placed.push(request.clone());
        Ok(order)
    }

    fn remove(&self, order_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        match state.open.remove(order_id) {
            Some(_) => {
                state.canceled.push(order_id.to_string());
                Ok(())
            }
            None => Err(ExchangeError::OrderNotFound(order_id.to_string())),
        }
    }

    fn unsupported(&self, operation: &str) -> ExchangeError {
        ExchangeError::Unsupported {
            exchange: "fake".to_string(),
            operation: operation.to_string(),
        }
    }
}

fn idle_task(shutdown: Arc<ShutdownManager>) -> JoinHandle<()> {
    tokio::spawn(async move { shutdown.cancelled().await })
}

#[async_trait]
impl ExchangeAdapter for FakeExchange {
    fn name(&self) -> &str {
        "fake"
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn price_decimals(&self) -> u32 {
        2
    }

    fn quantity_decimals(&self) -> u32 {
        3
    }

    fn base_asset(&self) -> &str {
        "BTC"
    }

    fn quote_asset(&self) -> &str {
        "USDT"
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn poll_throttle(&self) -> &PollThrottle {
        &self.throttle
    }

    async fn send_order(&self, request: &OrderRequest) -> Result<Order> {
        self.state.lock().single_orders += 1;
        self.accept(request)
    }

    async fn send_order_batch(&self, requests: &[OrderRequest]) -> Result<Vec<Result<Order>>> {
        {
            let mut state = self.state.lock();
            state.batch_calls += 1;
            if let Some(error) = state.fail_next_batch.take() {
                return Err(error);
            }
            if state.fail_batches {
                return Err(ExchangeError::Api {
                    code: -1000,
                    message: "Internal error; unable to process your request.".to_string(),
                });
            }
            state.batch_sizes.push(requests.len());
        }
        Ok(requests.iter().map(|r| self.accept(r)).collect())
    }

    async fn send_cancel(&self, _symbol: &str, order_id: &str) -> Result<()> {
        self.remove(order_id)
    }

    async fn send_cancel_batch(&self, _symbol: &str, order_ids: &[String]) -> Result<Vec<Result<()>>> {
        Ok(order_ids.iter().map(|id| self.remove(id)).collect())
    }

    async fn fetch_open_orders(&self, _symbol: &str) -> Result<Vec<Order>> {
        Ok(self.state.lock().open.values().cloned().collect())
    }

    async fn fetch_positions(&self, symbol: &str) -> Result<Vec<Position>> {
        let mut state = self.state.lock();
        state.position_calls += 1;
        if let Some(error) = state.position_errors.pop_front() {
            return Err(error);
        }
        Ok(vec![Position {
            symbol: symbol.to_string(),
            size: state.position_size,
            entry_price: 0.0,
            leverage: 1.0,
            unrealized_pnl: 0.0,
        }])
    }

    async fn cancel_all_orders(&self, _symbol: &str) -> Result<()> {
        let mut state = self.state.lock();
        let ids: Vec<String> = state.open.keys().cloned().collect();
        state.open.clear();
        state.canceled.extend(ids);
        Ok(())
    }

    async fn get_account(&self) -> Result<Account> {
        let balance = self.state.lock().balance;
        Ok(Account {
            total_wallet_balance: balance,
            available_balance: balance,
            total_unrealized_pnl: 0.0,
            can_trade: true,
        })
    }

    async fn get_balance(&self, _asset: &str) -> Result<f64> {
        Ok(self.state.lock().balance)
    }

    async fn start_order_stream(
        &self,
        tx: UnboundedSender<OrderUpdate>,
        shutdown: Arc<ShutdownManager>,
    ) -> Result<JoinHandle<()>> {
        self.state.lock().order_tx = Some(tx);
        Ok(idle_task(shutdown))
    }

    async fn start_price_stream(
        &self,
        _symbol: &str,
        tx: UnboundedSender<PriceTick>,
        shutdown: Arc<ShutdownManager>,
    ) -> Result<JoinHandle<()>> {
        self.state.lock().price_tx = Some(tx);
        Ok(idle_task(shutdown))
    }

    async fn start_kline_stream(
        &self,
        _symbol: &str,
        _interval: &str,
        _tx: UnboundedSender<Kline>,
        shutdown: Arc<ShutdownManager>,
    ) -> Result<JoinHandle<()>> {
        Ok(idle_task(shutdown))
    }

    async fn get_historical_klines(&self, _symbol: &str, _interval: &str, _limit: u32) -> Result<Vec<Kline>> {
        Err(self.unsupported("get_historical_klines"))
    }

    async fn get_funding_rate(&self, _symbol: &str) -> Result<FundingRate> {
        Err(self.unsupported("get_funding_rate"))
    }

    async fn get_spot_price(&self, _symbol: &str) -> Result<f64> {
        Err(self.unsupported("get_spot_price"))
    }
}
