//! Inventory slot ledger
//!
//! Price-indexed table of [`Slot`]s. The ledger is the only writer of slot
//! state: price ticks move the buy window, order updates advance the
//! per-slot state machines, and every resulting intent goes out through the
//! [`OrderExecutor`].
//!
//! Locking rules:
//! - each slot sits behind its own `parking_lot::Mutex`, never held across `.await`
//! - `SlotStatus::Locked` marks an intent in flight; ticks skip locked slots
//! - lock order is slot -> client index / totals, never the reverse

mod error;

pub use error::{LedgerError, Result};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::executor::OrderExecutor;
use crate::domain::{
    decimals_of, round_to, ForceSyncOutcome, GridSpec, LedgerTotals, Order, OrderRequest,
    OrderStatus, OrderUpdate, PositionStatus, Side, Slot, SlotSnapshot, SlotSource, QTY_EPSILON,
};
use crate::infrastructure::config::InstanceConfig;

/// A cancel with no terminal event after this long is dropped from the slot
const STALE_CANCEL_SECS: i64 = 30;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub symbol: String,
    pub price_interval: f64,
    pub order_quantity: f64,
    pub buy_window_size: usize,
    pub sell_window_size: usize,
    pub price_decimals: u32,
    pub quantity_decimals: u32,
    /// How long new buys stay paused after a margin rejection
    pub margin_pause: Duration,
}

impl LedgerConfig {
    pub fn from_instance(instance: &InstanceConfig, price_decimals: u32, quantity_decimals: u32) -> Self {
        Self {
            symbol: instance.symbol.clone(),
            price_interval: instance.grid.price_interval,
            order_quantity: instance.grid.order_quantity,
            buy_window_size: instance.grid.buy_window_size,
            sell_window_size: instance.grid.sell_window_size,
            price_decimals,
            quantity_decimals,
            margin_pause: Duration::from_secs(instance.margin_pause_secs),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.price_interval > 0.0) {
            return Err(LedgerError::InvalidConfig(format!(
                "price_interval must be positive, got {}",
                self.price_interval
            )));
        }
        if !(self.order_quantity > 0.0) {
            return Err(LedgerError::InvalidConfig(format!(
                "order_quantity must be positive, got {}",
                self.order_quantity
            )));
        }
        if self.buy_window_size == 0 {
            return Err(LedgerError::InvalidConfig(
                "buy_window_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// What one `adjust_orders` pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdjustSummary {
    pub buys_placed: usize,
    pub sells_placed: usize,
    pub cancels_sent: usize,
    pub skipped_locked: usize,
    pub stale_cancels_reset: usize,
}

struct PlaceIntent {
    key: i64,
    token: u64,
    request: OrderRequest,
}

struct CancelIntent {
    key: i64,
    token: u64,
    order_id: String,
    previous: OrderStatus,
}

pub struct SlotLedger {
    config: LedgerConfig,
    executor: Arc<dyn OrderExecutor>,
    initialized: AtomicBool,
    grid: RwLock<Option<GridSpec>>,
    slots: RwLock<BTreeMap<i64, Arc<Mutex<Slot>>>>,
    /// ClientOrderID -> slot key for every order the ledger still tracks
    client_index: DashMap<String, i64>,
    totals: Mutex<LedgerTotals>,
    risk_pause: Arc<AtomicBool>,
    placement_paused_until: Mutex<Option<Instant>>,
    order_seq: AtomicU64,
}

impl SlotLedger {
    pub fn new(config: LedgerConfig, executor: Arc<dyn OrderExecutor>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            executor,
            initialized: AtomicBool::new(false),
            grid: RwLock::new(None),
            slots: RwLock::new(BTreeMap::new()),
            client_index: DashMap::new(),
            totals: Mutex::new(LedgerTotals::default()),
            risk_pause: Arc::new(AtomicBool::new(false)),
            placement_paused_until: Mutex::new(None),
            order_seq: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn grid(&self) -> Option<GridSpec> {
        *self.grid.read()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }

    pub fn totals(&self) -> LedgerTotals {
        *self.totals.lock()
    }

    /// Flag shared with the reconciler; while set no new buys go out and
    /// reconciliation skips its rounds
    pub fn risk_pause(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.risk_pause)
    }

    pub fn set_risk_pause(&self, paused: bool) {
        self.risk_pause.store(paused, Ordering::Release);
        info!(
            "[Ledger] {} risk pause {}",
            self.config.symbol,
            if paused { "set" } else { "cleared" }
        );
    }

    /// Whether new buy placements are currently suppressed
    pub fn is_placement_paused(&self) -> bool {
        if self.risk_pause.load(Ordering::Acquire) {
            return true;
        }

        let mut until = self.placement_paused_until.lock();
        match *until {
            Some(deadline) if Instant::now() < deadline => true,
            Some(_) => {
                *until = None;
                info!("[Ledger] {} margin pause expired", self.config.symbol);
                false
            }
            None => false,
        }
    }

    /// Clear a margin pause before its cooldown ends
    pub fn resume_placement(&self) {
        if self.placement_paused_until.lock().take().is_some() {
            info!("[Ledger] {} placement resumed", self.config.symbol);
        }
    }

    pub fn snapshot(&self, key: i64) -> Option<SlotSnapshot> {
        self.slot(key).map(|slot| slot.lock().snapshot())
    }

    /// Snapshots of every slot, ordered by price
    pub fn snapshots(&self) -> Vec<SlotSnapshot> {
        let mut out = Vec::new();
        self.iterate_slots(&mut |s: &SlotSnapshot| out.push(s.clone()));
        out
    }

    /// Visit every slot. Each slot lock is held only while its snapshot is taken.
    pub fn iterate_slots(&self, visit: &mut dyn FnMut(&SlotSnapshot)) {
        for slot in self.all_slots() {
            let snapshot = slot.lock().snapshot();
            visit(&snapshot);
        }
    }

    // ==================== INITIALIZE ====================

    /// Lay out the buy window below `anchor_price` and place one BUY per slot.
    ///
    /// Returns the number of orders accepted. A second call is a no-op; a call
    /// whose orders are all rejected leaves the ledger uninitialized.
    pub async fn initialize(&self, anchor_price: f64, anchor_price_str: &str) -> Result<usize> {
        if !(anchor_price > 0.0) {
            return Err(LedgerError::Initialization(format!(
                "invalid anchor price {}",
                anchor_price
            )));
        }

        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("[Ledger] {} already initialized", self.config.symbol);
            return Ok(0);
        }

        let decimals = self.config.price_decimals.max(decimals_of(anchor_price_str));
        let grid = GridSpec::new(anchor_price, self.config.price_interval, decimals);
        *self.grid.write() = Some(grid);

        let quantity = self.order_quantity();
        let mut intents = Vec::with_capacity(self.config.buy_window_size);
        for i in 1..=self.config.buy_window_size as i64 {
            let key = -i;
            let price = grid.price_at(key);
            if price <= 0.0 {
                break;
            }
            let slot = self.slot_or_create(key, &grid);
            let mut slot = slot.lock();
            intents.push(self.begin_placement(&mut slot, Side::Buy, price, quantity));
        }

        let requested = intents.len();
        let placed = self.submit_placements(intents).await;

        if placed == 0 {
            self.reset();
            return Err(LedgerError::Initialization(format!(
                "{}: all {} buy orders were rejected",
                self.config.symbol, requested
            )));
        }

        info!(
            "[Ledger] {} initialized at {} ({} decimals): {}/{} buys placed, interval {}",
            self.config.symbol, anchor_price, decimals, placed, requested, self.config.price_interval
        );
        Ok(placed)
    }

    fn reset(&self) {
        self.slots.write().clear();
        self.client_index.clear();
        *self.grid.write() = None;
        self.initialized.store(false, Ordering::Release);
    }

    // ==================== ADJUST ====================

    /// Move the buy window to `current_price`.
    ///
    /// Empty slots outside the window get their BUY canceled, empty slots in
    /// the window without an order get a BUY, and filled slots missing their
    /// SELL get it re-placed. Locked slots are left for the next tick.
    pub async fn adjust_orders(&self, current_price: f64) -> AdjustSummary {
        let mut summary = AdjustSummary::default();
        let Some(grid) = self.grid() else {
            return summary;
        };
        if !(current_price > 0.0) {
            return summary;
        }

        let top = grid.key_below(current_price);
        let bottom = top - (self.config.buy_window_size as i64 - 1);
        let ceiling = current_price + self.config.sell_window_size as f64 * self.config.price_interval;
        let buys_allowed = !self.is_placement_paused();
        let quantity = self.order_quantity();

        if buys_allowed {
            for key in bottom..=top {
                if grid.price_at(key) > 0.0 {
                    self.slot_or_create(key, &grid);
                }
            }
        }

        let mut buys = Vec::new();
        let mut sells = Vec::new();
        let mut cancels = Vec::new();
        let stale_after = chrono::Duration::seconds(STALE_CANCEL_SECS);

        for slot in self.all_slots() {
            let mut slot = slot.lock();
            if slot.is_locked() {
                summary.skipped_locked += 1;
                continue;
            }

            let key = slot.key();
            let price = slot.price();

            if slot.order_status == OrderStatus::CancelRequested {
                let stale = slot
                    .cancel_requested_at
                    .map(|at| Utc::now() - at > stale_after)
                    .unwrap_or(true);
                if stale {
                    debug!("[Ledger] Slot {} cancel never confirmed, resetting", price);
                    self.retire_order(&mut slot);
                    summary.stale_cancels_reset += 1;
                }
                continue;
            }

            match slot.position_status {
                PositionStatus::Empty => {
                    let has_buy = slot.order_side == Some(Side::Buy) && slot.order_status.is_active();
                    let in_window = key >= bottom && price <= ceiling;

                    if has_buy && !in_window {
                        if let Some(intent) = Self::begin_cancel(&mut slot) {
                            cancels.push(intent);
                        }
                    } else if slot.order_status == OrderStatus::None
                        && buys_allowed
                        && key >= bottom
                        && key <= top
                    {
                        buys.push(self.begin_placement(&mut slot, Side::Buy, price, quantity));
                    }
                }
                PositionStatus::Filled => {
                    if slot.order_status == OrderStatus::None {
                        if let Some(intent) = self.sell_intent(&mut slot, &grid) {
                            sells.push(intent);
                        }
                    }
                }
            }
        }

        summary.cancels_sent = self.submit_cancels(cancels).await;
        summary.buys_placed = self.submit_placements(buys).await;
        summary.sells_placed = self.submit_placements(sells).await;

        if summary.buys_placed + summary.sells_placed + summary.cancels_sent > 0 {
            debug!(
                "[Ledger] {} @ {}: +{} buys, +{} sells, {} cancels, {} locked",
                self.config.symbol,
                current_price,
                summary.buys_placed,
                summary.sells_placed,
                summary.cancels_sent,
                summary.skipped_locked
            );
        }
        summary
    }

    // ==================== ORDER UPDATES ====================

    /// Apply one order update from the order stream
    pub async fn on_order_update(&self, update: &OrderUpdate) {
        if update.symbol != self.config.symbol {
            return;
        }

        let key = match self
            .client_index
            .get(&update.client_order_id)
            .map(|entry| *entry.value())
        {
            Some(key) => key,
            None => {
                warn!(
                    "[Ledger] Dropping {} update for unknown order {} ({})",
                    update.status, update.client_order_id, update.order_id
                );
                return;
            }
        };

        let Some(slot) = self.slot(key) else {
            return;
        };

        let follow_up = {
            let mut slot = slot.lock();
            if slot.client_order_id.as_deref() != Some(update.client_order_id.as_str()) {
                debug!(
                    "[Ledger] Stale update for {} at slot {}",
                    update.client_order_id,
                    slot.price()
                );
                self.client_index.remove(&update.client_order_id);
                return;
            }
            self.apply_update(&mut slot, update)
        };

        if let Some(intent) = follow_up {
            self.submit_single(intent).await;
        }
    }

    fn apply_update(&self, slot: &mut Slot, update: &OrderUpdate) -> Option<PlaceIntent> {
        let side = slot.order_side.unwrap_or(update.side);
        if slot.order_id.is_none() && !update.order_id.is_empty() {
            slot.order_id = Some(update.order_id.clone());
        }

        match update.status {
            OrderStatus::None | OrderStatus::Placed | OrderStatus::Confirmed => {
                if slot.order_status == OrderStatus::Placed {
                    slot.order_status = OrderStatus::Confirmed;
                }
                None
            }
            OrderStatus::PartiallyFilled => {
                slot.order_filled_qty = slot.order_filled_qty.max(update.executed_qty);
                if slot.order_status != OrderStatus::CancelRequested {
                    slot.order_status = OrderStatus::PartiallyFilled;
                }
                None
            }
            OrderStatus::CancelRequested => {
                slot.order_status = OrderStatus::CancelRequested;
                if slot.cancel_requested_at.is_none() {
                    slot.cancel_requested_at = Some(Utc::now());
                }
                None
            }
            OrderStatus::Filled => {
                let executed = if update.executed_qty > QTY_EPSILON {
                    update.executed_qty
                } else {
                    update.quantity
                };
                self.book_fill(slot, side, executed)
            }
            OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected => {
                let executed = update.executed_qty.max(slot.order_filled_qty);
                if update.status != OrderStatus::Rejected && executed > QTY_EPSILON {
                    info!(
                        "[Ledger] {} {} at {} ended {} after partial fill {}",
                        self.config.symbol,
                        side,
                        slot.price(),
                        update.status,
                        executed
                    );
                    self.book_fill(slot, side, executed)
                } else {
                    debug!(
                        "[Ledger] {} {} at {} {}",
                        self.config.symbol,
                        side,
                        slot.price(),
                        update.status
                    );
                    self.retire_order(slot);
                    slot.unlock();
                    None
                }
            }
        }
    }

    /// Book executed quantity of the slot's order. A BUY returns the intent
    /// for its paired SELL.
    fn book_fill(&self, slot: &mut Slot, side: Side, executed: f64) -> Option<PlaceIntent> {
        self.retire_order(slot);
        slot.unlock();

        match side {
            Side::Buy => {
                slot.add_position(executed);
                self.totals.lock().total_buy_qty += executed;
                info!(
                    "[Ledger] {} BUY filled at {}: +{} (slot qty {})",
                    self.config.symbol,
                    slot.price(),
                    executed,
                    slot.position_qty
                );
                let grid = self.grid()?;
                self.sell_intent(slot, &grid)
            }
            Side::Sell => {
                slot.reduce_position(executed);
                {
                    let mut totals = self.totals.lock();
                    totals.total_sell_qty += executed;
                    totals.estimated_profit += executed * self.config.price_interval;
                }
                info!(
                    "[Ledger] {} SELL filled above {}: -{} (slot {})",
                    self.config.symbol,
                    slot.price(),
                    executed,
                    slot.position_status
                );
                None
            }
        }
    }

    // ==================== FORCE SYNC ====================

    /// Reset held quantity to the exchange position.
    ///
    /// Only a zero exchange position is applied: every FILLED slot is emptied
    /// and its outstanding SELL canceled. Locked slots are left for the next
    /// round. Any other value is logged and ignored.
    pub async fn force_sync_positions(&self, exchange_qty: f64) -> ForceSyncOutcome {
        let mut outcome = ForceSyncOutcome::default();

        if exchange_qty.abs() > QTY_EPSILON {
            warn!(
                "[Ledger] {} force sync to nonzero position {} is not applied per slot",
                self.config.symbol, exchange_qty
            );
            return outcome;
        }

        let mut cancels = Vec::new();
        for slot in self.all_slots() {
            let mut slot = slot.lock();
            if slot.position_status != PositionStatus::Filled {
                continue;
            }
            if slot.is_locked() {
                outcome.skipped_locked += 1;
                continue;
            }

            outcome.qty_cleared += slot.clear_position();
            outcome.slots_cleared += 1;

            let live_sell = slot.order_side == Some(Side::Sell)
                && slot.order_status.is_active()
                && slot.order_status != OrderStatus::CancelRequested;
            if live_sell {
                if let Some(intent) = Self::begin_cancel(&mut slot) {
                    cancels.push(intent);
                }
            }
        }

        outcome.orders_canceled = self.submit_cancels(cancels).await;

        warn!(
            "[Ledger] {} force sync: cleared {} slots ({} qty), canceled {} sells, {} locked",
            self.config.symbol,
            outcome.slots_cleared,
            outcome.qty_cleared,
            outcome.orders_canceled,
            outcome.skipped_locked
        );
        outcome
    }

    // ==================== INTENTS ====================

    fn order_quantity(&self) -> f64 {
        round_to(self.config.order_quantity, self.config.quantity_decimals)
    }

    fn next_client_order_id(&self, key: i64) -> String {
        let seq = self.order_seq.fetch_add(1, Ordering::Relaxed);
        let level = if key < 0 {
            format!("m{}", key.unsigned_abs())
        } else {
            key.to_string()
        };
        format!("gb-{}-{}-{}", level, Utc::now().timestamp_millis(), seq)
    }

    fn slot(&self, key: i64) -> Option<Arc<Mutex<Slot>>> {
        self.slots.read().get(&key).cloned()
    }

    fn slot_or_create(&self, key: i64, grid: &GridSpec) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slot(key) {
            return slot;
        }
        self.slots
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Slot::new(key, grid.price_at(key)))))
            .clone()
    }

    fn all_slots(&self) -> Vec<Arc<Mutex<Slot>>> {
        self.slots.read().values().cloned().collect()
    }

    fn retire_order(&self, slot: &mut Slot) {
        if let Some(coid) = slot.client_order_id.as_deref() {
            self.client_index.remove(coid);
        }
        slot.clear_order();
    }

    fn sell_intent(&self, slot: &mut Slot, grid: &GridSpec) -> Option<PlaceIntent> {
        let quantity = round_to(slot.position_qty, self.config.quantity_decimals);
        if quantity <= QTY_EPSILON {
            return None;
        }
        let price = grid.price_at(slot.key() + 1);
        Some(self.begin_placement(slot, Side::Sell, price, quantity))
    }

    /// Lock the slot and record the order before it is sent, so a stream
    /// event that beats the REST response still finds its slot
    fn begin_placement(&self, slot: &mut Slot, side: Side, price: f64, quantity: f64) -> PlaceIntent {
        let client_order_id = self.next_client_order_id(slot.key());
        let token = slot.lock();

        slot.order_id = None;
        slot.client_order_id = Some(client_order_id.clone());
        slot.order_side = Some(side);
        slot.order_status = OrderStatus::Placed;
        slot.order_price = price;
        slot.order_quantity = quantity;
        slot.order_filled_qty = 0.0;
        slot.order_created_at = Some(Utc::now());
        slot.cancel_requested_at = None;
        self.client_index.insert(client_order_id.clone(), slot.key());

        PlaceIntent {
            key: slot.key(),
            token,
            request: OrderRequest::limit(&self.config.symbol, side, price, quantity, client_order_id),
        }
    }

    fn finish_placement(&self, intent: &PlaceIntent, order: Option<&Order>) {
        let Some(slot) = self.slot(intent.key) else {
            return;
        };
        let mut slot = slot.lock();
        let coid = intent.request.client_order_id.as_str();
        let current = slot.client_order_id.as_deref() == Some(coid);

        match order {
            Some(order) if current => {
                if slot.order_id.is_none() {
                    slot.order_id = Some(order.order_id.clone());
                }
            }
            None if current && slot.order_status == OrderStatus::Placed => {
                self.retire_order(&mut slot);
            }
            _ => {}
        }
        slot.unlock_if(intent.token);
    }

    async fn submit_placements(&self, intents: Vec<PlaceIntent>) -> usize {
        if intents.is_empty() {
            return 0;
        }

        let requests: Vec<OrderRequest> = intents.iter().map(|i| i.request.clone()).collect();
        let (orders, has_margin_error) = self.executor.batch_place_orders(&requests).await;

        let accepted: HashMap<&str, &Order> = orders
            .iter()
            .map(|o| (o.client_order_id.as_str(), o))
            .collect();
        for intent in &intents {
            let order = accepted.get(intent.request.client_order_id.as_str()).copied();
            self.finish_placement(intent, order);
        }

        if has_margin_error {
            self.pause_placement();
        }
        orders.len()
    }

    async fn submit_single(&self, intent: PlaceIntent) {
        match self.executor.place_order(&intent.request).await {
            Ok(order) => self.finish_placement(&intent, Some(&order)),
            Err(e) => {
                warn!(
                    "[Ledger] {} {} {} @ {} failed: {}",
                    self.config.symbol,
                    intent.request.side,
                    intent.request.quantity,
                    intent.request.price,
                    e
                );
                if e.is_margin() {
                    self.pause_placement();
                }
                self.finish_placement(&intent, None);
            }
        }
    }

    fn begin_cancel(slot: &mut Slot) -> Option<CancelIntent> {
        let order_id = slot.order_id.clone()?;
        let previous = slot.order_status;
        let token = slot.lock();
        slot.order_status = OrderStatus::CancelRequested;
        slot.cancel_requested_at = Some(Utc::now());
        Some(CancelIntent {
            key: slot.key(),
            token,
            order_id,
            previous,
        })
    }

    async fn submit_cancels(&self, intents: Vec<CancelIntent>) -> usize {
        if intents.is_empty() {
            return 0;
        }

        let ids: Vec<String> = intents.iter().map(|c| c.order_id.clone()).collect();
        let result = self.executor.batch_cancel_orders(&ids).await;
        if let Err(e) = &result {
            warn!(
                "[Ledger] {} cancel of {} orders failed: {}",
                self.config.symbol,
                ids.len(),
                e
            );
        }

        for intent in &intents {
            let Some(slot) = self.slot(intent.key) else {
                continue;
            };
            let mut slot = slot.lock();
            let still_pending = slot.order_status == OrderStatus::CancelRequested
                && slot.order_id.as_deref() == Some(intent.order_id.as_str());
            if result.is_err() && still_pending {
                slot.order_status = intent.previous;
                slot.cancel_requested_at = None;
            }
            slot.unlock_if(intent.token);
        }

        if result.is_ok() {
            ids.len()
        } else {
            0
        }
    }

    fn pause_placement(&self) {
        let until = Instant::now() + self.config.margin_pause;
        *self.placement_paused_until.lock() = Some(until);
        warn!(
            "[Ledger] {} margin rejection, new buys paused for {:?}",
            self.config.symbol, self.config.margin_pause
        );
    }
}

#[async_trait]
impl SlotSource for SlotLedger {
    fn iterate_slots(&self, visit: &mut dyn FnMut(&SlotSnapshot)) {
        SlotLedger::iterate_slots(self, visit)
    }

    fn totals(&self) -> LedgerTotals {
        SlotLedger::totals(self)
    }

    async fn force_sync_positions(&self, exchange_qty: f64) -> ForceSyncOutcome {
        SlotLedger::force_sync_positions(self, exchange_qty).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::executor::ExchangeExecutor;
    use crate::domain::{OrderType, SlotStatus};
    use crate::infrastructure::exchange::testing::FakeExchange;
    use crate::infrastructure::exchange::{ExchangeError, Result as ExchangeResult};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    fn config() -> LedgerConfig {
        LedgerConfig {
            symbol: "BTCUSDT".to_string(),
            price_interval: 100.0,
            order_quantity: 0.01,
            buy_window_size: 5,
            sell_window_size: 5,
            price_decimals: 2,
            quantity_decimals: 3,
            margin_pause: Duration::from_secs(60),
        }
    }

    fn fake_ledger() -> (Arc<FakeExchange>, SlotLedger) {
        let fake = Arc::new(FakeExchange::new("BTCUSDT"));
        let executor = Arc::new(ExchangeExecutor::new(fake.clone()));
        let ledger = SlotLedger::new(config(), executor).unwrap();
        (fake, ledger)
    }

    fn update_for(snapshot: &SlotSnapshot, status: OrderStatus, executed: f64) -> OrderUpdate {
        OrderUpdate {
            order_id: snapshot.order_id.clone().unwrap_or_default(),
            client_order_id: snapshot.client_order_id.clone().unwrap(),
            symbol: "BTCUSDT".to_string(),
            side: snapshot.order_side.unwrap(),
            order_type: OrderType::Limit,
            status,
            price: snapshot.order_price,
            quantity: snapshot.order_quantity,
            executed_qty: executed,
            avg_price: snapshot.order_price,
            update_time: Utc::now(),
        }
    }

    fn assert_position_invariant(ledger: &SlotLedger) {
        for s in ledger.snapshots() {
            assert_eq!(
                s.position_status == PositionStatus::Filled,
                s.position_qty > QTY_EPSILON,
                "slot {} breaks FILLED <=> qty > 0",
                s.price
            );
        }
    }

    /// Executor that accepts or rejects everything for margin
    #[derive(Default)]
    struct ScriptedExecutor {
        reject: AtomicBool,
        batch_calls: AtomicUsize,
        single_calls: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn accept(request: &OrderRequest) -> Order {
            Order {
                order_id: format!("id-{}", request.client_order_id),
                client_order_id: request.client_order_id.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                order_type: request.order_type,
                status: OrderStatus::Placed,
                price: request.price,
                quantity: request.quantity,
                executed_qty: 0.0,
                created_at: Utc::now(),
            }
        }
    }

    #[async_trait]
    impl OrderExecutor for ScriptedExecutor {
        async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<Order> {
            self.single_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject.load(Ordering::SeqCst) {
                return Err(ExchangeError::InsufficientMargin(
                    "Margin is insufficient.".to_string(),
                ));
            }
            Ok(Self::accept(request))
        }

        async fn batch_place_orders(&self, requests: &[OrderRequest]) -> (Vec<Order>, bool) {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject.load(Ordering::SeqCst) {
                return (Vec::new(), true);
            }
            (requests.iter().map(Self::accept).collect(), false)
        }

        async fn batch_cancel_orders(&self, _order_ids: &[String]) -> ExchangeResult<()> {
            Ok(())
        }
    }

    /// Executor whose single placements wait for a permit
    struct GatedExecutor {
        gate: tokio::sync::Semaphore,
        singles: Mutex<Vec<OrderRequest>>,
        inner: ScriptedExecutor,
    }

    impl GatedExecutor {
        fn new() -> Self {
            Self {
                gate: tokio::sync::Semaphore::new(0),
                singles: Mutex::new(Vec::new()),
                inner: ScriptedExecutor::default(),
            }
        }
    }

    #[async_trait]
    impl OrderExecutor for GatedExecutor {
        async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<Order> {
            self.gate.acquire().await.unwrap().forget();
            self.singles.lock().push(request.clone());
            self.inner.place_order(request).await
        }

        async fn batch_place_orders(&self, requests: &[OrderRequest]) -> (Vec<Order>, bool) {
            self.inner.batch_place_orders(requests).await
        }

        async fn batch_cancel_orders(&self, order_ids: &[String]) -> ExchangeResult<()> {
            self.inner.batch_cancel_orders(order_ids).await
        }
    }

    #[tokio::test]
    async fn test_initialize_places_buy_window() {
        let (fake, ledger) = fake_ledger();

        let placed = ledger.initialize(50000.0, "50000.00").await.unwrap();
        assert_eq!(placed, 5);
        assert_eq!(ledger.slot_count(), 5);

        let snapshots = ledger.snapshots();
        let prices: Vec<f64> = snapshots.iter().map(|s| s.price).collect();
        assert_eq!(prices, vec![49500.0, 49600.0, 49700.0, 49800.0, 49900.0]);
        for s in &snapshots {
            assert_eq!(s.slot_status, SlotStatus::Unlocked);
            assert!(s.has_active_order(Side::Buy));
            assert!(s.order_id.is_some());
        }
        assert_eq!(fake.placed().len(), 5);
        assert!(fake.placed().iter().all(|r| r.side == Side::Buy));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (fake, ledger) = fake_ledger();
        ledger.initialize(50000.0, "50000.00").await.unwrap();
        assert_eq!(ledger.initialize(50000.0, "50000.00").await.unwrap(), 0);
        assert_eq!(fake.placed().len(), 5);
    }

    #[tokio::test]
    async fn test_failed_initialize_can_be_retried() {
        let executor = Arc::new(ScriptedExecutor::default());
        executor.reject.store(true, Ordering::SeqCst);
        let ledger = SlotLedger::new(config(), executor.clone()).unwrap();

        let err = ledger.initialize(50000.0, "50000.00").await.unwrap_err();
        assert!(matches!(err, LedgerError::Initialization(_)));
        assert!(!ledger.is_initialized());
        assert_eq!(ledger.slot_count(), 0);

        executor.reject.store(false, Ordering::SeqCst);
        ledger.resume_placement();
        assert_eq!(ledger.initialize(50000.0, "50000.00").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_buy_fill_books_position_and_places_sell() {
        let (fake, ledger) = fake_ledger();
        ledger.initialize(50000.0, "50000.00").await.unwrap();

        let slot = ledger.snapshot(-1).unwrap();
        assert_eq!(slot.price, 49900.0);
        ledger
            .on_order_update(&update_for(&slot, OrderStatus::Filled, slot.order_quantity))
            .await;

        let after = ledger.snapshot(-1).unwrap();
        assert_eq!(after.position_status, PositionStatus::Filled);
        assert_eq!(after.position_qty, 0.01);
        assert_eq!(ledger.totals().total_buy_qty, 0.01);

        let sell = fake.placed().last().cloned().unwrap();
        assert_eq!(sell.side, Side::Sell);
        assert_eq!(sell.price, 50000.0);
        assert_eq!(sell.quantity, 0.01);
        assert!(after.has_active_order(Side::Sell));
        assert_eq!(after.slot_status, SlotStatus::Unlocked);
    }

    #[tokio::test]
    async fn test_sell_fill_empties_slot() {
        let (_fake, ledger) = fake_ledger();
        ledger.initialize(50000.0, "50000.00").await.unwrap();

        let buy = ledger.snapshot(-1).unwrap();
        ledger
            .on_order_update(&update_for(&buy, OrderStatus::Filled, 0.01))
            .await;
        let sell = ledger.snapshot(-1).unwrap();
        ledger
            .on_order_update(&update_for(&sell, OrderStatus::Filled, 0.01))
            .await;

        let after = ledger.snapshot(-1).unwrap();
        assert_eq!(after.position_status, PositionStatus::Empty);
        assert_eq!(after.position_qty, 0.0);
        assert_eq!(after.order_status, OrderStatus::None);

        let totals = ledger.totals();
        assert_eq!(totals.total_buy_qty, 0.01);
        assert_eq!(totals.total_sell_qty, 0.01);
        assert!((totals.estimated_profit - 1.0).abs() < 1e-9);
        assert_position_invariant(&ledger);
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_updates_are_dropped() {
        let (_fake, ledger) = fake_ledger();
        ledger.initialize(50000.0, "50000.00").await.unwrap();

        let buy = ledger.snapshot(-2).unwrap();
        let fill = update_for(&buy, OrderStatus::Filled, 0.01);
        ledger.on_order_update(&fill).await;
        // replayed event for an order that already completed
        ledger.on_order_update(&fill).await;
        assert_eq!(ledger.totals().total_buy_qty, 0.01);

        let mut unknown = fill.clone();
        unknown.client_order_id = "manual-order".to_string();
        ledger.on_order_update(&unknown).await;
        assert_eq!(ledger.totals().total_buy_qty, 0.01);
        assert_eq!(ledger.snapshot(-2).unwrap().position_qty, 0.01);
    }

    #[tokio::test]
    async fn test_partial_buy_then_cancel_books_executed_part() {
        let (fake, ledger) = fake_ledger();
        ledger.initialize(50000.0, "50000.00").await.unwrap();

        let buy = ledger.snapshot(-3).unwrap();
        ledger
            .on_order_update(&update_for(&buy, OrderStatus::PartiallyFilled, 0.004))
            .await;
        let partial = ledger.snapshot(-3).unwrap();
        assert_eq!(partial.order_status, OrderStatus::PartiallyFilled);
        assert_eq!(partial.position_status, PositionStatus::Empty);

        ledger
            .on_order_update(&update_for(&buy, OrderStatus::Canceled, 0.004))
            .await;
        let after = ledger.snapshot(-3).unwrap();
        assert_eq!(after.position_qty, 0.004);
        assert!(after.has_active_order(Side::Sell));
        assert_eq!(fake.placed().last().unwrap().quantity, 0.004);
        assert_position_invariant(&ledger);
    }

    #[tokio::test]
    async fn test_cancel_without_fill_clears_order() {
        let (_fake, ledger) = fake_ledger();
        ledger.initialize(50000.0, "50000.00").await.unwrap();

        let buy = ledger.snapshot(-4).unwrap();
        ledger
            .on_order_update(&update_for(&buy, OrderStatus::Rejected, 0.0))
            .await;
        let after = ledger.snapshot(-4).unwrap();
        assert_eq!(after.order_status, OrderStatus::None);
        assert_eq!(after.slot_status, SlotStatus::Unlocked);
        assert_eq!(after.position_status, PositionStatus::Empty);
    }

    #[tokio::test]
    async fn test_adjust_moves_window_up() {
        let (fake, ledger) = fake_ledger();
        ledger.initialize(50000.0, "50000.00").await.unwrap();

        let summary = ledger.adjust_orders(50250.0).await;
        // window is now 49800..=50200
        assert_eq!(summary.buys_placed, 3);
        assert_eq!(summary.cancels_sent, 3);
        assert_eq!(fake.canceled().len(), 3);
        assert_eq!(
            ledger.snapshot(-5).unwrap().order_status,
            OrderStatus::CancelRequested
        );
        assert!(ledger.snapshot(2).unwrap().has_active_order(Side::Buy));

        // nothing new on the same price
        let again = ledger.adjust_orders(50250.0).await;
        assert_eq!(again.buys_placed, 0);
        assert_eq!(again.cancels_sent, 0);

        let prices: HashSet<i64> = ledger
            .snapshots()
            .iter()
            .map(|s| (s.price * 100.0).round() as i64)
            .collect();
        assert_eq!(prices.len(), ledger.slot_count());
    }

    #[tokio::test]
    async fn test_adjust_replaces_missing_sell() {
        let executor = Arc::new(ScriptedExecutor::default());
        let ledger = SlotLedger::new(config(), executor.clone()).unwrap();
        ledger.initialize(50000.0, "50000.00").await.unwrap();

        // sell placement after the fill is rejected
        executor.reject.store(true, Ordering::SeqCst);
        let buy = ledger.snapshot(-1).unwrap();
        ledger
            .on_order_update(&update_for(&buy, OrderStatus::Filled, 0.01))
            .await;

        let after = ledger.snapshot(-1).unwrap();
        assert_eq!(after.position_status, PositionStatus::Filled);
        assert_eq!(after.order_status, OrderStatus::None);
        assert_eq!(after.slot_status, SlotStatus::Unlocked);

        executor.reject.store(false, Ordering::SeqCst);
        let summary = ledger.adjust_orders(49950.0).await;
        assert_eq!(summary.sells_placed, 1);
        assert!(ledger.snapshot(-1).unwrap().has_active_order(Side::Sell));
    }

    #[tokio::test]
    async fn test_adjust_skips_slot_with_placement_in_flight() {
        let executor = Arc::new(GatedExecutor::new());
        let ledger = SlotLedger::new(config(), executor.clone()).unwrap();
        ledger.initialize(50000.0, "50000.00").await.unwrap();

        let buy = ledger.snapshot(-1).unwrap();
        let fill = update_for(&buy, OrderStatus::Filled, 0.01);

        let (_, summary) = tokio::join!(ledger.on_order_update(&fill), async {
            // the fill handler is parked on the gate with its SELL recorded
            let pending = ledger.snapshot(-1).unwrap();
            assert_eq!(pending.slot_status, SlotStatus::Locked);
            assert!(pending.has_active_order(Side::Sell));

            let summary = ledger.adjust_orders(49950.0).await;
            executor.gate.add_permits(1);
            summary
        });

        assert_eq!(summary.skipped_locked, 1);
        assert_eq!(summary.sells_placed, 0);
        assert_eq!(summary.buys_placed, 0);

        // exactly one SELL went out for the filled slot
        let singles = executor.singles.lock().clone();
        assert_eq!(singles.len(), 1);
        assert_eq!(singles[0].side, Side::Sell);
        assert_eq!(singles[0].price, 50000.0);

        let after = ledger.snapshot(-1).unwrap();
        assert_eq!(after.slot_status, SlotStatus::Unlocked);
        assert!(after.has_active_order(Side::Sell));
        assert_eq!(after.position_status, PositionStatus::Filled);
    }

    #[tokio::test]
    async fn test_stale_cancel_request_is_reset() {
        let (_fake, ledger) = fake_ledger();
        ledger.initialize(50000.0, "50000.00").await.unwrap();
        ledger.adjust_orders(50250.0).await;

        // no terminal event ever arrives for the cancel at 49500
        let stale = ledger.snapshot(-5).unwrap();
        assert_eq!(stale.order_status, OrderStatus::CancelRequested);
        ledger.slot(-5).unwrap().lock().cancel_requested_at =
            Some(Utc::now() - chrono::Duration::seconds(STALE_CANCEL_SECS + 1));

        let summary = ledger.adjust_orders(50250.0).await;
        assert_eq!(summary.stale_cancels_reset, 1);
        assert_eq!(summary.buys_placed, 0);

        let reset = ledger.snapshot(-5).unwrap();
        assert_eq!(reset.order_status, OrderStatus::None);
        assert!(reset.client_order_id.is_none());
        assert_eq!(reset.slot_status, SlotStatus::Unlocked);

        // recent cancels are left alone
        assert_eq!(
            ledger.snapshot(-4).unwrap().order_status,
            OrderStatus::CancelRequested
        );

        // a late fill for the dropped order no longer maps to the slot
        ledger
            .on_order_update(&update_for(&stale, OrderStatus::Filled, 0.01))
            .await;
        assert_eq!(ledger.snapshot(-5).unwrap().position_status, PositionStatus::Empty);
        assert_eq!(ledger.totals().total_buy_qty, 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_keep_slots_consistent() {
        let (fake, ledger) = fake_ledger();
        let ledger = Arc::new(ledger);
        ledger.initialize(50000.0, "50000.00").await.unwrap();

        let fills: Vec<OrderUpdate> = ledger
            .snapshots()
            .iter()
            .filter_map(|s| fake.fill(s.order_id.as_deref()?))
            .collect();
        assert_eq!(fills.len(), 5);

        let mut tasks = Vec::new();
        for fill in fills {
            let ledger = Arc::clone(&ledger);
            tasks.push(tokio::spawn(async move {
                ledger.on_order_update(&fill).await;
            }));
        }
        for price in [49950.0, 50050.0, 49850.0, 50150.0] {
            let ledger = Arc::clone(&ledger);
            tasks.push(tokio::spawn(async move {
                ledger.adjust_orders(price).await;
            }));
        }
        {
            let ledger = Arc::clone(&ledger);
            tasks.push(tokio::spawn(async move {
                ledger.force_sync_positions(0.0).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_position_invariant(&ledger);
        let snapshots = ledger.snapshots();
        assert!(snapshots.iter().all(|s| s.slot_status == SlotStatus::Unlocked));

        let coids: Vec<&String> = snapshots
            .iter()
            .filter_map(|s| s.client_order_id.as_ref())
            .collect();
        let unique: HashSet<&String> = coids.iter().copied().collect();
        assert_eq!(coids.len(), unique.len());

        // no two live exchange orders on the same side and price
        let open = fake.open_orders();
        let levels: HashSet<(Side, i64)> = open
            .iter()
            .map(|o| (o.side, (o.price * 100.0).round() as i64))
            .collect();
        assert_eq!(levels.len(), open.len());

        // every live ledger order exists on the exchange
        let open_coids: HashSet<&str> = open.iter().map(|o| o.client_order_id.as_str()).collect();
        for s in &snapshots {
            if s.order_status.is_active() && s.order_status != OrderStatus::CancelRequested {
                let coid = s.client_order_id.as_deref().unwrap();
                assert!(open_coids.contains(coid), "slot {} order {} not on exchange", s.price, coid);
            }
        }
    }

    #[tokio::test]
    async fn test_margin_error_pauses_buys() {
        let executor = Arc::new(ScriptedExecutor::default());
        let ledger = SlotLedger::new(config(), executor.clone()).unwrap();
        ledger.initialize(50000.0, "50000.00").await.unwrap();

        executor.reject.store(true, Ordering::SeqCst);
        let first = ledger.adjust_orders(50250.0).await;
        assert_eq!(first.buys_placed, 0);
        assert!(ledger.is_placement_paused());
        let calls = executor.batch_calls.load(Ordering::SeqCst);

        // paused: no further buy attempts
        let second = ledger.adjust_orders(50250.0).await;
        assert_eq!(second.buys_placed, 0);
        assert_eq!(executor.batch_calls.load(Ordering::SeqCst), calls);

        executor.reject.store(false, Ordering::SeqCst);
        ledger.resume_placement();
        let third = ledger.adjust_orders(50250.0).await;
        assert_eq!(third.buys_placed, 3);
    }

    #[tokio::test]
    async fn test_risk_pause_blocks_buys() {
        let (_fake, ledger) = fake_ledger();
        ledger.initialize(50000.0, "50000.00").await.unwrap();
        ledger.set_risk_pause(true);
        assert_eq!(ledger.adjust_orders(50250.0).await.buys_placed, 0);
        ledger.set_risk_pause(false);
        assert_eq!(ledger.adjust_orders(50250.0).await.buys_placed, 3);
    }

    #[tokio::test]
    async fn test_force_sync_clears_filled_slots() {
        let (fake, ledger) = fake_ledger();
        ledger.initialize(50000.0, "50000.00").await.unwrap();

        for key in [-1, -2] {
            let buy = ledger.snapshot(key).unwrap();
            ledger
                .on_order_update(&update_for(&buy, OrderStatus::Filled, 0.01))
                .await;
        }

        // nonzero target changes nothing
        let ignored = ledger.force_sync_positions(0.01).await;
        assert_eq!(ignored, ForceSyncOutcome::default());
        assert_eq!(ledger.snapshot(-1).unwrap().position_qty, 0.01);

        let outcome = ledger.force_sync_positions(0.0).await;
        assert_eq!(outcome.slots_cleared, 2);
        assert!((outcome.qty_cleared - 0.02).abs() < 1e-9);
        assert_eq!(outcome.orders_canceled, 2);
        assert_eq!(fake.canceled().len(), 2);

        for key in [-1, -2] {
            let s = ledger.snapshot(key).unwrap();
            assert_eq!(s.position_status, PositionStatus::Empty);
            assert_eq!(s.order_status, OrderStatus::CancelRequested);
        }
        assert_position_invariant(&ledger);
    }

    #[test]
    fn test_client_order_ids_are_unique_and_short() {
        let (_fake, ledger) = fake_ledger();
        let a = ledger.next_client_order_id(-12);
        let b = ledger.next_client_order_id(-12);
        assert_ne!(a, b);
        assert!(a.starts_with("gb-m12-"));
        assert!(a.len() <= 36);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut cfg = config();
        cfg.price_interval = 0.0;
        let executor = Arc::new(ScriptedExecutor::default());
        assert!(matches!(
            SlotLedger::new(cfg, executor),
            Err(LedgerError::InvalidConfig(_))
        ));
    }
}
