//! Inventory slots
//!
//! A slot is one fixed price level of the grid. It carries two independent
//! state machines:
//!
//! ```text
//! OrderStatus:    NONE -> PLACED -> CONFIRMED -> {PARTIALLY_FILLED -> FILLED
//!                                                | CANCEL_REQUESTED -> CANCELED
//!                                                | REJECTED | EXPIRED} -> NONE
//! PositionStatus: EMPTY -> (BUY FILLED) -> FILLED -> (SELL FILLED) -> EMPTY
//! ```
//!
//! Slots are never destroyed; once an order cycle ends the slot returns to
//! `OrderStatus::None` and is reused when price comes back to that level.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::order::{OrderStatus, Side};

/// Quantities below this are treated as zero
pub const QTY_EPSILON: f64 = 1e-9;

/// Guards a slot against concurrent order intents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Unlocked,
    /// A placement or cancellation for this slot is in flight
    Locked,
}

/// Inventory held at a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Empty,
    /// Buy leg executed; the paired sell is outstanding or pending
    Filled,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionStatus::Empty => write!(f, "EMPTY"),
            PositionStatus::Filled => write!(f, "FILLED"),
        }
    }
}

// =============================================================================
// Slot
// =============================================================================

#[derive(Debug, Clone)]
pub struct Slot {
    key: i64,
    price: f64,
    pub slot_status: SlotStatus,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub order_side: Option<Side>,
    pub order_status: OrderStatus,
    pub order_price: f64,
    pub order_quantity: f64,
    pub order_filled_qty: f64,
    pub position_status: PositionStatus,
    pub position_qty: f64,
    pub order_created_at: Option<DateTime<Utc>>,
    /// Set when a cancel is sent; used to expire cancels whose event never arrives
    pub cancel_requested_at: Option<DateTime<Utc>>,
    lock_token: u64,
}

impl Slot {
    pub fn new(key: i64, price: f64) -> Self {
        Self {
            key,
            price,
            slot_status: SlotStatus::Unlocked,
            order_id: None,
            client_order_id: None,
            order_side: None,
            order_status: OrderStatus::None,
            order_price: 0.0,
            order_quantity: 0.0,
            order_filled_qty: 0.0,
            position_status: PositionStatus::Empty,
            position_qty: 0.0,
            order_created_at: None,
            cancel_requested_at: None,
            lock_token: 0,
        }
    }

    /// Grid index of this slot (identity key)
    pub fn key(&self) -> i64 {
        self.key
    }

    /// Grid price of this slot
    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn is_locked(&self) -> bool {
        self.slot_status == SlotStatus::Locked
    }

    /// Lock the slot for an in-flight intent. The returned token must be
    /// handed back to [`Slot::unlock_if`] when the intent completes.
    pub fn lock(&mut self) -> u64 {
        self.lock_token = self.lock_token.wrapping_add(1);
        self.slot_status = SlotStatus::Locked;
        self.lock_token
    }

    /// Unlock only if no newer intent re-locked the slot in the meantime.
    pub fn unlock_if(&mut self, token: u64) -> bool {
        if self.lock_token == token && self.slot_status == SlotStatus::Locked {
            self.slot_status = SlotStatus::Unlocked;
            return true;
        }
        false
    }

    /// Unlock unconditionally (a terminal order event ends any intent)
    pub fn unlock(&mut self) {
        self.slot_status = SlotStatus::Unlocked;
    }

    /// Reset all order fields to `OrderStatus::None`
    pub fn clear_order(&mut self) {
        self.order_id = None;
        self.client_order_id = None;
        self.order_side = None;
        self.order_status = OrderStatus::None;
        self.order_price = 0.0;
        self.order_quantity = 0.0;
        self.order_filled_qty = 0.0;
        self.order_created_at = None;
        self.cancel_requested_at = None;
    }

    /// Add executed buy quantity to the position
    pub fn add_position(&mut self, qty: f64) {
        self.position_qty += qty;
        if self.position_qty > QTY_EPSILON {
            self.position_status = PositionStatus::Filled;
        }
    }

    /// Remove executed sell quantity from the position, returning what was removed
    pub fn reduce_position(&mut self, qty: f64) -> f64 {
        let removed = qty.min(self.position_qty).max(0.0);
        self.position_qty -= removed;
        if self.position_qty <= QTY_EPSILON {
            self.position_qty = 0.0;
            self.position_status = PositionStatus::Empty;
        }
        removed
    }

    /// Drop the whole position (reconciliation correction)
    pub fn clear_position(&mut self) -> f64 {
        let cleared = self.position_qty;
        self.position_qty = 0.0;
        self.position_status = PositionStatus::Empty;
        cleared
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            key: self.key,
            price: self.price,
            slot_status: self.slot_status,
            order_id: self.order_id.clone(),
            client_order_id: self.client_order_id.clone(),
            order_side: self.order_side,
            order_status: self.order_status,
            order_price: self.order_price,
            order_quantity: self.order_quantity,
            order_filled_qty: self.order_filled_qty,
            position_status: self.position_status,
            position_qty: self.position_qty,
            order_created_at: self.order_created_at,
        }
    }
}

/// Read-only copy of a slot handed to the reconciler and to exports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub key: i64,
    pub price: f64,
    pub slot_status: SlotStatus,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub order_side: Option<Side>,
    pub order_status: OrderStatus,
    pub order_price: f64,
    pub order_quantity: f64,
    pub order_filled_qty: f64,
    pub position_status: PositionStatus,
    pub position_qty: f64,
    pub order_created_at: Option<DateTime<Utc>>,
}

impl SlotSnapshot {
    pub fn has_active_order(&self, side: Side) -> bool {
        self.order_side == Some(side) && self.order_status.is_active()
    }
}

// =============================================================================
// Aggregates
// =============================================================================

/// Lifetime counters kept by the ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub total_buy_qty: f64,
    pub total_sell_qty: f64,
    /// Sum of sell fills times the grid interval
    pub estimated_profit: f64,
}

/// Result of a forced position sync
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForceSyncOutcome {
    pub slots_cleared: usize,
    pub qty_cleared: f64,
    pub orders_canceled: usize,
    /// Locked slots left for the next round
    pub skipped_locked: usize,
}

/// Narrow view of the ledger used by the reconciler
///
/// The reconciler reads slots through snapshots and has exactly one way to
/// write back: [`SlotSource::force_sync_positions`].
#[async_trait]
pub trait SlotSource: Send + Sync {
    /// Visit a snapshot of every slot. No slot lock is held while `visit` runs.
    fn iterate_slots(&self, visit: &mut dyn FnMut(&SlotSnapshot));

    fn totals(&self) -> LedgerTotals;

    /// Reset held quantity to what the exchange reports
    async fn force_sync_positions(&self, exchange_qty: f64) -> ForceSyncOutcome;
}

// =============================================================================
// Grid geometry
// =============================================================================

/// Price grid anchored at the initialization price
///
/// Slot `k` sits at `anchor + k * interval`; keys below the anchor are negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    pub anchor: f64,
    pub interval: f64,
    pub price_decimals: u32,
}

impl GridSpec {
    pub fn new(anchor: f64, interval: f64, price_decimals: u32) -> Self {
        Self {
            anchor,
            interval,
            price_decimals,
        }
    }

    /// Price of grid level `key`
    pub fn price_at(&self, key: i64) -> f64 {
        round_to(self.anchor + key as f64 * self.interval, self.price_decimals)
    }

    /// Highest grid level strictly below `price`
    pub fn key_below(&self, price: f64) -> i64 {
        let raw = (price - self.anchor) / self.interval;
        (raw - 1e-9).ceil() as i64 - 1
    }
}

/// Round `value` to `decimals` places
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Number of digits after the decimal point in a numeric string
///
/// "50000.00" -> 2, "0.0010" -> 4, "42" -> 0
pub fn decimals_of(s: &str) -> u32 {
    match s.trim().split_once('.') {
        Some((_, frac)) => frac.chars().take_while(|c| c.is_ascii_digit()).count() as u32,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_prices() {
        let grid = GridSpec::new(50000.0, 100.0, 2);
        assert_eq!(grid.price_at(0), 50000.0);
        assert_eq!(grid.price_at(-1), 49900.0);
        assert_eq!(grid.price_at(3), 50300.0);
    }

    #[test]
    fn test_key_below_on_and_off_grid() {
        let grid = GridSpec::new(100.0, 0.5, 2);
        // exactly on a grid level: that level is not below
        assert_eq!(grid.key_below(100.0), -1);
        assert_eq!(grid.key_below(101.0), 1);
        // between levels
        assert_eq!(grid.key_below(100.2), 0);
        assert_eq!(grid.key_below(99.9), -1);
    }

    #[test]
    fn test_key_below_tolerates_float_noise() {
        let grid = GridSpec::new(0.3, 0.1, 4);
        // 0.1 + 0.2 style noise must not move the level
        assert_eq!(grid.key_below(0.1 + 0.2 + 0.1), 0);
    }

    #[test]
    fn test_decimals_of() {
        assert_eq!(decimals_of("50000.00"), 2);
        assert_eq!(decimals_of("0.0010"), 4);
        assert_eq!(decimals_of("42"), 0);
        assert_eq!(decimals_of(" 1.5 "), 1);
    }

    #[test]
    fn test_position_invariant() {
        let mut slot = Slot::new(-1, 49900.0);
        assert_eq!(slot.position_status, PositionStatus::Empty);

        slot.add_position(0.01);
        assert_eq!(slot.position_status, PositionStatus::Filled);
        assert!(slot.position_qty > 0.0);

        let removed = slot.reduce_position(0.02);
        assert_eq!(removed, 0.01);
        assert_eq!(slot.position_status, PositionStatus::Empty);
        assert_eq!(slot.position_qty, 0.0);
    }

    #[test]
    fn test_stale_unlock_is_ignored() {
        let mut slot = Slot::new(0, 100.0);
        let first = slot.lock();
        slot.unlock();
        let second = slot.lock();

        // completion of the first intent must not release the second
        assert!(!slot.unlock_if(first));
        assert!(slot.is_locked());
        assert!(slot.unlock_if(second));
        assert!(!slot.is_locked());
    }
}
