//! Reconciliation audit record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of reconciliation history, persisted by the storage collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileRecord {
    pub symbol: String,
    pub reconcile_time: DateTime<Utc>,
    pub local_position: f64,
    pub exchange_position: f64,
    pub position_diff: f64,
    pub active_buy_orders: u32,
    pub active_sell_orders: u32,
    pub pending_sell_qty: f64,
    pub total_buy_qty: f64,
    pub total_sell_qty: f64,
    pub estimated_profit: f64,
}
