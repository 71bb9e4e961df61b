//! Row types for the audit tables

use chrono::{DateTime, Utc};

use crate::domain::ReconcileRecord;

/// `reconciliation_history` row. Times are stored as RFC 3339 text.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DbReconcileRecord {
    pub id: i64,
    pub symbol: String,
    pub reconcile_time: String,
    pub local_position: f64,
    pub exchange_position: f64,
    pub position_diff: f64,
    pub active_buy_orders: i32,
    pub active_sell_orders: i32,
    pub pending_sell_qty: f64,
    pub total_buy_qty: f64,
    pub total_sell_qty: f64,
    pub estimated_profit: f64,
}

impl DbReconcileRecord {
    /// Convert back to the domain record. Rows with an unparseable time
    /// are returned with the Unix epoch.
    pub fn into_record(self) -> ReconcileRecord {
        let reconcile_time = DateTime::parse_from_rfc3339(&self.reconcile_time)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default();

        ReconcileRecord {
            symbol: self.symbol,
            reconcile_time,
            local_position: self.local_position,
            exchange_position: self.exchange_position,
            position_diff: self.position_diff,
            active_buy_orders: self.active_buy_orders.max(0) as u32,
            active_sell_orders: self.active_sell_orders.max(0) as u32,
            pending_sell_qty: self.pending_sell_qty,
            total_buy_qty: self.total_buy_qty,
            total_sell_qty: self.total_sell_qty,
            estimated_profit: self.estimated_profit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_into_record() {
        let row = DbReconcileRecord {
            id: 7,
            symbol: "BTCUSDT".to_string(),
            reconcile_time: "2026-01-01T00:00:00+00:00".to_string(),
            local_position: 0.15,
            exchange_position: 0.0,
            position_diff: 0.15,
            active_buy_orders: 5,
            active_sell_orders: 2,
            pending_sell_qty: 0.002,
            total_buy_qty: 1.0,
            total_sell_qty: 0.85,
            estimated_profit: 85.0,
        };

        let record = row.into_record();
        assert_eq!(record.symbol, "BTCUSDT");
        assert_eq!(record.reconcile_time.to_rfc3339(), "2026-01-01T00:00:00+00:00");
        assert_eq!(record.active_buy_orders, 5);
        assert_eq!(record.position_diff, 0.15);
    }
}
