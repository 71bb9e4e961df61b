//! Account, position and market data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exchange-reported position for one symbol
///
/// `size` is signed: positive for long, negative for short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub size: f64,
    pub entry_price: f64,
    pub leverage: f64,
    pub unrealized_pnl: f64,
}

/// Account-level summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub total_wallet_balance: f64,
    pub available_balance: f64,
    pub total_unrealized_pnl: f64,
    pub can_trade: bool,
}

/// Top-of-book price update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub time: DateTime<Utc>,
}

impl PriceTick {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// OHLCV candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub interval: String,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Candle is final (no further updates for this open_time)
    pub closed: bool,
}

/// Current funding rate for a perpetual contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRate {
    pub symbol: String,
    pub rate: f64,
    pub next_funding_time: DateTime<Utc>,
}
