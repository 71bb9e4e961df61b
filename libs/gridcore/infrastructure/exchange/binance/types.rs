//! Binance USDⓈ-M futures wire types
//!
//! Numbers arrive as strings; conversions into domain types happen here.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::domain::{
    decimals_of, Account, FundingRate, Kline, Order, OrderStatus, OrderType, OrderUpdate,
    Position, PriceTick, Side,
};
use crate::infrastructure::exchange::error::{ExchangeError, Result};

pub(crate) fn parse_num(s: &str) -> f64 {
    s.trim().parse::<f64>().unwrap_or(0.0)
}

pub(crate) fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

/// Decimal places implied by a tick or step size ("0.10" -> 1)
pub fn step_decimals(step: &str) -> u32 {
    let step = step.trim();
    if !step.contains('.') {
        return 0;
    }
    decimals_of(step.trim_end_matches('0'))
}

fn parse_side(s: &str) -> Result<Side> {
    s.parse::<Side>()
        .map_err(|e| ExchangeError::DeserializeFailed(e.to_string()))
}

/// Conditional types (STOP, TAKE_PROFIT, ...) never come from the grid and
/// are treated as limit orders
fn parse_order_type(s: &str) -> OrderType {
    s.parse().unwrap_or(OrderType::Limit)
}

fn parse_status(s: &str) -> Result<OrderStatus> {
    OrderStatus::from_exchange(s)
        .ok_or_else(|| ExchangeError::DeserializeFailed(format!("unknown order status {}", s)))
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

// =============================================================================
// Exchange info
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default)]
    pub price_precision: u32,
    #[serde(default)]
    pub quantity_precision: u32,
    #[serde(default)]
    pub filters: Vec<serde_json::Value>,
}

impl SymbolInfo {
    fn filter_field(&self, filter_type: &str, field: &str) -> Option<String> {
        self.filters
            .iter()
            .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some(filter_type))
            .and_then(|f| f.get(field))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Price decimals from PRICE_FILTER.tickSize, falling back to pricePrecision
    pub fn price_decimals(&self) -> u32 {
        self.filter_field("PRICE_FILTER", "tickSize")
            .map(|s| step_decimals(&s))
            .unwrap_or(self.price_precision)
    }

    /// Quantity decimals from LOT_SIZE.stepSize, falling back to quantityPrecision
    pub fn quantity_decimals(&self) -> u32 {
        self.filter_field("LOT_SIZE", "stepSize")
            .map(|s| step_decimals(&s))
            .unwrap_or(self.quantity_precision)
    }
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub client_order_id: String,
    pub symbol: String,
    pub status: String,
    pub price: String,
    pub orig_qty: String,
    #[serde(default)]
    pub executed_qty: String,
    pub side: String,
    #[serde(rename = "type")]
    pub order_type: String,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub update_time: Option<i64>,
}

impl OrderResponse {
    pub fn into_order(self) -> Result<Order> {
        let created_ms = self.time.or(self.update_time).unwrap_or_default();
        Ok(Order {
            order_id: self.order_id.to_string(),
            client_order_id: self.client_order_id,
            symbol: self.symbol,
            side: parse_side(&self.side)?,
            order_type: parse_order_type(&self.order_type),
            status: parse_status(&self.status)?,
            price: parse_num(&self.price),
            quantity: parse_num(&self.orig_qty),
            executed_qty: parse_num(&self.executed_qty),
            created_at: if created_ms > 0 {
                ms_to_datetime(created_ms)
            } else {
                Utc::now()
            },
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ListenKeyResponse {
    #[serde(rename = "listenKey")]
    pub listen_key: String,
}

// =============================================================================
// Account
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    pub position_amt: String,
    pub entry_price: String,
    #[serde(default)]
    pub leverage: String,
    #[serde(rename = "unRealizedProfit", default)]
    pub unrealized_profit: String,
}

impl From<PositionRisk> for Position {
    fn from(p: PositionRisk) -> Self {
        Position {
            symbol: p.symbol,
            size: parse_num(&p.position_amt),
            entry_price: parse_num(&p.entry_price),
            leverage: parse_num(&p.leverage),
            unrealized_pnl: parse_num(&p.unrealized_profit),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub total_wallet_balance: String,
    pub available_balance: String,
    pub total_unrealized_profit: String,
    #[serde(default = "default_can_trade")]
    pub can_trade: bool,
}

fn default_can_trade() -> bool {
    true
}

impl From<AccountResponse> for Account {
    fn from(a: AccountResponse) -> Self {
        Account {
            total_wallet_balance: parse_num(&a.total_wallet_balance),
            available_balance: parse_num(&a.available_balance),
            total_unrealized_pnl: parse_num(&a.total_unrealized_profit),
            can_trade: a.can_trade,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceEntry {
    pub asset: String,
    pub balance: String,
    pub available_balance: String,
}

// =============================================================================
// Market data
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumIndex {
    pub symbol: String,
    pub last_funding_rate: String,
    pub next_funding_time: i64,
}

impl From<PremiumIndex> for FundingRate {
    fn from(p: PremiumIndex) -> Self {
        FundingRate {
            symbol: p.symbol,
            rate: parse_num(&p.last_funding_rate),
            next_funding_time: ms_to_datetime(p.next_funding_time),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    pub price: String,
}

/// One row of `/fapi/v1/klines`:
/// `[openTime, open, high, low, close, volume, closeTime, ...]`
pub fn kline_from_row(symbol: &str, interval: &str, row: &[serde_json::Value]) -> Result<Kline> {
    if row.len() < 7 {
        return Err(ExchangeError::DeserializeFailed(format!(
            "kline row has {} fields",
            row.len()
        )));
    }

    let num = |v: &serde_json::Value| match v {
        serde_json::Value::String(s) => parse_num(s),
        other => other.as_f64().unwrap_or(0.0),
    };
    let ms = |v: &serde_json::Value| v.as_i64().unwrap_or_default();

    Ok(Kline {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        open_time: ms_to_datetime(ms(&row[0])),
        close_time: ms_to_datetime(ms(&row[6])),
        open: num(&row[1]),
        high: num(&row[2]),
        low: num(&row[3]),
        close: num(&row[4]),
        volume: num(&row[5]),
        closed: true,
    })
}

// =============================================================================
// WebSocket events
// =============================================================================

/// User data stream envelope; only the fields we route on
#[derive(Debug, Deserialize)]
pub struct UserEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "o", default)]
    pub order: Option<OrderTradeUpdate>,
}

#[derive(Debug, Deserialize)]
pub struct OrderTradeUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub client_order_id: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "o")]
    pub order_type: String,
    #[serde(rename = "q")]
    pub quantity: String,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "ap", default)]
    pub avg_price: String,
    #[serde(rename = "X")]
    pub status: String,
    #[serde(rename = "i")]
    pub order_id: i64,
    /// Cumulative filled quantity
    #[serde(rename = "z", default)]
    pub cum_filled_qty: String,
    #[serde(rename = "T", default)]
    pub trade_time: i64,
}

impl OrderTradeUpdate {
    pub fn into_update(self) -> Result<OrderUpdate> {
        Ok(OrderUpdate {
            order_id: self.order_id.to_string(),
            client_order_id: self.client_order_id,
            symbol: self.symbol,
            side: parse_side(&self.side)?,
            order_type: parse_order_type(&self.order_type),
            status: parse_status(&self.status)?,
            price: parse_num(&self.price),
            quantity: parse_num(&self.quantity),
            executed_qty: parse_num(&self.cum_filled_qty),
            avg_price: parse_num(&self.avg_price),
            update_time: if self.trade_time > 0 {
                ms_to_datetime(self.trade_time)
            } else {
                Utc::now()
            },
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct BookTicker {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b")]
    pub bid: String,
    #[serde(rename = "a")]
    pub ask: String,
    #[serde(rename = "T", default)]
    pub transaction_time: i64,
}

impl From<BookTicker> for PriceTick {
    fn from(t: BookTicker) -> Self {
        PriceTick {
            symbol: t.symbol,
            bid: parse_num(&t.bid),
            ask: parse_num(&t.ask),
            time: if t.transaction_time > 0 {
                ms_to_datetime(t.transaction_time)
            } else {
                Utc::now()
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
pub struct KlinePayload {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "x")]
    pub closed: bool,
}

impl From<KlineEvent> for Kline {
    fn from(e: KlineEvent) -> Self {
        Kline {
            symbol: e.symbol,
            interval: e.kline.interval,
            open_time: ms_to_datetime(e.kline.open_time),
            close_time: ms_to_datetime(e.kline.close_time),
            open: parse_num(&e.kline.open),
            high: parse_num(&e.kline.high),
            low: parse_num(&e.kline.low),
            close: parse_num(&e.kline.close),
            volume: parse_num(&e.kline.volume),
            closed: e.kline.closed,
        }
    }
}
