//! Normalized order types shared by every exchange adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// A side or order type string no variant matches
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

// =============================================================================
// Enums
// =============================================================================

/// Side of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl FromStr for Side {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err(ParseEnumError {
                kind: "side",
                value: s.to_string(),
            }),
        }
    }
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl FromStr for OrderType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LIMIT" => Ok(OrderType::Limit),
            "MARKET" => Ok(OrderType::Market),
            _ => Err(ParseEnumError {
                kind: "order type",
                value: s.to_string(),
            }),
        }
    }
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
        }
    }
}

/// Order lifecycle status
///
/// `None` means no order is associated with a slot. Exchange adapters map
/// their native status strings onto this set; the ledger drives the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    None,
    /// Submitted and acknowledged by the REST call
    Placed,
    /// Acknowledged by the order stream
    Confirmed,
    PartiallyFilled,
    Filled,
    CancelRequested,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Map an exchange status string (NEW, PARTIALLY_FILLED, ...) to a status
    pub fn from_exchange(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NEW" | "OPEN" | "LIVE" => Some(OrderStatus::Confirmed),
            "PARTIALLY_FILLED" | "PARTIAL" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "PENDING_CANCEL" => Some(OrderStatus::CancelRequested),
            "CANCELED" | "CANCELLED" => Some(OrderStatus::Canceled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "EXPIRED" | "EXPIRED_IN_MATCH" => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    /// Order is live on the exchange (counts against the one-order-per-slot rule)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Placed
                | OrderStatus::Confirmed
                | OrderStatus::PartiallyFilled
                | OrderStatus::CancelRequested
        )
    }

    /// Order reached the end of its cycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::None => "NONE",
            OrderStatus::Placed => "PLACED",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::CancelRequested => "CANCEL_REQUESTED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Requests and responses
// =============================================================================

/// A request to place one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: f64,
    pub quantity: f64,
    pub client_order_id: String,
    pub reduce_only: bool,
    pub post_only: bool,
}

impl OrderRequest {
    /// Good-till-cancel limit order
    pub fn limit(
        symbol: impl Into<String>,
        side: Side,
        price: f64,
        quantity: f64,
        client_order_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            price,
            quantity,
            client_order_id: client_order_id.into(),
            reduce_only: false,
            post_only: false,
        }
    }

    pub fn with_reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }

    pub fn with_post_only(mut self, post_only: bool) -> Self {
        self.post_only = post_only;
        self
    }
}

/// An order as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub price: f64,
    pub quantity: f64,
    pub executed_qty: f64,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Remaining unfilled quantity
    pub fn remaining_qty(&self) -> f64 {
        (self.quantity - self.executed_qty).max(0.0)
    }
}

/// Order update event delivered by an order stream
///
/// `executed_qty` is cumulative for the order, not the size of the last fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub price: f64,
    pub quantity: f64,
    pub executed_qty: f64,
    pub avg_price: f64,
    pub update_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_exchange() {
        assert_eq!(OrderStatus::from_exchange("NEW"), Some(OrderStatus::Confirmed));
        assert_eq!(
            OrderStatus::from_exchange("partially_filled"),
            Some(OrderStatus::PartiallyFilled)
        );
        assert_eq!(OrderStatus::from_exchange("CANCELLED"), Some(OrderStatus::Canceled));
        assert_eq!(OrderStatus::from_exchange("EXPIRED_IN_MATCH"), Some(OrderStatus::Expired));
        assert_eq!(OrderStatus::from_exchange("WHATEVER"), None);
    }

    #[test]
    fn test_active_and_terminal_are_disjoint() {
        let all = [
            OrderStatus::None,
            OrderStatus::Placed,
            OrderStatus::Confirmed,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::CancelRequested,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ];
        for status in all {
            assert!(!(status.is_active() && status.is_terminal()), "{}", status);
        }
        assert!(!OrderStatus::None.is_active());
        assert!(!OrderStatus::None.is_terminal());
    }

    #[test]
    fn test_side_parsing() {
        assert_eq!("buy".parse::<Side>(), Ok(Side::Buy));
        assert_eq!("SELL".parse::<Side>(), Ok(Side::Sell));
        let err = "hold".parse::<Side>().unwrap_err();
        assert_eq!(err.to_string(), "unknown side: hold");
    }

    #[test]
    fn test_order_type_parsing() {
        assert_eq!("limit".parse::<OrderType>(), Ok(OrderType::Limit));
        assert_eq!("MARKET".parse::<OrderType>(), Ok(OrderType::Market));
        assert!("STOP_MARKET".parse::<OrderType>().is_err());
        assert_eq!(OrderType::Market.as_str().parse::<OrderType>(), Ok(OrderType::Market));
    }
}
