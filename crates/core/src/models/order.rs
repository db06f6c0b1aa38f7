//! Broker order and holdings models
//!
//! Wire enums serialize to the UPPERCASE tokens the broker API expects.
//! Order status strings coming back vary by endpoint, so parsing is lenient
//! and unknown strings land in `OrderStatus::Unknown` rather than failing
//! the whole order-book fetch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Buy or sell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Market or limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

/// Regular intraday-session order vs after-market order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderVariety {
    Regular,
    Amo,
}

/// Broker order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    Complete,
    Rejected,
    Cancelled,
    Unknown,
}

impl OrderStatus {
    /// Lenient mapping from the broker's status strings
    pub fn parse_lenient(raw: &str) -> OrderStatus {
        match raw.trim().to_lowercase().as_str() {
            "pending" | "put order req received" | "validation pending" | "trigger pending" => {
                OrderStatus::Pending
            }
            "open" | "open pending" | "modified" | "modify pending" => OrderStatus::Open,
            "complete" | "completed" | "traded" | "executed" | "filled" => OrderStatus::Complete,
            "rejected" => OrderStatus::Rejected,
            "cancelled" | "canceled" | "cancelled amo" | "cancel pending" => OrderStatus::Cancelled,
            _ => OrderStatus::Unknown,
        }
    }

    /// An order that can still fill (counts as a live order)
    pub fn is_live(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Open)
    }

    /// Terminal states that will never fill further
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Complete | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }
}

/// Outbound order placement request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub trading_symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub variety: OrderVariety,
    pub qty: u32,
    /// Limit price; None for market orders
    #[serde(default)]
    pub price: Option<f64>,
    /// Delivery product for cash equities
    pub product: String,
}

impl OrderRequest {
    pub fn market_buy(trading_symbol: &str, qty: u32, variety: OrderVariety) -> Self {
        Self {
            trading_symbol: trading_symbol.to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            variety,
            qty,
            price: None,
            product: "CNC".to_string(),
        }
    }

    pub fn limit_sell(trading_symbol: &str, qty: u32, price: f64) -> Self {
        Self {
            trading_symbol: trading_symbol.to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            variety: OrderVariety::Regular,
            qty,
            price: Some(price),
            product: "CNC".to_string(),
        }
    }

    pub fn market_sell(trading_symbol: &str, qty: u32) -> Self {
        Self {
            trading_symbol: trading_symbol.to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            variety: OrderVariety::Regular,
            qty,
            price: None,
            product: "CNC".to_string(),
        }
    }
}

/// Broker acknowledgement of a placed/modified order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

/// Cached subset of a broker order-book row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub order_id: String,
    pub trading_symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<f64>,
    pub qty: u32,
    pub status: OrderStatus,
    /// Average execution price, present once (partially) filled
    #[serde(default)]
    pub exec_price: Option<f64>,
    #[serde(default)]
    pub placed_at: Option<DateTime<Utc>>,
}

/// One demat holding row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub trading_symbol: String,
    pub qty: u32,
    pub avg_price: f64,
}
