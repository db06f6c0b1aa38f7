//! Broker API surface
//!
//! The engines consume only this trait; the live implementation is
//! [`crate::KotakNeoClient`]. Every operation is idempotent at the call
//! level and runs under the pipeline protections.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use neodip_core::config::Credentials;
use neodip_core::errors::Result;
use neodip_core::models::{BrokerOrder, Holding, OrderAck, OrderRequest, Quote};
use std::collections::HashMap;

/// Session credentials bundle returned by a successful login.
/// Valid for the trading day but may be revoked at any time; never
/// persisted across a process restart.
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub session_id: String,
    pub jwt: String,
    pub issued_at: DateTime<Utc>,
}

/// Trading symbol -> websocket instrument token
pub type ScripTable = HashMap<String, String>;

/// Narrow broker interface the engine depends on
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Authenticate and return a fresh session token
    async fn login(&self, credentials: &Credentials) -> Result<SessionToken>;

    /// Current demat holdings
    async fn holdings(&self) -> Result<Vec<Holding>>;

    /// Today's order book
    async fn orders(&self) -> Result<Vec<BrokerOrder>>;

    /// Single-order status refresh
    async fn order_status(&self, order_id: &str) -> Result<BrokerOrder>;

    /// Place a new order; the ack carries the broker order id
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    /// Revise price/qty on a working order
    async fn modify_order(
        &self,
        order_id: &str,
        price: Option<f64>,
        qty: Option<u32>,
    ) -> Result<OrderAck>;

    /// Cancel a working order. Cancelling an already-cancelled order acks
    /// as a no-op.
    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// LTP and average volume snapshot for one symbol
    async fn quote(&self, trading_symbol: &str) -> Result<Quote>;

    /// Available cash limit for new buys
    async fn limits(&self) -> Result<f64>;

    /// Instrument metadata table, refreshed daily
    async fn scrip_master(&self) -> Result<ScripTable>;
}
