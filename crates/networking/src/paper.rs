//! Paper broker: simulated order execution over real market data
//!
//! Wraps the live client: logins, holdings, quotes, and the scrip master
//! pass through, while orders land in an in-memory book instead of the
//! exchange. Market orders fill instantly at the last quoted price; limit
//! orders rest open. Lets a dry run exercise the full lifecycle against
//! real data without moving money.

use crate::api::{BrokerApi, ScripTable, SessionToken};
use async_trait::async_trait;
use chrono::Utc;
use neodip_core::config::Credentials;
use neodip_core::errors::{Error, Result};
use neodip_core::models::{
    BrokerOrder, Holding, OrderAck, OrderRequest, OrderStatus, OrderType, Quote,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

pub struct PaperBroker {
    inner: Arc<dyn BrokerApi>,
    book: Mutex<Vec<BrokerOrder>>,
    /// Simulated cash balance, drawn down by simulated buys
    cash: Mutex<f64>,
    next_id: AtomicU64,
}

impl PaperBroker {
    pub fn new(inner: Arc<dyn BrokerApi>, starting_cash: f64) -> Self {
        info!("paper trading enabled, starting cash {:.0}", starting_cash);
        Self {
            inner,
            book: Mutex::new(Vec::new()),
            cash: Mutex::new(starting_cash),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_order_id(&self) -> String {
        format!("PAPER-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Price a market order off the live quote; limit orders use their price
    async fn fill_price(&self, request: &OrderRequest) -> Option<f64> {
        match request.order_type {
            OrderType::Limit => request.price,
            OrderType::Market => self
                .inner
                .quote(&request.trading_symbol)
                .await
                .ok()
                .map(|q| q.ltp),
        }
    }
}

#[async_trait]
impl BrokerApi for PaperBroker {
    async fn login(&self, credentials: &Credentials) -> Result<SessionToken> {
        self.inner.login(credentials).await
    }

    async fn holdings(&self) -> Result<Vec<Holding>> {
        self.inner.holdings().await
    }

    async fn orders(&self) -> Result<Vec<BrokerOrder>> {
        Ok(self.book.lock().expect("book lock").clone())
    }

    async fn order_status(&self, order_id: &str) -> Result<BrokerOrder> {
        self.book
            .lock()
            .expect("book lock")
            .iter()
            .find(|o| o.order_id == order_id)
            .cloned()
            .ok_or_else(|| Error::NoData(format!("order {} not in paper book", order_id)))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let order_id = self.next_order_id();
        let (status, exec_price) = match request.order_type {
            OrderType::Market => {
                let price = self.fill_price(request).await;
                (OrderStatus::Complete, price)
            }
            OrderType::Limit => (OrderStatus::Open, None),
        };

        if status == OrderStatus::Complete {
            if let Some(price) = exec_price {
                let mut cash = self.cash.lock().expect("cash lock");
                let value = price * request.qty as f64;
                match request.side {
                    neodip_core::models::OrderSide::Buy => *cash -= value,
                    neodip_core::models::OrderSide::Sell => *cash += value,
                }
            }
        }

        debug!(
            "paper order {}: {:?} {:?} {} x{} -> {:?}",
            order_id, request.side, request.order_type, request.trading_symbol, request.qty, status
        );
        self.book.lock().expect("book lock").push(BrokerOrder {
            order_id: order_id.clone(),
            trading_symbol: request.trading_symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            price: request.price,
            qty: request.qty,
            status,
            exec_price,
            placed_at: Some(Utc::now()),
        });
        Ok(OrderAck { order_id })
    }

    async fn modify_order(
        &self,
        order_id: &str,
        price: Option<f64>,
        qty: Option<u32>,
    ) -> Result<OrderAck> {
        let mut book = self.book.lock().expect("book lock");
        let order = book
            .iter_mut()
            .find(|o| o.order_id == order_id && o.status.is_live())
            .ok_or_else(|| Error::BrokerReject(format!("order {} not open", order_id)))?;
        if let Some(price) = price {
            order.price = Some(price);
        }
        if let Some(qty) = qty {
            order.qty = qty;
        }
        Ok(OrderAck {
            order_id: order_id.to_string(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut book = self.book.lock().expect("book lock");
        match book.iter_mut().find(|o| o.order_id == order_id) {
            Some(order) if order.status.is_live() => {
                order.status = OrderStatus::Cancelled;
                Ok(())
            }
            // cancelling a dead or unknown order acks as a no-op
            _ => Ok(()),
        }
    }

    async fn quote(&self, trading_symbol: &str) -> Result<Quote> {
        self.inner.quote(trading_symbol).await
    }

    async fn limits(&self) -> Result<f64> {
        Ok(*self.cash.lock().expect("cash lock"))
    }

    async fn scrip_master(&self) -> Result<ScripTable> {
        self.inner.scrip_master().await
    }
}
