//! Shared test doubles: a scriptable broker and market data source

use async_trait::async_trait;
use neodip_core::config::Credentials;
use neodip_core::errors::{Error, Result};
use neodip_core::models::{
    BrokerOrder, Candle, Fundamentals, Holding, IndicatorSnapshot, Interval, OrderAck,
    OrderRequest, OrderStatus, OrderType, PriceSource, Quote,
};
use neodip_core::symbols;
use neodip_networking::api::{BrokerApi, ScripTable, SessionToken};
use neodip_networking::market::MarketData;
use neodip_networking::{CallPipeline, CircuitBreaker, RateLimiter, RetryPolicy, SessionGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory broker. Placed orders land in the book with a configurable
/// status so tests can model instant fills, resting limits, and rejects.
pub struct MockBroker {
    pub holdings: Mutex<Vec<Holding>>,
    pub book: Mutex<Vec<BrokerOrder>>,
    pub cash: Mutex<f64>,
    pub quotes: Mutex<HashMap<String, Quote>>,
    pub placed: Mutex<Vec<OrderRequest>>,
    pub cancelled: Mutex<Vec<String>>,
    pub login_calls: AtomicUsize,
    next_id: AtomicUsize,
    /// Status newly placed market orders get (default: instantly complete)
    pub market_fill_status: Mutex<OrderStatus>,
    /// When set, place_order fails with a transient error
    pub fail_placement: AtomicBool,
    /// When set, cancel_order fails with a transient error
    pub fail_cancel: AtomicBool,
}

impl MockBroker {
    pub fn new(cash: f64) -> Self {
        Self {
            holdings: Mutex::new(Vec::new()),
            book: Mutex::new(Vec::new()),
            cash: Mutex::new(cash),
            quotes: Mutex::new(HashMap::new()),
            placed: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            login_calls: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
            market_fill_status: Mutex::new(OrderStatus::Complete),
            fail_placement: AtomicBool::new(false),
            fail_cancel: AtomicBool::new(false),
        }
    }

    pub fn set_quote(&self, symbol: &str, ltp: f64, avg_volume: Option<f64>) {
        self.quotes.lock().unwrap().insert(
            symbol.to_string(),
            Quote { ltp, avg_volume },
        );
    }

    pub fn add_holding(&self, symbol: &str, qty: u32, avg_price: f64) {
        self.holdings.lock().unwrap().push(Holding {
            trading_symbol: symbol.to_string(),
            qty,
            avg_price,
        });
    }

    pub fn add_order(&self, order: BrokerOrder) {
        self.book.lock().unwrap().push(order);
    }

    pub fn set_order_status(&self, order_id: &str, status: OrderStatus, exec_price: Option<f64>) {
        let mut book = self.book.lock().unwrap();
        if let Some(order) = book.iter_mut().find(|o| o.order_id == order_id) {
            order.status = status;
            if exec_price.is_some() {
                order.exec_price = exec_price;
            }
        }
    }

    pub fn placed_count(&self) -> usize {
        self.placed.lock().unwrap().len()
    }

    pub fn last_placed(&self) -> Option<OrderRequest> {
        self.placed.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl BrokerApi for MockBroker {
    async fn login(&self, _credentials: &Credentials) -> Result<SessionToken> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        Ok(SessionToken {
            session_id: "sess-test".into(),
            jwt: "jwt-test".into(),
            issued_at: chrono::Utc::now(),
        })
    }

    async fn holdings(&self) -> Result<Vec<Holding>> {
        Ok(self.holdings.lock().unwrap().clone())
    }

    async fn orders(&self) -> Result<Vec<BrokerOrder>> {
        Ok(self.book.lock().unwrap().clone())
    }

    async fn order_status(&self, order_id: &str) -> Result<BrokerOrder> {
        self.book
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.order_id == order_id)
            .cloned()
            .ok_or_else(|| Error::NoData(format!("order {} not in book", order_id)))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        if self.fail_placement.load(Ordering::SeqCst) {
            return Err(Error::Transient("placement unavailable".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let order_id = format!("ORD-{}", id);
        let status = match request.order_type {
            OrderType::Market => *self.market_fill_status.lock().unwrap(),
            OrderType::Limit => OrderStatus::Open,
        };
        let exec_price = if status == OrderStatus::Complete {
            request.price.or_else(|| {
                self.quotes
                    .lock()
                    .unwrap()
                    .get(&request.trading_symbol)
                    .map(|q| q.ltp)
            })
        } else {
            None
        };
        self.book.lock().unwrap().push(BrokerOrder {
            order_id: order_id.clone(),
            trading_symbol: request.trading_symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            price: request.price,
            qty: request.qty,
            status,
            exec_price,
            placed_at: Some(chrono::Utc::now()),
        });
        self.placed.lock().unwrap().push(request.clone());
        Ok(OrderAck { order_id })
    }

    async fn modify_order(
        &self,
        order_id: &str,
        price: Option<f64>,
        qty: Option<u32>,
    ) -> Result<OrderAck> {
        let mut book = self.book.lock().unwrap();
        let order = book
            .iter_mut()
            .find(|o| o.order_id == order_id)
            .ok_or_else(|| Error::BrokerReject(format!("order {} unknown", order_id)))?;
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
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(Error::Transient("cancel unavailable".into()));
        }
        self.cancelled.lock().unwrap().push(order_id.to_string());
        let mut book = self.book.lock().unwrap();
        if let Some(order) = book.iter_mut().find(|o| o.order_id == order_id) {
            // cancelling a dead order is a no-op ack
            if order.status.is_live() {
                order.status = OrderStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn quote(&self, trading_symbol: &str) -> Result<Quote> {
        self.quotes
            .lock()
            .unwrap()
            .iter()
            .find(|(symbol, _)| symbols::same_instrument(symbol, trading_symbol))
            .map(|(_, quote)| quote.clone())
            .ok_or_else(|| Error::NoData(format!("no quote for {}", trading_symbol)))
    }

    async fn limits(&self) -> Result<f64> {
        Ok(*self.cash.lock().unwrap())
    }

    async fn scrip_master(&self) -> Result<ScripTable> {
        Ok(ScripTable::new())
    }
}

/// Scripted market data: fixed snapshots and prices keyed by base ticker
#[derive(Default)]
pub struct ScriptedMarket {
    pub snapshots: Mutex<HashMap<String, IndicatorSnapshot>>,
    pub prices: Mutex<HashMap<String, f64>>,
}

impl ScriptedMarket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_snapshot(&self, ticker: &str, snapshot: IndicatorSnapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(ticker.to_uppercase(), snapshot);
    }

    pub fn set_price(&self, ticker: &str, price: f64) {
        self.prices
            .lock()
            .unwrap()
            .insert(ticker.to_uppercase(), price);
    }
}

pub fn snapshot(rsi10: f64, close: f64, ema9: f64, ema200: f64) -> IndicatorSnapshot {
    IndicatorSnapshot {
        close,
        rsi10,
        ema9,
        ema200,
        price_source: PriceSource::Websocket,
    }
}

#[async_trait]
impl MarketData for ScriptedMarket {
    async fn fetch_ohlcv(
        &self,
        ticker: &str,
        _interval: Interval,
        _years: u32,
        _min_bars: usize,
    ) -> Result<Vec<Candle>> {
        Err(Error::NoData(format!("no scripted bars for {}", ticker)))
    }

    async fn fetch_fundamentals(&self, _ticker: &str) -> Result<Fundamentals> {
        Ok(Fundamentals::default())
    }

    async fn ltp_with_fallback(
        &self,
        trading_symbol: &str,
        ticker: &str,
    ) -> Result<(f64, PriceSource)> {
        let key = symbols::base_ticker(ticker).to_uppercase();
        self.prices
            .lock()
            .unwrap()
            .get(&key)
            .map(|p| (*p, PriceSource::Websocket))
            .ok_or_else(|| Error::NoData(format!("no scripted price for {}", trading_symbol)))
    }

    async fn indicator_snapshot(
        &self,
        ticker: &str,
        _trading_symbol: &str,
    ) -> Result<IndicatorSnapshot> {
        let key = symbols::base_ticker(ticker).to_uppercase();
        self.snapshots
            .lock()
            .unwrap()
            .get(&key)
            .copied()
            .ok_or_else(|| Error::InsufficientData {
                ticker: ticker.to_string(),
                got: 0,
                need: 200,
            })
    }
}

pub fn test_credentials() -> Credentials {
    Credentials {
        mobile_number: "+911111111111".into(),
        password: "pw".into(),
        mpin: "000000".into(),
        consumer_key: "ck".into(),
    }
}

/// A pipeline with no pacing delay wired to the given broker
pub fn fast_pipeline(broker: Arc<MockBroker>) -> Arc<CallPipeline> {
    let session = Arc::new(SessionGuard::new(
        broker,
        test_credentials(),
        Arc::new(tokio::sync::RwLock::new(None)),
    ));
    Arc::new(CallPipeline::new(
        Arc::new(RateLimiter::new(Duration::ZERO)),
        Arc::new(CircuitBreaker::default()),
        RetryPolicy::new(1, Duration::from_millis(1)),
        session,
        Duration::from_secs(5),
    ))
}
