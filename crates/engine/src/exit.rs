//! ExitEngine: EMA9 trailing sell orders
//!
//! Each open position carries at most one live sell order: a day limit at
//! the daily EMA9, re-evaluated against the live LTP every monitor cycle.
//! The limit only ever moves down (`lowest_ema9_seen` is the anchor) and
//! never below the safety floor relative to entry. Updates are strictly
//! cancel-then-place: a new order goes out only after the old one is
//! confirmed dead, otherwise a position could briefly carry two live sells.

use chrono::Utc;
use neodip_core::config::AgentConfig;
use neodip_core::errors::{EndpointClass, Error, Result};
use neodip_core::events::{NotificationEvent, Notifier};
use neodip_core::models::{
    BrokerOrder, ExitReason, OrderRequest, OrderStatus, OrderType, Position,
};
use neodip_networking::api::BrokerApi;
use neodip_networking::market::MarketData;
use neodip_networking::CallPipeline;
use neodip_persistence::TradeStore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cancel confirmation: how many status polls before giving up
const CANCEL_CONFIRM_POLLS: u32 = 3;
/// Pause between cancel confirmation polls
const CANCEL_CONFIRM_PAUSE: Duration = Duration::from_millis(500);
/// Cancel attempts are capped below the general retry budget; an
/// unconfirmed cancel must never be followed by a new order
const CANCEL_MAX_ATTEMPTS: u32 = 2;

/// Aggregate outcome of one monitor cycle
#[derive(Debug, Default)]
pub struct ExitSummary {
    pub placed: usize,
    pub updated: usize,
    pub closed: usize,
    pub skipped_below_floor: usize,
}

#[derive(Default)]
struct CycleCounters {
    placed: AtomicUsize,
    updated: AtomicUsize,
    closed: AtomicUsize,
    skipped_below_floor: AtomicUsize,
}

pub struct ExitEngine {
    store: Arc<TradeStore>,
    broker: Arc<dyn BrokerApi>,
    pipeline: Arc<CallPipeline>,
    market: Arc<dyn MarketData>,
    notifier: Arc<dyn Notifier>,
    config: Arc<AgentConfig>,
    /// Prevents the scheduler tick and the continuous trail loop from
    /// running two cycles at once
    cycle_lock: tokio::sync::Mutex<()>,
}

impl ExitEngine {
    pub fn new(
        store: Arc<TradeStore>,
        broker: Arc<dyn BrokerApi>,
        pipeline: Arc<CallPipeline>,
        market: Arc<dyn MarketData>,
        notifier: Arc<dyn Notifier>,
        config: Arc<AgentConfig>,
    ) -> Self {
        Self {
            store,
            broker,
            pipeline,
            market,
            notifier,
            config,
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Market-open pass: reconcile orders that finished overnight, then make
    /// sure every open position has its sell working (floor permitting).
    pub async fn place_open_sells(self: &Arc<Self>) -> Result<ExitSummary> {
        self.monitor_cycle().await
    }

    /// One monitor cycle over all open positions, fanned out to a bounded
    /// worker pool fed from a shared queue. If a cycle is already running
    /// this returns immediately.
    pub async fn monitor_cycle(self: &Arc<Self>) -> Result<ExitSummary> {
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            debug!("monitor cycle already in flight, skipping");
            return Ok(ExitSummary::default());
        };

        let positions = self.store.open_positions().await;
        if positions.is_empty() {
            return Ok(ExitSummary::default());
        }
        debug!("monitor cycle over {} positions", positions.len());

        let queue: Arc<Mutex<VecDeque<Position>>> =
            Arc::new(Mutex::new(positions.into_iter().collect()));
        let counters = Arc::new(CycleCounters::default());
        let workers = self.config.pacing.max_workers.max(1);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..workers {
            let engine = Arc::clone(self);
            let queue = queue.clone();
            let counters = counters.clone();
            tasks.spawn(async move {
                loop {
                    let next = queue.lock().expect("queue lock").pop_front();
                    let Some(position) = next else { break };
                    if let Err(e) = engine.process_position(&position, &counters).await {
                        warn!("exit pass failed for {}: {}", position.ticker, e);
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        Ok(ExitSummary {
            placed: counters.placed.load(Ordering::SeqCst),
            updated: counters.updated.load(Ordering::SeqCst),
            closed: counters.closed.load(Ordering::SeqCst),
            skipped_below_floor: counters.skipped_below_floor.load(Ordering::SeqCst),
        })
    }

    /// Wait for any in-flight cycle to finish, bounded. Used on shutdown.
    pub async fn drain(&self, deadline: Duration) -> bool {
        tokio::time::timeout(deadline, self.cycle_lock.lock())
            .await
            .is_ok()
    }

    /// One position through the exit state machine
    async fn process_position(&self, position: &Position, counters: &CycleCounters) -> Result<()> {
        // 1. reconcile the tracked sell order first; a fill that already
        //    happened must close the position, never spawn another order
        let mut live_order: Option<BrokerOrder> = None;
        if let Some(order_id) = &position.sell_order_id {
            match self.fetch_order(order_id).await {
                Ok(order) => match order.status {
                    OrderStatus::Complete => {
                        self.handle_completed_sell(position, &order, counters).await?;
                        return Ok(());
                    }
                    OrderStatus::Cancelled | OrderStatus::Rejected => {
                        self.store.set_sell_order(&position.ticker, None).await?;
                    }
                    _ => live_order = Some(order),
                },
                Err(Error::NoData(_)) => {
                    warn!(
                        "{}: tracked sell {} missing from book, clearing",
                        position.ticker, order_id
                    );
                    self.store.set_sell_order(&position.ticker, None).await?;
                }
                Err(e) => return Err(e),
            }
        }

        // 2. indicator state with the live price as a provisional bar
        let snapshot = match self
            .market
            .indicator_snapshot(&position.ticker, &position.trading_symbol)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(Error::InsufficientData { ticker, got, need }) => {
                info!("{}: {} of {} bars, exit check skipped", ticker, got, need);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // 3. RSI recovery exit (config-gated): cancel the limit and leave
        //    at market
        if self.config.strategy.exit_on_ema9_or_rsi50
            && snapshot.rsi10 >= self.config.strategy.rsi_exit
        {
            return self
                .exit_at_market(position, live_order.as_ref(), counters)
                .await;
        }

        // 4. EMA9 trail, monotone and floored
        let new_ema9 = snapshot.ema9;
        let floor = self.config.strategy.ema9_safety_floor * position.entry_price;

        match live_order {
            None => {
                if new_ema9 >= floor {
                    self.place_sell(position, new_ema9).await?;
                    counters.placed.fetch_add(1, Ordering::SeqCst);
                } else {
                    debug!(
                        "{}: skip_below_safety_floor (ema9 {:.2} < floor {:.2})",
                        position.ticker, new_ema9, floor
                    );
                    counters.skipped_below_floor.fetch_add(1, Ordering::SeqCst);
                }
            }
            Some(order) => {
                let lowest = position.lowest_ema9_seen.unwrap_or(f64::INFINITY);
                if new_ema9 < lowest && new_ema9 >= floor {
                    if self.cancel_confirmed(position, &order, counters).await? {
                        self.place_sell(position, new_ema9).await?;
                        counters.updated.fetch_add(1, Ordering::SeqCst);
                    }
                } else {
                    debug!(
                        "{}: holding sell at {:.2} (ema9 {:.2}, lowest seen {:.2})",
                        position.ticker,
                        order.price.unwrap_or_default(),
                        new_ema9,
                        lowest
                    );
                }
            }
        }
        Ok(())
    }

    /// Place the day limit sell and persist order id + trail anchor
    async fn place_sell(&self, position: &Position, ema9: f64) -> Result<()> {
        let price = round_to_tick(ema9);
        let request = OrderRequest::limit_sell(&position.trading_symbol, position.quantity, price);
        let order_id = self.place_order(&request).await?;
        self.store
            .set_sell_order(&position.ticker, Some(order_id.clone()))
            .await?;
        self.store.set_lowest_ema9(&position.ticker, ema9).await?;
        info!(
            "sell working: {} x{} @ {:.2} ({})",
            position.ticker, position.quantity, price, order_id
        );
        self.notifier
            .notify(NotificationEvent::OrderPlaced {
                ticker: position.ticker.clone(),
                side: "sell".into(),
                qty: position.quantity,
                price: Some(price),
                order_id,
                context: "ema9_trail".into(),
            })
            .await;
        Ok(())
    }

    /// Cancel the working limit and sell at market (RSI recovery exit)
    async fn exit_at_market(
        &self,
        position: &Position,
        live_order: Option<&BrokerOrder>,
        counters: &CycleCounters,
    ) -> Result<()> {
        if let Some(order) = live_order {
            if !self.cancel_confirmed(position, order, counters).await? {
                return Ok(());
            }
        }
        let request = OrderRequest::market_sell(&position.trading_symbol, position.quantity);
        let order_id = self.place_order(&request).await?;
        self.store
            .set_sell_order(&position.ticker, Some(order_id.clone()))
            .await?;
        info!(
            "rsi recovery exit working: {} x{} at market ({})",
            position.ticker, position.quantity, order_id
        );

        // market orders usually fill immediately; settle now if they did
        if let Ok(order) = self.fetch_order(&order_id).await {
            if order.status == OrderStatus::Complete {
                self.handle_completed_sell(position, &order, counters).await?;
            }
        }
        Ok(())
    }

    /// Cancel with a bounded confirmation wait. Returns true only when the
    /// old order is confirmed dead; a completion discovered mid-cancel
    /// closes the position and returns false.
    async fn cancel_confirmed(
        &self,
        position: &Position,
        order: &BrokerOrder,
        counters: &CycleCounters,
    ) -> Result<bool> {
        for attempt in 1..=CANCEL_MAX_ATTEMPTS {
            match self.cancel_order(&order.order_id).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        "{}: cancel attempt {}/{} failed: {}",
                        position.ticker, attempt, CANCEL_MAX_ATTEMPTS, e
                    );
                    continue;
                }
            }
            for _ in 0..CANCEL_CONFIRM_POLLS {
                match self.fetch_order(&order.order_id).await {
                    Ok(current) => match current.status {
                        OrderStatus::Cancelled | OrderStatus::Rejected => {
                            self.store.set_sell_order(&position.ticker, None).await?;
                            return Ok(true);
                        }
                        OrderStatus::Complete => {
                            // filled while we were cancelling
                            self.handle_completed_sell(position, &current, counters)
                                .await?;
                            return Ok(false);
                        }
                        _ => tokio::time::sleep(CANCEL_CONFIRM_PAUSE).await,
                    },
                    Err(Error::NoData(_)) => {
                        // dropped from the book entirely: treat as dead
                        self.store.set_sell_order(&position.ticker, None).await?;
                        return Ok(true);
                    }
                    Err(e) => {
                        warn!("{}: cancel confirm poll failed: {}", position.ticker, e);
                        tokio::time::sleep(CANCEL_CONFIRM_PAUSE).await;
                    }
                }
            }
        }
        warn!(
            "{}: cancel of {} unconfirmed, not replacing this cycle",
            position.ticker, order.order_id
        );
        Ok(false)
    }

    /// Close the position off a completed sell order. Partial fills notify
    /// and shrink the position instead of closing it.
    async fn handle_completed_sell(
        &self,
        position: &Position,
        order: &BrokerOrder,
        counters: &CycleCounters,
    ) -> Result<()> {
        let exit_price = order
            .exec_price
            .or(order.price)
            .unwrap_or(position.entry_price);

        if order.qty < position.quantity {
            let remaining = position.quantity - order.qty;
            warn!(
                "{}: sell filled {} of {}, {} remaining",
                position.ticker, order.qty, position.quantity, remaining
            );
            self.notifier
                .notify(NotificationEvent::PartialFill {
                    ticker: position.ticker.clone(),
                    filled_qty: order.qty,
                    ordered_qty: position.quantity,
                    order_id: order.order_id.clone(),
                })
                .await;
            self.store.adjust_quantity(&position.ticker, remaining).await?;
            self.store.set_sell_order(&position.ticker, None).await?;
            return Ok(());
        }

        let reason = match order.order_type {
            OrderType::Market => ExitReason::Rsi50,
            OrderType::Limit => ExitReason::Ema9Target,
        };
        let closed = self
            .store
            .close_position(
                &position.ticker,
                exit_price,
                Utc::now(),
                reason,
                Some(&order.order_id),
            )
            .await?;
        counters.closed.fetch_add(1, Ordering::SeqCst);
        info!(
            "position closed: {} @ {:.2} ({}), pnl {:.2}",
            closed.ticker,
            exit_price,
            reason,
            closed.pnl.unwrap_or_default()
        );
        self.notifier
            .notify(NotificationEvent::PositionClosed {
                ticker: closed.ticker.clone(),
                exit_price,
                pnl: closed.pnl.unwrap_or_default(),
                reason,
            })
            .await;
        Ok(())
    }

    // pipeline-wrapped broker calls

    async fn fetch_order(&self, order_id: &str) -> Result<BrokerOrder> {
        let broker = self.broker.clone();
        let order_id = order_id.to_string();
        self.pipeline
            .call(EndpointClass::Orders, move || {
                let broker = broker.clone();
                let order_id = order_id.clone();
                async move { broker.order_status(&order_id).await }
            })
            .await
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String> {
        let broker = self.broker.clone();
        let request = request.clone();
        let ack = self
            .pipeline
            .call(EndpointClass::Orders, move || {
                let broker = broker.clone();
                let request = request.clone();
                async move { broker.place_order(&request).await }
            })
            .await?;
        Ok(ack.order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let broker = self.broker.clone();
        let order_id = order_id.to_string();
        self.pipeline
            .call(EndpointClass::Orders, move || {
                let broker = broker.clone();
                let order_id = order_id.clone();
                async move { broker.cancel_order(&order_id).await }
            })
            .await
    }
}

/// NSE quotes in 5 paise ticks
fn round_to_tick(price: f64) -> f64 {
    (price * 20.0).round() / 20.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fast_pipeline, snapshot, MockBroker, ScriptedMarket};
    use neodip_core::models::{EntryKind, Fill, OrderSide, PositionStatus, RsiLevel};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<TradeStore>,
        broker: Arc<MockBroker>,
        market: Arc<ScriptedMarket>,
        engine: Arc<ExitEngine>,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            TradeStore::open(&dir.path().join("ledger.json"))
                .await
                .unwrap(),
        );
        let broker = Arc::new(MockBroker::new(1_000_000.0));
        let market = Arc::new(ScriptedMarket::new());
        let config = Arc::new(AgentConfig::default());
        let engine = Arc::new(ExitEngine::new(
            store.clone(),
            broker.clone(),
            fast_pipeline(broker.clone()),
            market.clone(),
            Arc::new(neodip_core::events::LogNotifier::new(Default::default())),
            config,
        ));
        Fixture {
            _dir: dir,
            store,
            broker,
            market,
            engine,
        }
    }

    async fn open_position(f: &Fixture, ticker: &str, entry_price: f64, qty: u32) {
        let fill = Fill::new(
            Utc::now(),
            entry_price,
            qty,
            RsiLevel::Thirty,
            "BUY-1",
            EntryKind::Initial,
        );
        f.store
            .add_fill(ticker, &format!("{}-EQ", ticker), fill)
            .await
            .unwrap();
    }

    /// rsi low enough that the recovery exit never interferes
    fn trail_snapshot(close: f64, ema9: f64) -> neodip_core::models::IndicatorSnapshot {
        snapshot(40.0, close, ema9, 2100.0)
    }

    #[tokio::test]
    async fn initial_sell_placed_at_ema9() {
        let f = fixture().await;
        open_position(&f, "RELIANCE", 2450.0, 40).await;
        f.market.set_snapshot("RELIANCE", trail_snapshot(2510.0, 2500.0));

        let summary = f.engine.place_open_sells().await.unwrap();
        assert_eq!(summary.placed, 1);

        let placed = f.broker.last_placed().unwrap();
        assert_eq!(placed.side, OrderSide::Sell);
        assert_eq!(placed.order_type, OrderType::Limit);
        assert_eq!(placed.price, Some(2500.0));
        assert_eq!(placed.qty, 40);

        let position = f.store.position("RELIANCE").await.unwrap();
        assert!(position.sell_order_id.is_some());
        assert_eq!(position.lowest_ema9_seen, Some(2500.0));
    }

    #[tokio::test]
    async fn trail_only_moves_down() {
        let f = fixture().await;
        open_position(&f, "RELIANCE", 2450.0, 40).await;

        // ema9 sequence across cycles: 2500, 2480, 2490, 2460
        f.market.set_snapshot("RELIANCE", trail_snapshot(2510.0, 2500.0));
        f.engine.monitor_cycle().await.unwrap();
        assert_eq!(f.broker.placed_count(), 1);

        f.market.set_snapshot("RELIANCE", trail_snapshot(2490.0, 2480.0));
        f.engine.monitor_cycle().await.unwrap();
        assert_eq!(f.broker.placed_count(), 2);
        assert_eq!(f.broker.cancelled.lock().unwrap().len(), 1);

        // 2490 >= lowest seen 2480: no action
        f.market.set_snapshot("RELIANCE", trail_snapshot(2495.0, 2490.0));
        f.engine.monitor_cycle().await.unwrap();
        assert_eq!(f.broker.placed_count(), 2);

        f.market.set_snapshot("RELIANCE", trail_snapshot(2470.0, 2460.0));
        f.engine.monitor_cycle().await.unwrap();
        assert_eq!(f.broker.placed_count(), 3);

        let position = f.store.position("RELIANCE").await.unwrap();
        assert_eq!(position.lowest_ema9_seen, Some(2460.0));
        assert_eq!(f.broker.last_placed().unwrap().price, Some(2460.0));
    }

    #[tokio::test]
    async fn safety_floor_blocks_placement_until_recovery() {
        let f = fixture().await;
        open_position(&f, "RELIANCE", 2450.0, 40).await;

        // ema9 ~6% under entry: no order
        f.market.set_snapshot("RELIANCE", trail_snapshot(2310.0, 2300.0));
        let summary = f.engine.monitor_cycle().await.unwrap();
        assert_eq!(summary.placed, 0);
        assert_eq!(summary.skipped_below_floor, 1);
        assert_eq!(f.broker.placed_count(), 0);

        // recovery to the floor (0.95 * 2450 = 2327.5): order goes out
        f.market.set_snapshot("RELIANCE", trail_snapshot(2340.0, 2327.5));
        let summary = f.engine.monitor_cycle().await.unwrap();
        assert_eq!(summary.placed, 1);
        assert_eq!(f.broker.placed_count(), 1);
    }

    #[tokio::test]
    async fn floor_also_guards_updates() {
        let f = fixture().await;
        open_position(&f, "RELIANCE", 2450.0, 40).await;
        f.market.set_snapshot("RELIANCE", trail_snapshot(2510.0, 2500.0));
        f.engine.monitor_cycle().await.unwrap();

        // collapse under the floor: working order stays where it is
        f.market.set_snapshot("RELIANCE", trail_snapshot(2300.0, 2290.0));
        f.engine.monitor_cycle().await.unwrap();
        assert_eq!(f.broker.placed_count(), 1);
        assert!(f.broker.cancelled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_sell_closes_the_position() {
        let f = fixture().await;
        open_position(&f, "RELIANCE", 2450.0, 40).await;
        f.market.set_snapshot("RELIANCE", trail_snapshot(2510.0, 2500.0));
        f.engine.monitor_cycle().await.unwrap();

        let order_id = f
            .store
            .position("RELIANCE")
            .await
            .unwrap()
            .sell_order_id
            .unwrap();
        f.broker
            .set_order_status(&order_id, OrderStatus::Complete, Some(2500.0));

        let summary = f.engine.monitor_cycle().await.unwrap();
        assert_eq!(summary.closed, 1);

        let position = f.store.position("RELIANCE").await.unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        let exit = position.exit.unwrap();
        assert_eq!(exit.reason, ExitReason::Ema9Target);
        assert_eq!(exit.price, 2500.0);
        // (2500 - 2450) * 40
        assert!((position.pnl.unwrap() - 2000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn startup_detects_already_complete_sell_without_replacing() {
        let f = fixture().await;
        open_position(&f, "RELIANCE", 2450.0, 40).await;
        f.market.set_snapshot("RELIANCE", trail_snapshot(2510.0, 2500.0));
        f.engine.place_open_sells().await.unwrap();
        let order_id = f
            .store
            .position("RELIANCE")
            .await
            .unwrap()
            .sell_order_id
            .unwrap();

        // overnight fill; the open pass must close, not re-place
        f.broker
            .set_order_status(&order_id, OrderStatus::Complete, Some(2505.0));
        let summary = f.engine.place_open_sells().await.unwrap();
        assert_eq!(summary.closed, 1);
        assert_eq!(summary.placed, 0);
        assert_eq!(f.broker.placed_count(), 1);
    }

    #[tokio::test]
    async fn failed_cancel_never_places_second_sell() {
        let f = fixture().await;
        open_position(&f, "RELIANCE", 2450.0, 40).await;
        f.market.set_snapshot("RELIANCE", trail_snapshot(2510.0, 2500.0));
        f.engine.monitor_cycle().await.unwrap();

        f.broker
            .fail_cancel
            .store(true, std::sync::atomic::Ordering::SeqCst);
        f.market.set_snapshot("RELIANCE", trail_snapshot(2490.0, 2480.0));
        f.engine.monitor_cycle().await.unwrap();

        // still exactly one sell placed; the anchor did not move
        assert_eq!(f.broker.placed_count(), 1);
        let position = f.store.position("RELIANCE").await.unwrap();
        assert_eq!(position.lowest_ema9_seen, Some(2500.0));
        assert!(position.sell_order_id.is_some());
    }

    #[tokio::test]
    async fn fill_discovered_before_update_closes_instead_of_replacing() {
        let f = fixture().await;
        open_position(&f, "RELIANCE", 2450.0, 40).await;
        f.market.set_snapshot("RELIANCE", trail_snapshot(2510.0, 2500.0));
        f.engine.monitor_cycle().await.unwrap();
        let order_id = f
            .store
            .position("RELIANCE")
            .await
            .unwrap()
            .sell_order_id
            .unwrap();

        // the order filled between cycles; the status check must win over
        // the pending downward revision
        f.broker
            .set_order_status(&order_id, OrderStatus::Complete, Some(2499.0));
        f.market.set_snapshot("RELIANCE", trail_snapshot(2490.0, 2480.0));
        let summary = f.engine.monitor_cycle().await.unwrap();

        assert_eq!(summary.closed, 1);
        assert_eq!(f.broker.placed_count(), 1);
        let position = f.store.position("RELIANCE").await.unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
    }

    #[tokio::test]
    async fn rsi_recovery_exits_at_market() {
        let f = fixture().await;
        open_position(&f, "RELIANCE", 2450.0, 40).await;
        f.market.set_snapshot("RELIANCE", trail_snapshot(2510.0, 2500.0));
        f.engine.monitor_cycle().await.unwrap();

        // RSI back above 50: limit cancelled, market sell placed and filled
        f.broker.set_quote("RELIANCE-EQ", 2520.0, None);
        f.market
            .set_snapshot("RELIANCE", snapshot(55.0, 2520.0, 2505.0, 2100.0));
        let summary = f.engine.monitor_cycle().await.unwrap();
        assert_eq!(summary.closed, 1);

        let position = f.store.position("RELIANCE").await.unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.exit.unwrap().reason, ExitReason::Rsi50);
    }

    #[tokio::test]
    async fn partial_fill_shrinks_position_and_notifies() {
        let f = fixture().await;
        open_position(&f, "RELIANCE", 2450.0, 40).await;
        f.market.set_snapshot("RELIANCE", trail_snapshot(2510.0, 2500.0));
        f.engine.monitor_cycle().await.unwrap();
        let order_id = f
            .store
            .position("RELIANCE")
            .await
            .unwrap()
            .sell_order_id
            .unwrap();

        // 15 of 40 filled when the day ended
        {
            let mut book = f.broker.book.lock().unwrap();
            let order = book.iter_mut().find(|o| o.order_id == order_id).unwrap();
            order.status = OrderStatus::Complete;
            order.exec_price = Some(2500.0);
            order.qty = 15;
        }
        let summary = f.engine.monitor_cycle().await.unwrap();
        assert_eq!(summary.closed, 0);

        let position = f.store.position("RELIANCE").await.unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.quantity, 25);
        assert!(position.sell_order_id.is_none());
    }
}
