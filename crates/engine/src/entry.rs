//! EntryEngine: candidate consumption and pyramiding re-entries
//!
//! New entries run once at market open over the day's candidate list;
//! re-entries run inside the hourly monitor against open positions. Both
//! paths walk the same gate ladder and record fills only after the broker
//! acknowledges the order. Level flags are never flipped at signal time:
//! the TradeStore transaction that appends the fill is the only place a
//! level is consumed.

use chrono::Utc;
use neodip_core::config::AgentConfig;
use neodip_core::errors::{EndpointClass, Error, Result};
use neodip_core::events::{NotificationEvent, Notifier};
use neodip_core::models::{
    BrokerOrder, Candidate, EntryKind, Fill, Holding, OrderRequest, OrderSide, OrderVariety,
    RsiLevel,
};
use neodip_core::symbols;
use neodip_networking::api::BrokerApi;
use neodip_networking::market::MarketData;
use neodip_networking::CallPipeline;
use neodip_persistence::TradeStore;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Why a candidate or re-entry signal was not traded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    PortfolioFull,
    Duplicate,
    QtyZero,
    Illiquid,
    InsufficientFunds,
    DailyCap,
    NoSignal,
    NoData,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            SkipReason::PortfolioFull => "portfolio_full",
            SkipReason::Duplicate => "duplicate",
            SkipReason::QtyZero => "qty_zero",
            SkipReason::Illiquid => "illiquid",
            SkipReason::InsufficientFunds => "insufficient_funds",
            SkipReason::DailyCap => "daily_cap",
            SkipReason::NoSignal => "no_signal",
            SkipReason::NoData => "no_data",
        };
        write!(f, "{}", tag)
    }
}

/// Outcome of one entry pass, fed into the daily summary
#[derive(Debug, Default)]
pub struct EntrySummary {
    pub placed: Vec<(String, String)>,
    pub queued: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
}

impl EntrySummary {
    fn skip(&mut self, ticker: &str, reason: SkipReason) {
        debug!("entry skip {}: {}", ticker, reason);
        self.skipped.push((ticker.to_string(), reason));
    }
}

pub struct EntryEngine {
    store: Arc<TradeStore>,
    broker: Arc<dyn BrokerApi>,
    pipeline: Arc<CallPipeline>,
    market: Arc<dyn MarketData>,
    notifier: Arc<dyn Notifier>,
    config: Arc<AgentConfig>,
}

impl EntryEngine {
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
        }
    }

    /// Consume the day's candidates in priority order (market open)
    pub async fn run_new_entries(
        &self,
        candidates: Vec<Candidate>,
        variety: OrderVariety,
    ) -> Result<EntrySummary> {
        let mut summary = EntrySummary::default();
        if candidates.is_empty() {
            return Ok(summary);
        }
        info!("entry pass over {} candidates", candidates.len());

        let holdings = self.fetch_holdings().await?;
        let orders = self.fetch_orders().await?;
        let mut cash = self.fetch_limits().await?;
        let mut open_count = self.store.open_positions().await.len();

        for candidate in candidates {
            if open_count >= self.config.sizing.max_portfolio_size {
                summary.skip(&candidate.ticker, SkipReason::PortfolioFull);
                continue;
            }
            match self
                .try_place_candidate(&candidate, variety, &holdings, &orders, &mut cash)
                .await
            {
                PlaceOutcome::Placed(order_id) => {
                    open_count += 1;
                    summary.placed.push((candidate.ticker.clone(), order_id));
                }
                PlaceOutcome::Queued => summary.queued.push(candidate.ticker.clone()),
                PlaceOutcome::Skipped(reason) => summary.skip(&candidate.ticker, reason),
            }
        }

        info!(
            "entry pass done: {} placed, {} queued, {} skipped",
            summary.placed.len(),
            summary.queued.len(),
            summary.skipped.len()
        );
        Ok(summary)
    }

    /// Pre-market pass over the failed-order queue (same ladder, MARKET orders)
    pub async fn retry_failed_orders(&self) -> Result<EntrySummary> {
        let parked = self.store.failed_orders().await;
        let mut summary = EntrySummary::default();
        if parked.is_empty() {
            return Ok(summary);
        }
        info!("retrying {} parked orders", parked.len());

        let holdings = self.fetch_holdings().await?;
        let orders = self.fetch_orders().await?;
        let mut cash = self.fetch_limits().await?;
        let mut open_count = self.store.open_positions().await.len();

        for failed in parked {
            let candidate = failed.candidate.clone();
            if open_count >= self.config.sizing.max_portfolio_size {
                summary.skip(&candidate.ticker, SkipReason::PortfolioFull);
                continue;
            }
            match self
                .try_place_candidate(&candidate, OrderVariety::Regular, &holdings, &orders, &mut cash)
                .await
            {
                PlaceOutcome::Placed(order_id) => {
                    open_count += 1;
                    self.store.remove_failed(&candidate.ticker).await?;
                    summary.placed.push((candidate.ticker.clone(), order_id));
                }
                PlaceOutcome::Queued => summary.queued.push(candidate.ticker.clone()),
                PlaceOutcome::Skipped(reason) => {
                    if reason == SkipReason::Duplicate {
                        // already holding it, nothing left to retry
                        self.store.remove_failed(&candidate.ticker).await?;
                    }
                    summary.skip(&candidate.ticker, reason);
                }
            }
        }
        Ok(summary)
    }

    /// Evaluate pyramiding re-entries on open positions (hourly monitor)
    pub async fn evaluate_reentries(&self) -> Result<EntrySummary> {
        let positions = self.store.open_positions().await;
        let mut summary = EntrySummary::default();
        if positions.is_empty() {
            return Ok(summary);
        }

        // indicator fetches fan out, bounded; order decisions stay serial
        let semaphore = Arc::new(Semaphore::new(self.config.pacing.max_concurrent_analyses.max(1)));
        let mut snapshot_tasks = tokio::task::JoinSet::new();
        for position in &positions {
            let market = self.market.clone();
            let semaphore = semaphore.clone();
            let ticker = position.ticker.clone();
            let trading_symbol = position.trading_symbol.clone();
            snapshot_tasks.spawn(async move {
                let _permit = semaphore.acquire().await;
                let snapshot = market.indicator_snapshot(&ticker, &trading_symbol).await;
                (ticker, snapshot)
            });
        }
        let mut snapshots = std::collections::HashMap::new();
        while let Some(joined) = snapshot_tasks.join_next().await {
            if let Ok((ticker, snapshot)) = joined {
                snapshots.insert(ticker, snapshot);
            }
        }

        let orders = self.fetch_orders().await?;
        let mut cash = self.fetch_limits().await?;

        for position in positions {
            let snapshot = match snapshots.remove(&position.ticker) {
                Some(Ok(snapshot)) => snapshot,
                Some(Err(Error::InsufficientData { ticker, got, need })) => {
                    info!("{}: {} bars of {} needed, skipping re-entry", ticker, got, need);
                    summary.skip(&position.ticker, SkipReason::NoData);
                    continue;
                }
                Some(Err(e)) => {
                    warn!("{}: indicator fetch failed: {}", position.ticker, e);
                    summary.skip(&position.ticker, SkipReason::NoData);
                    continue;
                }
                None => continue,
            };

            let levels = position.levels;
            let rsi10 = snapshot.rsi10;

            if rsi10 > RsiLevel::Thirty.threshold() {
                if !levels.reset_ready {
                    self.store.mark_reset_ready(&position.ticker, true).await?;
                }
                summary.skip(&position.ticker, SkipReason::NoSignal);
                continue;
            }

            // rsi10 is at/below 30 from here on
            let next_level = if levels.reset_ready && rsi10 < RsiLevel::Thirty.threshold() {
                // fresh cycle: all levels available again, this dip re-arms 30
                self.store.reset_levels(&position.ticker).await?;
                Some(RsiLevel::Thirty)
            } else {
                levels.next_level(rsi10)
            };
            let Some(level) = next_level else {
                summary.skip(&position.ticker, SkipReason::NoSignal);
                continue;
            };

            if self.store.reentries_today(&position.ticker).await
                >= self.config.strategy.max_reentries_per_day
            {
                summary.skip(&position.ticker, SkipReason::DailyCap);
                continue;
            }

            if live_buy_exists(&orders, &position.ticker) {
                summary.skip(&position.ticker, SkipReason::Duplicate);
                continue;
            }

            let price = snapshot.close;
            if price <= 0.0 {
                summary.skip(&position.ticker, SkipReason::NoData);
                continue;
            }
            let mut qty = (self.config.sizing.capital_per_trade / price).floor() as u32;
            if qty < 1 {
                summary.skip(&position.ticker, SkipReason::QtyZero);
                continue;
            }
            if let Some(avg_volume) = self.fetch_avg_volume(&position.trading_symbol).await {
                if qty as f64 > self.config.sizing.max_position_to_avg_volume_ratio * avg_volume {
                    summary.skip(&position.ticker, SkipReason::Illiquid);
                    continue;
                }
            }

            // re-entries clamp to what the cash allows instead of parking
            let affordable = (cash / price).floor() as u32;
            if affordable < 1 {
                summary.skip(&position.ticker, SkipReason::InsufficientFunds);
                continue;
            }
            qty = qty.min(affordable);

            let request =
                OrderRequest::market_buy(&position.trading_symbol, qty, OrderVariety::Regular);
            match self.place_through_pipeline(&request).await {
                Ok(order_id) => {
                    let fill = Fill::new(Utc::now(), price, qty, level, &order_id, EntryKind::Reentry);
                    self.store
                        .add_fill(&position.ticker, &position.trading_symbol, fill)
                        .await?;
                    cash -= qty as f64 * price;
                    info!(
                        "re-entry filled: {} x{} @ {:.2} (level {})",
                        position.ticker, qty, price, level
                    );
                    self.notifier
                        .notify(NotificationEvent::OrderPlaced {
                            ticker: position.ticker.clone(),
                            side: "buy".into(),
                            qty,
                            price: Some(price),
                            order_id: order_id.clone(),
                            context: format!("reentry_level_{}", level),
                        })
                        .await;
                    summary.placed.push((position.ticker.clone(), order_id));
                }
                Err(e) => {
                    warn!("re-entry order failed for {}: {}", position.ticker, e);
                    summary.skip(&position.ticker, SkipReason::NoData);
                }
            }
        }
        Ok(summary)
    }

    /// One candidate through the gate ladder (steps shared by the open pass
    /// and the failed-order retry)
    async fn try_place_candidate(
        &self,
        candidate: &Candidate,
        variety: OrderVariety,
        holdings: &[Holding],
        orders: &[BrokerOrder],
        cash: &mut f64,
    ) -> PlaceOutcome {
        let ticker = &candidate.ticker;

        if holding_exists(holdings, ticker) || live_buy_exists(orders, ticker) {
            return PlaceOutcome::Skipped(SkipReason::Duplicate);
        }

        let capital = candidate
            .execution_capital
            .unwrap_or(self.config.sizing.capital_per_trade);
        if candidate.last_close <= 0.0 {
            return PlaceOutcome::Skipped(SkipReason::QtyZero);
        }
        let qty = (capital / candidate.last_close).floor() as u32;
        if qty < 1 {
            return PlaceOutcome::Skipped(SkipReason::QtyZero);
        }

        let trading_symbol = symbols::equity_symbol(ticker);
        if let Some(avg_volume) = self.fetch_avg_volume(&trading_symbol).await {
            if qty as f64 > self.config.sizing.max_position_to_avg_volume_ratio * avg_volume {
                return PlaceOutcome::Skipped(SkipReason::Illiquid);
            }
        }

        let affordable = (*cash / candidate.last_close).floor() as u32;
        if qty > affordable {
            let required = qty as f64 * candidate.last_close;
            warn!(
                "{}: need {:.0}, cash {:.0}, parking for retry",
                ticker, required, *cash
            );
            if let Err(e) = self
                .store
                .enqueue_failed(candidate.clone(), "insufficient_funds")
                .await
            {
                warn!("failed to park {}: {}", ticker, e);
            }
            self.notifier
                .notify(NotificationEvent::InsufficientFunds {
                    ticker: ticker.clone(),
                    required,
                    available: *cash,
                })
                .await;
            return PlaceOutcome::Queued;
        }

        let request = OrderRequest::market_buy(&trading_symbol, qty, variety);
        match self.place_through_pipeline(&request).await {
            Ok(order_id) => {
                let fill = Fill::new(
                    Utc::now(),
                    candidate.last_close,
                    qty,
                    RsiLevel::Thirty,
                    &order_id,
                    EntryKind::Initial,
                );
                if let Err(e) = self.store.add_fill(ticker, &trading_symbol, fill).await {
                    // the order exists at the broker; reconciliation will
                    // pick the position up if this write failed
                    warn!("ledger append failed for {}: {}", ticker, e);
                }
                *cash -= qty as f64 * candidate.last_close;
                info!(
                    "entry filled: {} x{} @ {:.2} ({})",
                    ticker, qty, candidate.last_close, order_id
                );
                self.notifier
                    .notify(NotificationEvent::OrderPlaced {
                        ticker: ticker.clone(),
                        side: "buy".into(),
                        qty,
                        price: Some(candidate.last_close),
                        order_id: order_id.clone(),
                        context: "initial_entry".into(),
                    })
                    .await;
                PlaceOutcome::Placed(order_id)
            }
            Err(Error::BrokerReject(reason)) => {
                self.notifier
                    .notify(NotificationEvent::OrderRejected {
                        ticker: ticker.clone(),
                        reason: reason.clone(),
                    })
                    .await;
                PlaceOutcome::Skipped(SkipReason::NoData)
            }
            Err(Error::DuplicateOrder(_)) => PlaceOutcome::Skipped(SkipReason::Duplicate),
            Err(e) => {
                warn!("order for {} failed after retries: {}", ticker, e);
                if let Err(park_err) = self
                    .store
                    .enqueue_failed(candidate.clone(), &e.to_string())
                    .await
                {
                    warn!("failed to park {}: {}", ticker, park_err);
                }
                PlaceOutcome::Queued
            }
        }
    }

    async fn place_through_pipeline(&self, request: &OrderRequest) -> Result<String> {
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

    async fn fetch_holdings(&self) -> Result<Vec<Holding>> {
        let broker = self.broker.clone();
        self.pipeline
            .call(EndpointClass::Orders, move || {
                let broker = broker.clone();
                async move { broker.holdings().await }
            })
            .await
    }

    async fn fetch_orders(&self) -> Result<Vec<BrokerOrder>> {
        let broker = self.broker.clone();
        self.pipeline
            .call(EndpointClass::Orders, move || {
                let broker = broker.clone();
                async move { broker.orders().await }
            })
            .await
    }

    async fn fetch_limits(&self) -> Result<f64> {
        let broker = self.broker.clone();
        self.pipeline
            .call(EndpointClass::Orders, move || {
                let broker = broker.clone();
                async move { broker.limits().await }
            })
            .await
    }

    async fn fetch_avg_volume(&self, trading_symbol: &str) -> Option<f64> {
        let broker = self.broker.clone();
        let symbol = trading_symbol.to_string();
        match self
            .pipeline
            .call(EndpointClass::Orders, move || {
                let broker = broker.clone();
                let symbol = symbol.clone();
                async move { broker.quote(&symbol).await }
            })
            .await
        {
            Ok(quote) => quote.avg_volume,
            Err(e) => {
                debug!("quote fetch failed for {}: {}", trading_symbol, e);
                None
            }
        }
    }
}

enum PlaceOutcome {
    Placed(String),
    Queued,
    Skipped(SkipReason),
}

/// Holdings under any series variant count as already owning the ticker
fn holding_exists(holdings: &[Holding], ticker: &str) -> bool {
    holdings
        .iter()
        .any(|h| h.qty > 0 && symbols::same_instrument(&h.trading_symbol, ticker))
}

/// A live buy order under any series variant blocks a duplicate entry
fn live_buy_exists(orders: &[BrokerOrder], ticker: &str) -> bool {
    orders.iter().any(|o| {
        o.side == OrderSide::Buy
            && o.status.is_live()
            && symbols::same_instrument(&o.trading_symbol, ticker)
    })
}
