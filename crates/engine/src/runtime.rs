//! Runtime: owns every subsystem and drives the day
//!
//! All shared state lives here and is threaded into the subsystems at
//! build time; nothing is global. The schedule loop must keep consuming
//! ticks no matter what a single ticker does, so dispatch failures are
//! logged and the loop moves on.

use crate::candidates;
use crate::entry::{EntryEngine, EntrySummary};
use crate::exit::ExitEngine;
use crate::reconcile::Reconciler;
use crate::scheduler::{DayTask, TradingCalendar};
use chrono::Local;
use neodip_core::config::{AgentConfig, Credentials};
use neodip_core::errors::{EndpointClass, Error, Result};
use neodip_core::events::{NotificationEvent, Notifier};
use neodip_core::models::{OrderVariety, PositionStatus};
use neodip_networking::api::{BrokerApi, ScripTable};
use neodip_networking::history::HistoryClient;
use neodip_networking::live::{spawn_price_feed, LivePriceCache, PriceFeedHandle};
use neodip_networking::market::{MarketData, MarketDataService, SnapshotParams};
use neodip_networking::{
    CallPipeline, CircuitBreaker, KotakNeoClient, PaperBroker, RateLimiter, RetryPolicy,
    SessionGuard,
};
use neodip_persistence::{FundamentalsCache, ScripMasterStore, TradeStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Counters accumulated between market open and EOD
#[derive(Debug, Default, Clone)]
struct DayStats {
    entries: usize,
    reentries: usize,
    failed: usize,
    skipped: usize,
}

impl DayStats {
    fn absorb_entry(&mut self, summary: &EntrySummary, reentry: bool) {
        if reentry {
            self.reentries += summary.placed.len();
        } else {
            self.entries += summary.placed.len();
        }
        self.failed += summary.queued.len();
        self.skipped += summary.skipped.len();
    }
}

pub struct Runtime {
    config: Arc<AgentConfig>,
    calendar: TradingCalendar,
    store: Arc<TradeStore>,
    session: Arc<SessionGuard>,
    pipeline: Arc<CallPipeline>,
    broker: Arc<dyn BrokerApi>,
    entry: Arc<EntryEngine>,
    exit: Arc<ExitEngine>,
    reconciler: Arc<Reconciler>,
    notifier: Arc<dyn Notifier>,
    scrip_store: ScripMasterStore,
    live: Arc<LivePriceCache>,
    feed: RwLock<Option<PriceFeedHandle>>,
    stats: Mutex<DayStats>,
    cancel: CancellationToken,
}

impl Runtime {
    /// Wire every subsystem from configuration. Fails only on unrecoverable
    /// local problems (bad config, unreadable ledger); the broker being down
    /// is survivable and handled later.
    pub async fn build(
        config: AgentConfig,
        credentials: Credentials,
        notifier: Arc<dyn Notifier>,
        dry_run: bool,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let store = Arc::new(TradeStore::open(&config.paths.ledger_file).await?);

        let token = Arc::new(RwLock::new(None));
        let live_broker: Arc<dyn BrokerApi> = Arc::new(KotakNeoClient::new(
            &config.broker.api_base,
            &credentials.consumer_key,
            token.clone(),
        ));
        let broker: Arc<dyn BrokerApi> = if dry_run {
            // orders are simulated; logins, quotes, and holdings stay real
            Arc::new(PaperBroker::new(
                live_broker,
                config.sizing.capital_per_trade * config.sizing.max_portfolio_size as f64,
            ))
        } else {
            live_broker
        };
        let session = Arc::new(SessionGuard::new(broker.clone(), credentials, token));

        let pipeline = Arc::new(CallPipeline::new(
            Arc::new(RateLimiter::new(config.pacing.rate_limit_delay())),
            Arc::new(CircuitBreaker::default()),
            RetryPolicy::default(),
            session.clone(),
            config.pacing.broker_call_timeout(),
        ));

        let live = Arc::new(LivePriceCache::new());
        let market: Arc<dyn MarketData> = Arc::new(MarketDataService::new(
            pipeline.clone(),
            Arc::new(HistoryClient::new(&config.broker.history_base)),
            Arc::new(FundamentalsCache::default()),
            live.clone(),
            session.clone(),
            config.pacing.ltp_stale_threshold(),
            SnapshotParams {
                rsi_period: config.strategy.rsi_period,
                ema_short: config.strategy.ema_short,
                ema_long: config.strategy.ema_long,
                min_daily_bars: config.strategy.min_daily_bars,
            },
        ));

        let entry = Arc::new(EntryEngine::new(
            store.clone(),
            broker.clone(),
            pipeline.clone(),
            market.clone(),
            notifier.clone(),
            config.clone(),
        ));
        let exit = Arc::new(ExitEngine::new(
            store.clone(),
            broker.clone(),
            pipeline.clone(),
            market.clone(),
            notifier.clone(),
            config.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            broker.clone(),
            pipeline.clone(),
            market,
            notifier.clone(),
        ));

        Ok(Self {
            calendar: TradingCalendar::new(config.holidays.clone()),
            scrip_store: ScripMasterStore::new(&config.paths.scrip_cache_dir),
            config,
            store,
            session,
            pipeline,
            broker,
            entry,
            exit,
            reconciler,
            notifier,
            live,
            feed: RwLock::new(None),
            stats: Mutex::new(DayStats::default()),
            cancel: CancellationToken::new(),
        })
    }

    /// Token for external shutdown (signal handlers)
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled. Returns only after the graceful drain.
    pub async fn run(&self) -> Result<()> {
        self.login_with_retry().await?;
        let scrips = self.load_scrip_master().await?;
        self.start_price_feed(scrips).await;
        self.resume_from_ledger().await;

        let trail = self.spawn_trail_loop();

        loop {
            let now = Local::now();
            let (at, task) = self.calendar.next_event(now);
            let wait = (at - now)
                .to_std()
                .unwrap_or_else(|_| Duration::from_secs(0));
            info!("next task {:?} at {}", task, at);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.dispatch(task).await {
                        // one bad pass must not stall the schedule
                        error!("task {:?} failed: {}", task, e);
                        if matches!(e, Error::Persistence(_)) {
                            self.notifier
                                .notify(NotificationEvent::SessionAlert {
                                    message: format!("ledger write failing: {}", e),
                                })
                                .await;
                        }
                    }
                }
            }
        }

        info!("shutting down: draining in-flight work");
        let drained = self
            .exit
            .drain(Duration::from_secs(self.config.pacing.shutdown_drain_secs))
            .await;
        if !drained {
            warn!("drain deadline hit, abandoning in-flight cycle");
        }
        trail.abort();
        self.store.save().await?;
        info!("shutdown complete");
        Ok(())
    }

    async fn dispatch(&self, task: DayTask) -> Result<()> {
        match task {
            DayTask::PreMarketRetry => {
                let summary = self.entry.retry_failed_orders().await?;
                self.stats.lock().await.absorb_entry(&summary, false);
            }
            DayTask::MarketOpen => {
                *self.stats.lock().await = DayStats::default();
                let candidates = candidates::load_today(
                    &self.config.paths.candidate_dir,
                    self.config.sizing.min_combined_score,
                )?;
                let summary = self
                    .entry
                    .run_new_entries(candidates, OrderVariety::Amo)
                    .await?;
                self.stats.lock().await.absorb_entry(&summary, false);

                self.exit.place_open_sells().await?;
                self.subscribe_open_positions().await;
            }
            DayTask::HourlyMonitor => {
                if let Err(e) = self.exit.monitor_cycle().await {
                    error!("exit cycle failed: {}", e);
                }
                if let Err(e) = self.reconciler.run().await {
                    error!("reconciler pass failed: {}", e);
                }
                match self.entry.evaluate_reentries().await {
                    Ok(summary) => self.stats.lock().await.absorb_entry(&summary, true),
                    Err(e) => error!("re-entry evaluation failed: {}", e),
                }
                self.subscribe_open_positions().await;
            }
            DayTask::EodCleanup => {
                let purged = self.store.purge_expired_failed(Local::now()).await?;
                if purged > 0 {
                    info!("purged {} expired failed orders", purged);
                }
                self.scrip_store
                    .prune(Local::now().date_naive(), 7)
                    .await?;
                self.emit_daily_summary().await;
            }
        }
        Ok(())
    }

    async fn login_with_retry(&self) -> Result<()> {
        let retry = RetryPolicy::default();
        let mut last_err = None;
        for attempt in 1..=retry.max_attempts {
            match self.session.login().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("login attempt {}/{} failed: {}", attempt, retry.max_attempts, e);
                    if attempt < retry.max_attempts {
                        tokio::time::sleep(retry.delay_after(attempt)).await;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Transient("login failed".into())))
    }

    /// Scrip master for today: cache file first, broker refresh on miss
    async fn load_scrip_master(&self) -> Result<Arc<ScripTable>> {
        let today = Local::now().date_naive();
        if let Some(table) = self.scrip_store.load(today).await? {
            return Ok(Arc::new(table));
        }
        let broker = self.broker.clone();
        let table = self
            .pipeline
            .call(EndpointClass::Orders, move || {
                let broker = broker.clone();
                async move { broker.scrip_master().await }
            })
            .await?;
        self.scrip_store.save(today, &table).await?;
        Ok(Arc::new(table))
    }

    async fn start_price_feed(&self, scrips: Arc<ScripTable>) {
        let handle = spawn_price_feed(
            self.config.broker.ws_url.clone(),
            scrips,
            self.live.clone(),
            Duration::from_secs(self.config.pacing.reconnect_backoff_base_secs),
            self.cancel.child_token(),
        );
        if let Err(e) = handle
            .wait_for_connection(Duration::from_secs(self.config.pacing.ws_connect_timeout_secs))
            .await
        {
            // survivable: price lookups fall back to the daily close
            warn!("price feed not connected yet: {}", e);
        }
        *self.feed.write().await = Some(handle);
        self.subscribe_open_positions().await;
    }

    async fn subscribe_open_positions(&self) {
        let symbols: Vec<String> = self
            .store
            .open_positions()
            .await
            .into_iter()
            .map(|p| p.trading_symbol)
            .collect();
        if let Some(feed) = self.feed.read().await.as_ref() {
            feed.subscribe(symbols).await;
        }
    }

    /// Mid-day restart: query the broker for order ids the ledger expects
    /// so completed exits are settled before any new orders go out.
    async fn resume_from_ledger(&self) {
        let open = self.store.open_positions().await;
        let tracked: Vec<String> = open
            .iter()
            .filter_map(|p| p.sell_order_id.clone())
            .collect();
        if tracked.is_empty() {
            return;
        }
        info!(
            "resuming: {} tracked sell orders to reconcile",
            tracked.len()
        );
        if let Err(e) = self.exit.monitor_cycle().await {
            warn!("resume reconciliation failed: {}", e);
        }
    }

    /// Continuous EMA9 trailing between scheduler ticks
    fn spawn_trail_loop(&self) -> tokio::task::JoinHandle<()> {
        let exit = self.exit.clone();
        let calendar = self.calendar.clone();
        let interval = self.config.pacing.monitor_interval();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !calendar.in_market_hours(Local::now()) {
                            continue;
                        }
                        if let Err(e) = exit.monitor_cycle().await {
                            warn!("trail cycle failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    async fn emit_daily_summary(&self) {
        let today = Local::now().date_naive();
        let snapshot = self.store.snapshot().await;
        let closed_today: Vec<_> = snapshot
            .positions
            .iter()
            .filter(|p| {
                p.status == PositionStatus::Closed
                    && p.exit
                        .as_ref()
                        .map(|e| e.time.with_timezone(&Local).date_naive() == today)
                        .unwrap_or(false)
            })
            .collect();
        let realized_pnl: f64 = closed_today.iter().filter_map(|p| p.pnl).sum();
        let stats = self.stats.lock().await.clone();

        info!(
            "daily summary {}: {} entries, {} reentries, {} exits, pnl {:.2}",
            today,
            stats.entries,
            stats.reentries,
            closed_today.len(),
            realized_pnl
        );
        self.notifier
            .notify(NotificationEvent::DailySummary {
                date: today,
                entries: stats.entries,
                reentries: stats.reentries,
                exits: closed_today.len(),
                failed_orders: stats.failed,
                skipped: stats.skipped,
                realized_pnl,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_stats_absorbs_summaries() {
        let mut stats = DayStats::default();
        let mut summary = EntrySummary::default();
        summary.placed.push(("RELIANCE".into(), "ORD-1".into()));
        summary.queued.push("TCS".into());
        stats.absorb_entry(&summary, false);
        stats.absorb_entry(&summary, true);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.reentries, 1);
        assert_eq!(stats.failed, 2);
    }
}
