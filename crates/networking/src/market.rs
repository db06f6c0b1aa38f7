//! MarketDataService: OHLCV, fundamentals, and live LTP with fallback
//!
//! One facade over the chart client, the fundamentals cache, and the live
//! price cache, with every network fetch routed through the call pipeline.
//! Engines depend on the [`MarketData`] trait so tests can substitute a
//! scripted implementation.

use crate::history::HistoryClient;
use crate::live::LivePriceCache;
use crate::pipeline::CallPipeline;
use crate::session::SessionGuard;
use async_trait::async_trait;
use neodip_core::errors::{EndpointClass, Error, Result};
use neodip_core::indicators;
use neodip_core::models::{Candle, Fundamentals, IndicatorSnapshot, Interval, PriceSource};
use neodip_persistence::FundamentalsCache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Market data surface the engines consume
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Ordered OHLCV bars; fails with `InsufficientData` when fewer than
    /// `min_bars` daily bars come back.
    async fn fetch_ohlcv(
        &self,
        ticker: &str,
        interval: Interval,
        years: u32,
        min_bars: usize,
    ) -> Result<Vec<Candle>>;

    /// PE/PB, cached per (ticker, session); errors return empty sides
    async fn fetch_fundamentals(&self, ticker: &str) -> Result<Fundamentals>;

    /// Live LTP if fresh, else last daily close. The source is returned so
    /// downstream can reason about freshness.
    async fn ltp_with_fallback(
        &self,
        trading_symbol: &str,
        ticker: &str,
    ) -> Result<(f64, PriceSource)>;

    /// Daily indicator state with the live LTP as a provisional final bar
    async fn indicator_snapshot(
        &self,
        ticker: &str,
        trading_symbol: &str,
    ) -> Result<IndicatorSnapshot>;
}

/// Strategy windows the snapshot needs
#[derive(Debug, Clone, Copy)]
pub struct SnapshotParams {
    pub rsi_period: usize,
    pub ema_short: usize,
    pub ema_long: usize,
    pub min_daily_bars: usize,
}

pub struct MarketDataService {
    pipeline: Arc<CallPipeline>,
    history: Arc<HistoryClient>,
    fundamentals: Arc<FundamentalsCache>,
    live: Arc<LivePriceCache>,
    session: Arc<SessionGuard>,
    stale_threshold: Duration,
    params: SnapshotParams,
    /// Years of daily history fetched for indicator work
    history_years: u32,
}

impl MarketDataService {
    pub fn new(
        pipeline: Arc<CallPipeline>,
        history: Arc<HistoryClient>,
        fundamentals: Arc<FundamentalsCache>,
        live: Arc<LivePriceCache>,
        session: Arc<SessionGuard>,
        stale_threshold: Duration,
        params: SnapshotParams,
    ) -> Self {
        Self {
            pipeline,
            history,
            fundamentals,
            live,
            session,
            stale_threshold,
            params,
            history_years: 2,
        }
    }

    /// The live cache, for feed wiring
    pub fn live_cache(&self) -> Arc<LivePriceCache> {
        self.live.clone()
    }
}

#[async_trait]
impl MarketData for MarketDataService {
    async fn fetch_ohlcv(
        &self,
        ticker: &str,
        interval: Interval,
        years: u32,
        min_bars: usize,
    ) -> Result<Vec<Candle>> {
        let history = self.history.clone();
        let ticker_owned = ticker.to_string();
        let candles = self
            .pipeline
            .call(EndpointClass::Historical, move || {
                let history = history.clone();
                let ticker = ticker_owned.clone();
                async move { history.fetch_chart(&ticker, interval, years).await }
            })
            .await?;

        match interval {
            Interval::Daily => {
                if candles.len() < min_bars {
                    // not an endpoint fault; the caller skips this ticker
                    info!(
                        "{}: {} daily bars, {} required",
                        ticker,
                        candles.len(),
                        min_bars
                    );
                    return Err(Error::InsufficientData {
                        ticker: ticker.to_string(),
                        got: candles.len(),
                        need: min_bars,
                    });
                }
            }
            Interval::Weekly => {
                if candles.len() < min_bars {
                    warn!(
                        "{}: only {} weekly bars ({} recommended), proceeding",
                        ticker,
                        candles.len(),
                        min_bars
                    );
                }
            }
        }
        Ok(candles)
    }

    async fn fetch_fundamentals(&self, ticker: &str) -> Result<Fundamentals> {
        let session_id = self.session.session_id().await.unwrap_or_default();
        if let Some(cached) = self.fundamentals.get(ticker, &session_id) {
            debug!("fundamentals cache hit for {}", ticker);
            return Ok(cached);
        }

        let history = self.history.clone();
        let ticker_owned = ticker.to_string();
        match self
            .pipeline
            .call(EndpointClass::Fundamentals, move || {
                let history = history.clone();
                let ticker = ticker_owned.clone();
                async move { history.fetch_fundamentals(&ticker).await }
            })
            .await
        {
            Ok(fundamentals) => {
                self.fundamentals.insert(ticker, &session_id, fundamentals);
                Ok(fundamentals)
            }
            Err(e) => {
                // miss on error: empty sides, not cached
                debug!("fundamentals fetch failed for {}: {}", ticker, e);
                Ok(Fundamentals::default())
            }
        }
    }

    async fn ltp_with_fallback(
        &self,
        trading_symbol: &str,
        ticker: &str,
    ) -> Result<(f64, PriceSource)> {
        if let Some((price, age)) = self.live.get(trading_symbol) {
            if age <= self.stale_threshold {
                return Ok((price, PriceSource::Websocket));
            }
            debug!(
                "{} tick is {:?} old, falling back to daily close",
                trading_symbol, age
            );
        }

        let candles = self
            .fetch_ohlcv(ticker, Interval::Daily, 1, 1)
            .await?;
        let last = candles
            .last()
            .ok_or_else(|| Error::NoData(format!("no daily bars for {}", ticker)))?;
        Ok((last.close, PriceSource::Fallback))
    }

    async fn indicator_snapshot(
        &self,
        ticker: &str,
        trading_symbol: &str,
    ) -> Result<IndicatorSnapshot> {
        let candles = self
            .fetch_ohlcv(
                ticker,
                Interval::Daily,
                self.history_years,
                self.params.min_daily_bars,
            )
            .await?;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let (ltp, source) = self.ltp_with_fallback(trading_symbol, ticker).await?;
        let series = indicators::with_provisional(&closes, ltp);

        let rsi10 = indicators::rsi(&series, self.params.rsi_period);
        let ema9 = indicators::ema(&series, self.params.ema_short);
        let ema200 = indicators::ema(&series, self.params.ema_long);
        let (Some(rsi10), Some(ema9), Some(ema200)) = (rsi10, ema9, ema200) else {
            return Err(Error::InsufficientData {
                ticker: ticker.to_string(),
                got: closes.len(),
                need: self.params.min_daily_bars,
            });
        };

        Ok(IndicatorSnapshot {
            close: ltp,
            rsi10,
            ema9,
            ema200,
            price_source: source,
        })
    }
}
