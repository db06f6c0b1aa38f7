//! Market data models: bars, quotes, fundamentals, indicator snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bar interval for historical fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    Daily,
    Weekly,
}

impl Interval {
    /// Interval token used by the chart API
    pub fn as_chart_param(&self) -> &'static str {
        match self {
            Interval::Daily => "1d",
            Interval::Weekly => "1wk",
        }
    }
}

/// A single OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Broker quote snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub ltp: f64,
    #[serde(default)]
    pub avg_volume: Option<f64>,
}

/// Where a returned LTP came from, so callers can reason about freshness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Websocket,
    Fallback,
}

/// Valuation fundamentals; either side may be unavailable for a ticker
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Fundamentals {
    pub pe: Option<f64>,
    pub pb: Option<f64>,
}

/// Daily indicator state for one ticker, computed with the live LTP
/// appended as a provisional final bar
#[derive(Debug, Clone, Copy)]
pub struct IndicatorSnapshot {
    pub close: f64,
    pub rsi10: f64,
    pub ema9: f64,
    pub ema200: f64,
    pub price_source: PriceSource,
}
