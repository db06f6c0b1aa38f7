//! Position ledger models: fills, dip-level state, failed orders
//!
//! A position's level flags are derived from committed fills only. The
//! engines never flip a flag at signal time; `apply_fill` is the single
//! place where a level is consumed, and it runs inside the TradeStore
//! transaction that appends the fill.

use super::candidate::Candidate;
use chrono::{DateTime, Local, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// RSI dip bucket an entry consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RsiLevel {
    Thirty,
    Twenty,
    Ten,
}

impl RsiLevel {
    /// RSI threshold below which this level triggers
    pub fn threshold(&self) -> f64 {
        match self {
            RsiLevel::Thirty => 30.0,
            RsiLevel::Twenty => 20.0,
            RsiLevel::Ten => 10.0,
        }
    }
}

impl From<RsiLevel> for u8 {
    fn from(level: RsiLevel) -> u8 {
        match level {
            RsiLevel::Thirty => 30,
            RsiLevel::Twenty => 20,
            RsiLevel::Ten => 10,
        }
    }
}

impl TryFrom<u8> for RsiLevel {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            30 => Ok(RsiLevel::Thirty),
            20 => Ok(RsiLevel::Twenty),
            10 => Ok(RsiLevel::Ten),
            other => Err(format!("unknown RSI level {}", other)),
        }
    }
}

impl std::fmt::Display for RsiLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Whether a fill opened the position or pyramided into it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Initial,
    Reentry,
}

/// One broker-acknowledged buy execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub time: DateTime<Utc>,
    pub price: f64,
    pub qty: u32,
    /// Dip level this fill consumed
    pub level: RsiLevel,
    pub order_id: String,
    pub entry_kind: EntryKind,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Fill {
    pub fn new(
        time: DateTime<Utc>,
        price: f64,
        qty: u32,
        level: RsiLevel,
        order_id: &str,
        entry_kind: EntryKind,
    ) -> Self {
        Self {
            time,
            price,
            qty,
            level,
            order_id: order_id.to_string(),
            entry_kind,
            extra: serde_json::Map::new(),
        }
    }
}

/// Per-position dip-level flags for the current cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelState {
    #[serde(default)]
    pub level_30: bool,
    #[serde(default)]
    pub level_20: bool,
    #[serde(default)]
    pub level_10: bool,
    /// Set once RSI rises above 30; arms the next cycle reset
    #[serde(default)]
    pub reset_ready: bool,
}

impl LevelState {
    pub fn taken(&self, level: RsiLevel) -> bool {
        match level {
            RsiLevel::Thirty => self.level_30,
            RsiLevel::Twenty => self.level_20,
            RsiLevel::Ten => self.level_10,
        }
    }

    pub fn mark(&mut self, level: RsiLevel) {
        match level {
            RsiLevel::Thirty => self.level_30 = true,
            RsiLevel::Twenty => self.level_20 = true,
            RsiLevel::Ten => self.level_10 = true,
        }
    }

    /// Start a fresh cycle: all levels available again
    pub fn reset(&mut self) {
        *self = LevelState::default();
    }

    /// Normal in-cycle progression: 30 -> 20 -> 10, strictly in order.
    /// Cycle resets (RSI back above 30 then under again) are decided by the
    /// caller, which owns `reset_ready` persistence.
    pub fn next_level(&self, rsi10: f64) -> Option<RsiLevel> {
        if self.level_30 && !self.level_20 && rsi10 < RsiLevel::Twenty.threshold() {
            Some(RsiLevel::Twenty)
        } else if self.level_20 && !self.level_10 && rsi10 < RsiLevel::Ten.threshold() {
            Some(RsiLevel::Ten)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Ema9Target,
    Rsi50,
    ManualSell,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Ema9Target => write!(f, "ema9_target"),
            ExitReason::Rsi50 => write!(f, "rsi50"),
            ExitReason::ManualSell => write!(f, "manual_sell"),
        }
    }
}

/// Closing details, set exactly once when a position transitions to closed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitDetail {
    pub price: f64,
    pub time: DateTime<Utc>,
    pub reason: ExitReason,
    #[serde(default)]
    pub order_id: Option<String>,
}

/// Open or closed holding of one ticker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Base ticker, used for historical lookups
    pub ticker: String,
    /// Full broker symbol with series suffix; order and LTP-cache key
    pub trading_symbol: String,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub quantity: u32,
    /// Broker-acknowledged buys in time order
    pub fills: Vec<Fill>,
    #[serde(default)]
    pub levels: LevelState,
    pub status: PositionStatus,
    #[serde(default)]
    pub exit: Option<ExitDetail>,
    #[serde(default)]
    pub pnl: Option<f64>,
    /// Monotonically non-increasing trail anchor for the sell limit
    #[serde(default)]
    pub lowest_ema9_seen: Option<f64>,
    /// The one live sell order working this position, if any
    #[serde(default)]
    pub sell_order_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Position {
    /// Open a new position from its first acknowledged fill
    pub fn from_initial_fill(ticker: &str, trading_symbol: &str, fill: Fill) -> Self {
        let mut levels = LevelState::default();
        levels.mark(fill.level);
        Self {
            ticker: ticker.to_string(),
            trading_symbol: trading_symbol.to_string(),
            entry_price: fill.price,
            entry_time: fill.time,
            quantity: fill.qty,
            levels,
            fills: vec![fill],
            status: PositionStatus::Open,
            exit: None,
            pnl: None,
            lowest_ema9_seen: None,
            sell_order_id: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Append a broker-acknowledged fill and consume its level in one step
    pub fn apply_fill(&mut self, fill: Fill) {
        self.quantity += fill.qty;
        self.levels.mark(fill.level);
        self.fills.push(fill);
    }

    /// Total quantity bought across all fills
    pub fn bought_qty(&self) -> u32 {
        self.fills.iter().map(|f| f.qty).sum()
    }

    /// Cost basis across all fills
    pub fn invested(&self) -> f64 {
        self.fills.iter().map(|f| f.price * f.qty as f64).sum()
    }

    /// Re-entry fills on the given local calendar day
    pub fn reentries_on(&self, day: NaiveDate) -> usize {
        self.fills
            .iter()
            .filter(|f| {
                f.entry_kind == EntryKind::Reentry
                    && f.time.with_timezone(&Local).date_naive() == day
            })
            .count()
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// A buy attempt parked for retry (insufficient funds, transient broker fault)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedOrder {
    pub candidate: Candidate,
    #[serde(default)]
    pub first_failed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_reason: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Pre-market retry cutoff: previous-day failures survive until this local time
const PREV_DAY_CUTOFF: (u32, u32) = (9, 15);

impl FailedOrder {
    pub fn new(candidate: Candidate, reason: &str, now: DateTime<Utc>) -> Self {
        Self {
            candidate,
            first_failed_at: Some(now),
            attempts: 1,
            last_reason: reason.to_string(),
            extra: serde_json::Map::new(),
        }
    }

    /// Retention rule: day-of entries stay; yesterday's stay until 09:15
    /// local; anything older, or timestamp-less, is purged.
    pub fn expired(&self, now_local: DateTime<Local>) -> bool {
        let Some(first) = self.first_failed_at else {
            return true;
        };
        let failed_day = first.with_timezone(&Local).date_naive();
        let today = now_local.date_naive();
        if failed_day == today {
            return false;
        }
        let yesterday = today.pred_opt().unwrap_or(today);
        if failed_day == yesterday {
            let cutoff = NaiveTime::from_hms_opt(PREV_DAY_CUTOFF.0, PREV_DAY_CUTOFF.1, 0)
                .expect("valid cutoff time");
            return now_local.time() >= cutoff;
        }
        true
    }
}
