//! Agent configuration
//!
//! One JSON file, every field defaulted so a minimal config is just broker
//! connection details. Pacing values that can hurt the broker relationship
//! are clamped rather than rejected.

use crate::errors::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Fixed dip-buy strategy parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_ema_short")]
    pub ema_short: usize,
    #[serde(default = "default_ema_long")]
    pub ema_long: usize,
    /// Dip buckets, deepest last
    #[serde(default = "default_entry_thresholds")]
    pub rsi_entry_thresholds: Vec<f64>,
    #[serde(default = "default_rsi_exit")]
    pub rsi_exit: f64,
    /// When true the exit side also closes at market once RSI recovers
    /// past `rsi_exit`; otherwise only the EMA9 trail exits
    #[serde(default = "default_true")]
    pub exit_on_ema9_or_rsi50: bool,
    /// Daily bars required before indicators are trusted
    #[serde(default = "default_min_daily_bars")]
    pub min_daily_bars: usize,
    /// Weekly bars below this are tolerated but logged
    #[serde(default = "default_weekly_recommended")]
    pub weekly_minimum_recommended: usize,
    /// Never place the EMA9 sell below this fraction of entry price
    #[serde(default = "default_safety_floor")]
    pub ema9_safety_floor: f64,
    #[serde(default = "default_max_reentries")]
    pub max_reentries_per_day: usize,
}

fn default_rsi_period() -> usize { 10 }
fn default_ema_short() -> usize { 9 }
fn default_ema_long() -> usize { 200 }
fn default_entry_thresholds() -> Vec<f64> { vec![30.0, 20.0, 10.0] }
fn default_rsi_exit() -> f64 { 50.0 }
fn default_true() -> bool { true }
fn default_min_daily_bars() -> usize { 200 }
fn default_weekly_recommended() -> usize { 20 }
fn default_safety_floor() -> f64 { 0.95 }
fn default_max_reentries() -> usize { 1 }

impl Default for StrategyConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Position sizing and portfolio limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Rupees deployed per trade when the candidate carries no capital hint
    #[serde(default = "default_capital_per_trade")]
    pub capital_per_trade: f64,
    #[serde(default = "default_max_portfolio")]
    pub max_portfolio_size: usize,
    #[serde(default = "default_min_combined_score")]
    pub min_combined_score: f64,
    /// Position value may not exceed this fraction of average daily volume
    #[serde(default = "default_volume_ratio")]
    pub max_position_to_avg_volume_ratio: f64,
}

fn default_capital_per_trade() -> f64 { 100_000.0 }
fn default_max_portfolio() -> usize { 6 }
fn default_min_combined_score() -> f64 { 25.0 }
fn default_volume_ratio() -> f64 { 0.10 }

impl Default for SizingConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// API pacing, worker counts, and timeout knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Global minimum spacing between outbound broker/market calls
    #[serde(default = "default_rate_limit_delay")]
    pub api_rate_limit_delay_secs: f64,
    #[serde(default = "default_max_analyses")]
    pub max_concurrent_analyses: usize,
    /// Exit-side worker pool size
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Cache hits older than this fall back to the daily close
    #[serde(default = "default_stale_threshold")]
    pub ltp_stale_threshold_secs: u64,
    /// Exit-side trailing cadence during market hours
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_base_secs: u64,
    /// Hard per-attempt timeout on broker calls
    #[serde(default = "default_call_timeout")]
    pub broker_call_timeout_secs: u64,
    #[serde(default = "default_ws_connect_timeout")]
    pub ws_connect_timeout_secs: u64,
    /// In-flight work gets this long to finish on shutdown
    #[serde(default = "default_drain")]
    pub shutdown_drain_secs: u64,
}

fn default_rate_limit_delay() -> f64 { 1.0 }
fn default_max_analyses() -> usize { 5 }
fn default_max_workers() -> usize { 10 }
fn default_stale_threshold() -> u64 { 60 }
fn default_monitor_interval() -> u64 { 60 }
fn default_reconnect_backoff() -> u64 { 5 }
fn default_call_timeout() -> u64 { 10 }
fn default_ws_connect_timeout() -> u64 { 10 }
fn default_drain() -> u64 { 30 }

impl Default for PacingConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

impl PacingConfig {
    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_secs_f64(self.api_rate_limit_delay_secs)
    }

    pub fn ltp_stale_threshold(&self) -> Duration {
        Duration::from_secs(self.ltp_stale_threshold_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn broker_call_timeout(&self) -> Duration {
        Duration::from_secs(self.broker_call_timeout_secs)
    }
}

/// Filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_ledger_file")]
    pub ledger_file: PathBuf,
    /// The analysis stage drops one candidate CSV per trading day here
    #[serde(default = "default_candidate_dir")]
    pub candidate_dir: PathBuf,
    #[serde(default = "default_scrip_cache_dir")]
    pub scrip_cache_dir: PathBuf,
}

fn default_ledger_file() -> PathBuf { PathBuf::from("data/ledger.json") }
fn default_candidate_dir() -> PathBuf { PathBuf::from("data/candidates") }
fn default_scrip_cache_dir() -> PathBuf { PathBuf::from("data/scrip_master") }

impl Default for PathsConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Broker endpoints; credentials come from the environment, never the file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Chart/fundamentals provider for historical bars
    #[serde(default = "default_history_base")]
    pub history_base: String,
}

fn default_api_base() -> String { "https://gw-napi.kotaksecurities.com".to_string() }
fn default_ws_url() -> String { "wss://mlhsm.kotaksecurities.com".to_string() }
fn default_history_base() -> String { "https://query1.finance.yahoo.com".to_string() }

impl Default for BrokerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Login credentials, read from the environment at startup
#[derive(Debug, Clone)]
pub struct Credentials {
    pub mobile_number: String,
    pub password: String,
    pub mpin: String,
    pub consumer_key: String,
}

/// Per-category notification toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Master switch
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub order_events: bool,
    #[serde(default = "default_true")]
    pub funds_alerts: bool,
    #[serde(default = "default_true")]
    pub manual_trade_alerts: bool,
    #[serde(default = "default_true")]
    pub daily_summary: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Top-level agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Exchange holidays (no scheduled tasks on these days)
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

/// Broker-tolerated pacing band; anything outside is clamped
const RATE_LIMIT_BOUNDS: (f64, f64) = (0.5, 2.0);

impl AgentConfig {
    /// Read and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config: AgentConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Clamp pacing into the tolerated band and sanity-check the rest
    pub fn validate(&mut self) -> Result<()> {
        let (lo, hi) = RATE_LIMIT_BOUNDS;
        if self.pacing.api_rate_limit_delay_secs < lo || self.pacing.api_rate_limit_delay_secs > hi
        {
            warn!(
                "api_rate_limit_delay {}s outside [{}, {}], clamping",
                self.pacing.api_rate_limit_delay_secs, lo, hi
            );
            self.pacing.api_rate_limit_delay_secs =
                self.pacing.api_rate_limit_delay_secs.clamp(lo, hi);
        }
        if self.pacing.max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".into()));
        }
        if self.sizing.capital_per_trade <= 0.0 {
            return Err(Error::Config("capital_per_trade must be positive".into()));
        }
        if self.strategy.ema9_safety_floor <= 0.0 || self.strategy.ema9_safety_floor > 1.0 {
            return Err(Error::Config(
                "ema9_safety_floor must be within (0, 1]".into(),
            ));
        }
        Ok(())
    }
}
