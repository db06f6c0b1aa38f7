//! TradeStore: the single source of truth for positions and failed orders
//!
//! One JSON file, replaced atomically (write temp in the same directory,
//! fsync, rename) so a crash mid-write leaves either the prior or the new
//! full ledger. All mutation goes through a single writer mutex; the lock
//! is never held across network I/O because the store does none.

use chrono::{DateTime, Local, Utc};
use neodip_core::errors::{Error, Result};
use neodip_core::models::{
    Candidate, ExitDetail, ExitReason, Fill, Position, PositionStatus, RsiLevel,
};
use neodip_core::symbols;
use neodip_core::FailedOrder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// On-disk ledger layout. Unknown fields written by newer builds survive a
/// load/save cycle untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub failed_orders: Vec<FailedOrder>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Persistent position ledger with a single-writer mutex
pub struct TradeStore {
    path: PathBuf,
    inner: Mutex<Ledger>,
}

impl TradeStore {
    /// Open (or create) the ledger at `path`, migrating any legacy layouts
    pub async fn open(path: &Path) -> Result<Self> {
        let ledger = match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let mut ledger: Ledger = serde_json::from_str(&raw)
                    .map_err(|e| Error::Persistence(format!("corrupt ledger: {}", e)))?;
                let migrated = migrate_legacy_reentries(&mut ledger);
                if migrated > 0 {
                    info!("migrated {} legacy re-entry records into fills", migrated);
                }
                ledger
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no ledger at {}, starting empty", path.display());
                Ledger::default()
            }
            Err(e) => return Err(Error::Persistence(e.to_string())),
        };

        let store = Self {
            path: path.to_path_buf(),
            inner: Mutex::new(ledger),
        };
        // write-through once so migrations and a fresh file hit disk
        store.save().await?;
        Ok(store)
    }

    /// Persist the current ledger atomically
    pub async fn save(&self) -> Result<()> {
        let ledger = self.inner.lock().await;
        write_atomic(&self.path, &ledger).await
    }

    /// A consistent copy of the full ledger
    pub async fn snapshot(&self) -> Ledger {
        self.inner.lock().await.clone()
    }

    pub async fn open_positions(&self) -> Vec<Position> {
        self.inner
            .lock()
            .await
            .positions
            .iter()
            .filter(|p| p.is_open())
            .cloned()
            .collect()
    }

    /// Look up a position by base ticker (series suffixes ignored)
    pub async fn position(&self, ticker: &str) -> Option<Position> {
        self.inner
            .lock()
            .await
            .positions
            .iter()
            .find(|p| symbols::same_instrument(&p.ticker, ticker))
            .cloned()
    }

    /// Append a broker-acknowledged fill, creating the position if absent.
    /// The level flag is consumed in the same transaction as the append.
    pub async fn add_fill(&self, ticker: &str, trading_symbol: &str, fill: Fill) -> Result<Position> {
        let mut ledger = self.inner.lock().await;
        let position = match ledger
            .positions
            .iter_mut()
            .find(|p| p.is_open() && symbols::same_instrument(&p.ticker, ticker))
        {
            Some(existing) => {
                existing.apply_fill(fill);
                existing.clone()
            }
            None => {
                let created = Position::from_initial_fill(ticker, trading_symbol, fill);
                ledger.positions.push(created.clone());
                created
            }
        };
        write_atomic(&self.path, &ledger).await?;
        Ok(position)
    }

    /// Transition a position to closed and realize its P&L
    pub async fn close_position(
        &self,
        ticker: &str,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
        exit_order_id: Option<&str>,
    ) -> Result<Position> {
        let mut ledger = self.inner.lock().await;
        let position = ledger
            .positions
            .iter_mut()
            .find(|p| p.is_open() && symbols::same_instrument(&p.ticker, ticker))
            .ok_or_else(|| Error::InvalidData(format!("no open position for {}", ticker)))?;

        let proceeds = exit_price * position.quantity as f64;
        position.pnl = Some(proceeds - position.invested());
        position.status = PositionStatus::Closed;
        position.exit = Some(ExitDetail {
            price: exit_price,
            time: exit_time,
            reason,
            order_id: exit_order_id.map(str::to_string),
        });
        position.sell_order_id = None;
        let closed = position.clone();

        write_atomic(&self.path, &ledger).await?;
        Ok(closed)
    }

    pub async fn mark_reset_ready(&self, ticker: &str, ready: bool) -> Result<()> {
        self.update_open(ticker, |p| p.levels.reset_ready = ready).await
    }

    pub async fn reset_levels(&self, ticker: &str) -> Result<()> {
        self.update_open(ticker, |p| p.levels.reset()).await
    }

    pub async fn mark_level_taken(&self, ticker: &str, level: RsiLevel) -> Result<()> {
        self.update_open(ticker, |p| p.levels.mark(level)).await
    }

    /// Record the live sell order working a position (None clears it)
    pub async fn set_sell_order(&self, ticker: &str, order_id: Option<String>) -> Result<()> {
        self.update_open(ticker, |p| p.sell_order_id = order_id.clone())
            .await
    }

    /// Lower the trail anchor; the anchor never rises
    pub async fn set_lowest_ema9(&self, ticker: &str, value: f64) -> Result<()> {
        self.update_open(ticker, |p| {
            match p.lowest_ema9_seen {
                Some(current) if value >= current => {}
                _ => p.lowest_ema9_seen = Some(value),
            }
        })
        .await
    }

    /// Reconciler adjustment when broker holdings diverge from the ledger
    pub async fn adjust_quantity(&self, ticker: &str, broker_qty: u32) -> Result<()> {
        self.update_open(ticker, |p| {
            warn!(
                "adjusting {} quantity {} -> {} after broker divergence",
                p.ticker, p.quantity, broker_qty
            );
            p.quantity = broker_qty;
        })
        .await
    }

    /// Re-entry fills recorded today (local calendar day)
    pub async fn reentries_today(&self, ticker: &str) -> usize {
        let today = Local::now().date_naive();
        self.inner
            .lock()
            .await
            .positions
            .iter()
            .find(|p| p.is_open() && symbols::same_instrument(&p.ticker, ticker))
            .map(|p| p.reentries_on(today))
            .unwrap_or(0)
    }

    /// Park a failed buy for the pre-market retry pass. A repeat failure for
    /// the same ticker bumps the attempt count instead of duplicating.
    pub async fn enqueue_failed(&self, candidate: Candidate, reason: &str) -> Result<()> {
        let mut ledger = self.inner.lock().await;
        match ledger
            .failed_orders
            .iter_mut()
            .find(|f| symbols::same_instrument(&f.candidate.ticker, &candidate.ticker))
        {
            Some(existing) => {
                existing.attempts += 1;
                existing.last_reason = reason.to_string();
            }
            None => ledger
                .failed_orders
                .push(FailedOrder::new(candidate, reason, Utc::now())),
        }
        write_atomic(&self.path, &ledger).await
    }

    pub async fn failed_orders(&self) -> Vec<FailedOrder> {
        self.inner.lock().await.failed_orders.clone()
    }

    /// Drop a parked order once it has been placed (or given up on)
    pub async fn remove_failed(&self, ticker: &str) -> Result<()> {
        let mut ledger = self.inner.lock().await;
        ledger
            .failed_orders
            .retain(|f| !symbols::same_instrument(&f.candidate.ticker, ticker));
        write_atomic(&self.path, &ledger).await
    }

    /// Apply the retention rules; returns how many entries were purged
    pub async fn purge_expired_failed(&self, now_local: DateTime<Local>) -> Result<usize> {
        let mut ledger = self.inner.lock().await;
        let before = ledger.failed_orders.len();
        ledger.failed_orders.retain(|f| !f.expired(now_local));
        let purged = before - ledger.failed_orders.len();
        if purged > 0 {
            write_atomic(&self.path, &ledger).await?;
        }
        Ok(purged)
    }

    async fn update_open<F>(&self, ticker: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Position),
    {
        let mut ledger = self.inner.lock().await;
        let position = ledger
            .positions
            .iter_mut()
            .find(|p| p.is_open() && symbols::same_instrument(&p.ticker, ticker))
            .ok_or_else(|| Error::InvalidData(format!("no open position for {}", ticker)))?;
        mutate(position);
        write_atomic(&self.path, &ledger).await
    }
}

/// Replace the ledger file atomically: temp in the same directory, fsync,
/// rename over the target.
async fn write_atomic(path: &Path, ledger: &Ledger) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let data = serde_json::to_vec_pretty(ledger)
        .map_err(|e| Error::Persistence(format!("serialize ledger: {}", e)))?;

    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&data).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Fold a legacy nested `reentries` array into the canonical fills list.
/// Returns the number of records migrated.
fn migrate_legacy_reentries(ledger: &mut Ledger) -> usize {
    let mut migrated = 0;
    for position in &mut ledger.positions {
        let Some(raw) = position.extra.remove("reentries") else {
            continue;
        };
        let Some(entries) = raw.as_array() else {
            continue;
        };
        for entry in entries {
            if let Some(fill) = legacy_entry_to_fill(entry) {
                position.fills.push(fill);
                migrated += 1;
            } else {
                warn!(
                    "unparseable legacy re-entry on {}, dropping: {}",
                    position.ticker, entry
                );
            }
        }
        position.fills.sort_by_key(|f| f.time);
    }
    migrated
}

fn legacy_entry_to_fill(entry: &serde_json::Value) -> Option<Fill> {
    let time = entry
        .get("time")
        .or_else(|| entry.get("date"))
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))?;
    let price = entry.get("price").and_then(|v| v.as_f64())?;
    let qty = entry
        .get("qty")
        .or_else(|| entry.get("quantity"))
        .and_then(|v| v.as_u64())? as u32;
    let level = entry
        .get("level")
        .and_then(|v| v.as_u64())
        .and_then(|v| RsiLevel::try_from(v as u8).ok())
        .unwrap_or(RsiLevel::Thirty);
    let order_id = entry
        .get("order_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    Some(Fill::new(
        time,
        price,
        qty,
        level,
        order_id,
        neodip_core::EntryKind::Reentry,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use neodip_core::models::{EntryKind, Verdict};
    use tempfile::tempdir;

    fn fill(price: f64, qty: u32, level: RsiLevel, kind: EntryKind) -> Fill {
        Fill::new(Utc::now(), price, qty, level, "ORD-1", kind)
    }

    fn candidate(ticker: &str) -> Candidate {
        Candidate {
            ticker: ticker.into(),
            last_close: 2450.50,
            final_verdict: Verdict::Buy,
            combined_score: 42.0,
            execution_capital: Some(100_000.0),
        }
    }

    #[tokio::test]
    async fn add_fill_creates_then_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let store = TradeStore::open(&path).await.unwrap();

        let pos = store
            .add_fill(
                "RELIANCE",
                "RELIANCE-EQ",
                fill(2450.50, 40, RsiLevel::Thirty, EntryKind::Initial),
            )
            .await
            .unwrap();
        assert_eq!(pos.quantity, 40);
        assert!(pos.levels.level_30);

        let pos = store
            .add_fill(
                "RELIANCE-EQ",
                "RELIANCE-EQ",
                fill(2300.0, 43, RsiLevel::Twenty, EntryKind::Reentry),
            )
            .await
            .unwrap();
        assert_eq!(pos.quantity, 83);
        assert!(pos.levels.level_20);
        assert_eq!(store.open_positions().await.len(), 1);
    }

    #[tokio::test]
    async fn close_position_realizes_pnl() {
        let dir = tempdir().unwrap();
        let store = TradeStore::open(&dir.path().join("ledger.json")).await.unwrap();
        store
            .add_fill(
                "TCS",
                "TCS-EQ",
                fill(4000.0, 25, RsiLevel::Thirty, EntryKind::Initial),
            )
            .await
            .unwrap();

        let closed = store
            .close_position("TCS", 4100.0, Utc::now(), ExitReason::Ema9Target, Some("SO-9"))
            .await
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        let pnl = closed.pnl.unwrap();
        assert!((pnl - 2500.0).abs() < 1e-6, "pnl {}", pnl);
        assert!(store.open_positions().await.is_empty());
    }

    #[tokio::test]
    async fn pyramided_close_realizes_blended_pnl() {
        let dir = tempdir().unwrap();
        let store = TradeStore::open(&dir.path().join("ledger.json")).await.unwrap();
        store
            .add_fill(
                "RELIANCE",
                "RELIANCE-EQ",
                fill(2450.50, 40, RsiLevel::Thirty, EntryKind::Initial),
            )
            .await
            .unwrap();
        store
            .add_fill(
                "RELIANCE",
                "RELIANCE-EQ",
                fill(2300.0, 43, RsiLevel::Twenty, EntryKind::Reentry),
            )
            .await
            .unwrap();

        let closed = store
            .close_position("RELIANCE", 2400.0, Utc::now(), ExitReason::Ema9Target, Some("SO-1"))
            .await
            .unwrap();
        let invested = 2450.50 * 40.0 + 2300.0 * 43.0;
        let proceeds = 2400.0 * 83.0;
        assert!((closed.pnl.unwrap() - (proceeds - invested)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn ledger_roundtrip_preserves_unknown_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let raw = serde_json::json!({
            "positions": [{
                "ticker": "INFY",
                "trading_symbol": "INFY-EQ",
                "entry_price": 1500.0,
                "entry_time": "2025-06-10T05:00:00Z",
                "quantity": 66,
                "fills": [{
                    "time": "2025-06-10T05:00:00Z",
                    "price": 1500.0,
                    "qty": 66,
                    "level": 30,
                    "order_id": "OB-1",
                    "entry_kind": "initial",
                    "exchange_ref": "NSE-123"
                }],
                "status": "open",
                "broker_note": "kept by hand"
            }],
            "failed_orders": [],
            "schema_hint": 3
        });
        tokio::fs::write(&path, serde_json::to_vec_pretty(&raw).unwrap())
            .await
            .unwrap();

        let store = TradeStore::open(&path).await.unwrap();
        store.save().await.unwrap();

        let reread: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(reread["schema_hint"], 3);
        assert_eq!(reread["positions"][0]["broker_note"], "kept by hand");
        assert_eq!(reread["positions"][0]["fills"][0]["exchange_ref"], "NSE-123");
    }

    #[tokio::test]
    async fn legacy_reentries_array_is_migrated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let raw = serde_json::json!({
            "positions": [{
                "ticker": "SBIN",
                "trading_symbol": "SBIN-EQ",
                "entry_price": 800.0,
                "entry_time": "2025-06-10T05:00:00Z",
                "quantity": 250,
                "fills": [{
                    "time": "2025-06-10T05:00:00Z",
                    "price": 800.0,
                    "qty": 125,
                    "level": 30,
                    "order_id": "OB-1",
                    "entry_kind": "initial"
                }],
                "status": "open",
                "reentries": [{
                    "time": "2025-06-12T06:30:00+00:00",
                    "price": 760.0,
                    "quantity": 125,
                    "level": 20,
                    "order_id": "OB-2"
                }]
            }]
        });
        tokio::fs::write(&path, serde_json::to_vec_pretty(&raw).unwrap())
            .await
            .unwrap();

        let store = TradeStore::open(&path).await.unwrap();
        let pos = store.position("SBIN").await.unwrap();
        assert_eq!(pos.fills.len(), 2);
        assert_eq!(pos.fills[1].entry_kind, EntryKind::Reentry);
        assert_eq!(pos.fills[1].qty, 125);
        assert!(pos.extra.get("reentries").is_none());

        // counted by the canonical rule from now on
        let reread: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert!(reread["positions"][0].get("reentries").is_none());
    }

    #[tokio::test]
    async fn enqueue_failed_deduplicates_per_ticker() {
        let dir = tempdir().unwrap();
        let store = TradeStore::open(&dir.path().join("ledger.json")).await.unwrap();
        store
            .enqueue_failed(candidate("HDFCBANK"), "insufficient_funds")
            .await
            .unwrap();
        store
            .enqueue_failed(candidate("HDFCBANK"), "insufficient_funds")
            .await
            .unwrap();

        let failed = store.failed_orders().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 2);
    }

    #[tokio::test]
    async fn trail_anchor_never_rises() {
        let dir = tempdir().unwrap();
        let store = TradeStore::open(&dir.path().join("ledger.json")).await.unwrap();
        store
            .add_fill(
                "RELIANCE",
                "RELIANCE-EQ",
                fill(2450.0, 40, RsiLevel::Thirty, EntryKind::Initial),
            )
            .await
            .unwrap();

        store.set_lowest_ema9("RELIANCE", 2500.0).await.unwrap();
        store.set_lowest_ema9("RELIANCE", 2480.0).await.unwrap();
        store.set_lowest_ema9("RELIANCE", 2490.0).await.unwrap();
        let pos = store.position("RELIANCE").await.unwrap();
        assert_eq!(pos.lowest_ema9_seen, Some(2480.0));
    }

    #[tokio::test]
    async fn save_survives_repeated_cycles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        {
            let store = TradeStore::open(&path).await.unwrap();
            store
                .add_fill(
                    "WIPRO",
                    "WIPRO-EQ",
                    fill(500.0, 200, RsiLevel::Thirty, EntryKind::Initial),
                )
                .await
                .unwrap();
        }
        // reopen: position still there, file parses cleanly
        let store = TradeStore::open(&path).await.unwrap();
        let pos = store.position("WIPRO").await.unwrap();
        assert_eq!(pos.quantity, 200);
        assert!(!path.with_extension("tmp").exists());
    }
}
