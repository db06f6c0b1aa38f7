//! Outbound notification surface
//!
//! The engines report noteworthy outcomes through a [`Notifier`]; the actual
//! transport (Telegram, webhook, ...) is supplied by the embedding binary.
//! The shipped implementation writes structured log lines.

use crate::config::NotificationConfig;
use crate::models::ExitReason;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

/// Events the engine surfaces to the outside world
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    OrderPlaced {
        ticker: String,
        side: String,
        qty: u32,
        price: Option<f64>,
        order_id: String,
        context: String,
    },
    OrderRejected {
        ticker: String,
        reason: String,
    },
    PartialFill {
        ticker: String,
        filled_qty: u32,
        ordered_qty: u32,
        order_id: String,
    },
    InsufficientFunds {
        ticker: String,
        required: f64,
        available: f64,
    },
    ManualTradeDetected {
        ticker: String,
        ledger_qty: u32,
        broker_qty: u32,
    },
    PositionClosed {
        ticker: String,
        exit_price: f64,
        pnl: f64,
        reason: ExitReason,
    },
    SessionAlert {
        message: String,
    },
    DailySummary {
        date: NaiveDate,
        entries: usize,
        reentries: usize,
        exits: usize,
        failed_orders: usize,
        skipped: usize,
        realized_pnl: f64,
    },
}

/// Pluggable notification transport
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotificationEvent);
}

/// Transport that renders events as structured INFO logs
pub struct LogNotifier {
    config: NotificationConfig,
}

impl LogNotifier {
    pub fn new(config: NotificationConfig) -> Self {
        Self { config }
    }

    fn wants(&self, event: &NotificationEvent) -> bool {
        if !self.config.enabled {
            return false;
        }
        match event {
            NotificationEvent::OrderPlaced { .. }
            | NotificationEvent::OrderRejected { .. }
            | NotificationEvent::PartialFill { .. }
            | NotificationEvent::PositionClosed { .. } => self.config.order_events,
            NotificationEvent::InsufficientFunds { .. } => self.config.funds_alerts,
            NotificationEvent::ManualTradeDetected { .. } => self.config.manual_trade_alerts,
            NotificationEvent::SessionAlert { .. } => true,
            NotificationEvent::DailySummary { .. } => self.config.daily_summary,
        }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotificationEvent) {
        if !self.wants(&event) {
            return;
        }
        match serde_json::to_string(&event) {
            Ok(payload) => info!(target: "neodip::notify", "{}", payload),
            Err(_) => info!(target: "neodip::notify", "{:?}", event),
        }
    }
}
