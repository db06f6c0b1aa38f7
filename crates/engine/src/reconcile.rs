//! Reconciler: broker truth vs ledger truth
//!
//! Runs on the hourly monitor and at EOD. The broker is authoritative for
//! executions; the ledger is authoritative for intent. Divergence means a
//! human (or another tool) traded the account outside this engine:
//! completed sells close the position, quantity drift adjusts it, and
//! holdings the ledger has never seen are surfaced but never managed.

use chrono::Utc;
use neodip_core::errors::{EndpointClass, Result};
use neodip_core::events::{NotificationEvent, Notifier};
use neodip_core::models::{BrokerOrder, ExitReason, Holding, OrderSide, OrderStatus, OrderType};
use neodip_core::symbols;
use neodip_networking::api::BrokerApi;
use neodip_networking::market::MarketData;
use neodip_networking::CallPipeline;
use neodip_persistence::TradeStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one reconciliation pass
#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub closed: usize,
    pub adjusted: usize,
    pub unmanaged: usize,
}

pub struct Reconciler {
    store: Arc<TradeStore>,
    broker: Arc<dyn BrokerApi>,
    pipeline: Arc<CallPipeline>,
    market: Arc<dyn MarketData>,
    notifier: Arc<dyn Notifier>,
}

impl Reconciler {
    pub fn new(
        store: Arc<TradeStore>,
        broker: Arc<dyn BrokerApi>,
        pipeline: Arc<CallPipeline>,
        market: Arc<dyn MarketData>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            broker,
            pipeline,
            market,
            notifier,
        }
    }

    pub async fn run(&self) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        let holdings = {
            let broker = self.broker.clone();
            self.pipeline
                .call(EndpointClass::Orders, move || {
                    let broker = broker.clone();
                    async move { broker.holdings().await }
                })
                .await?
        };
        let orders = {
            let broker = self.broker.clone();
            self.pipeline
                .call(EndpointClass::Orders, move || {
                    let broker = broker.clone();
                    async move { broker.orders().await }
                })
                .await?
        };

        for position in self.store.open_positions().await {
            // 1. completed sell under any variant the ledger has not seen
            let completed_sell = orders.iter().find(|o| {
                o.side == OrderSide::Sell
                    && o.status == OrderStatus::Complete
                    && symbols::same_instrument(&o.trading_symbol, &position.ticker)
            });
            if let Some(order) = completed_sell {
                self.close_from_order(&position.ticker, &position, order).await?;
                summary.closed += 1;
                continue;
            }

            // 2. quantity drift with no pending system order explaining it
            let broker_qty: u32 = holdings
                .iter()
                .filter(|h| symbols::same_instrument(&h.trading_symbol, &position.ticker))
                .map(|h| h.qty)
                .sum();
            if broker_qty == position.quantity {
                continue;
            }
            let explained = orders.iter().any(|o| {
                o.status.is_live()
                    && symbols::same_instrument(&o.trading_symbol, &position.ticker)
            });
            if explained {
                continue;
            }

            warn!(
                "manual trade detected on {}: ledger {} vs broker {}",
                position.ticker, position.quantity, broker_qty
            );
            self.notifier
                .notify(NotificationEvent::ManualTradeDetected {
                    ticker: position.ticker.clone(),
                    ledger_qty: position.quantity,
                    broker_qty,
                })
                .await;

            if broker_qty == 0 {
                // sold off entirely outside the engine
                let exit_price = match self
                    .market
                    .ltp_with_fallback(&position.trading_symbol, &position.ticker)
                    .await
                {
                    Ok((price, _)) => price,
                    Err(_) => position.entry_price,
                };
                self.store
                    .close_position(
                        &position.ticker,
                        exit_price,
                        Utc::now(),
                        ExitReason::ManualSell,
                        None,
                    )
                    .await?;
                summary.closed += 1;
            } else {
                self.store
                    .adjust_quantity(&position.ticker, broker_qty)
                    .await?;
                summary.adjusted += 1;
            }
        }

        // 3. broker holdings the ledger has never seen: surfaced, unmanaged
        summary.unmanaged = self.surface_unknown_holdings(&holdings).await;

        Ok(summary)
    }

    /// Close a position off an externally completed sell
    async fn close_from_order(
        &self,
        ticker: &str,
        position: &neodip_core::models::Position,
        order: &BrokerOrder,
    ) -> Result<()> {
        let tracked = position.sell_order_id.as_deref() == Some(order.order_id.as_str());
        let reason = if tracked {
            // the engine's own sell; it just was not reflected yet
            match order.order_type {
                OrderType::Market => ExitReason::Rsi50,
                OrderType::Limit => ExitReason::Ema9Target,
            }
        } else {
            ExitReason::ManualSell
        };
        let exit_price = order.exec_price.or(order.price).unwrap_or(position.entry_price);

        info!(
            "reconciler closing {} @ {:.2} ({})",
            ticker, exit_price, reason
        );
        let closed = self
            .store
            .close_position(ticker, exit_price, Utc::now(), reason, Some(&order.order_id))
            .await?;
        self.notifier
            .notify(NotificationEvent::PositionClosed {
                ticker: ticker.to_string(),
                exit_price,
                pnl: closed.pnl.unwrap_or_default(),
                reason,
            })
            .await;
        Ok(())
    }

    /// Manual buys are never auto-added to the ledger
    async fn surface_unknown_holdings(&self, holdings: &[Holding]) -> usize {
        let mut unmanaged = 0;
        for holding in holdings {
            if holding.qty == 0 {
                continue;
            }
            if self
                .store
                .position(&holding.trading_symbol)
                .await
                .is_some()
            {
                continue;
            }
            unmanaged += 1;
            info!(
                "unmanaged holding at broker: {} x{}",
                holding.trading_symbol, holding.qty
            );
            self.notifier
                .notify(NotificationEvent::ManualTradeDetected {
                    ticker: symbols::base_ticker(&holding.trading_symbol).to_string(),
                    ledger_qty: 0,
                    broker_qty: holding.qty,
                })
                .await;
        }
        unmanaged
    }
}
