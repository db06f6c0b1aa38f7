//! Live LTP cache fed by the broker WebSocket
//!
//! The cache maps full trading symbols to their last traded price and is
//! the first stop for every price lookup; readers decide staleness from
//! the returned age. The feed task owns the connection: it reconnects with
//! backoff, resubscribes the current set, and throttles repeated
//! connection notices so reconnect storms don't flood the log.

use crate::api::ScripTable;
use futures_util::{SinkExt, StreamExt};
use neodip_core::errors::{Error, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Suppress duplicate connection-established notices within this window
const CONNECT_LOG_WINDOW: Duration = Duration::from_secs(60);

/// Cap for the reconnect backoff ladder
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);

// ─── Cache ───────────────────────────────────────────────────────────

struct TickEntry {
    price: f64,
    at: Instant,
}

/// Thread-safe symbol -> (price, age) map. Writers are the WebSocket
/// handler; readers are the exit workers.
#[derive(Default)]
pub struct LivePriceCache {
    map: RwLock<HashMap<String, TickEntry>>,
}

impl LivePriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last traded price and its age, if the symbol has ever ticked
    pub fn get(&self, trading_symbol: &str) -> Option<(f64, Duration)> {
        let map = self.map.read().ok()?;
        let entry = map.get(trading_symbol)?;
        Some((entry.price, entry.at.elapsed()))
    }

    pub fn update(&self, trading_symbol: &str, price: f64) {
        if let Ok(mut map) = self.map.write() {
            map.insert(
                trading_symbol.to_string(),
                TickEntry {
                    price,
                    at: Instant::now(),
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Feed ────────────────────────────────────────────────────────────

enum FeedCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// Handle for subscribing symbols and awaiting connection readiness
#[derive(Clone)]
pub struct PriceFeedHandle {
    commands: mpsc::Sender<FeedCommand>,
    connected: watch::Receiver<bool>,
}

impl PriceFeedHandle {
    /// Add symbols to the live subscription set
    pub async fn subscribe(&self, trading_symbols: Vec<String>) {
        if trading_symbols.is_empty() {
            return;
        }
        let _ = self.commands.send(FeedCommand::Subscribe(trading_symbols)).await;
    }

    pub async fn unsubscribe(&self, trading_symbols: Vec<String>) {
        if trading_symbols.is_empty() {
            return;
        }
        let _ = self
            .commands
            .send(FeedCommand::Unsubscribe(trading_symbols))
            .await;
    }

    /// Block until the socket is connected, bounded. Subscribers must call
    /// this before trusting the first cache read.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        let mut connected = self.connected.clone();
        let deadline = Instant::now() + timeout;
        loop {
            if *connected.borrow_and_update() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::WebSocket("connect wait timed out".to_string()));
            }
            match tokio::time::timeout_at(deadline, connected.changed()).await {
                Ok(Ok(())) => continue,
                _ => return Err(Error::WebSocket("connect wait timed out".to_string())),
            }
        }
    }
}

/// Tick payload from the broker stream
#[derive(Debug, Deserialize)]
struct TickMessage {
    #[serde(alias = "tk")]
    token: String,
    #[serde(alias = "ltp", alias = "lp")]
    price: f64,
}

/// Spawn the feed task. `scrips` maps trading symbol -> instrument token;
/// ticks arrive keyed by token and are resolved back before hitting the
/// cache.
pub fn spawn_price_feed(
    ws_url: String,
    scrips: Arc<ScripTable>,
    cache: Arc<LivePriceCache>,
    reconnect_backoff_base: Duration,
    cancel: CancellationToken,
) -> PriceFeedHandle {
    let (commands_tx, commands_rx) = mpsc::channel(64);
    let (connected_tx, connected_rx) = watch::channel(false);

    tokio::spawn(feed_loop(
        ws_url,
        scrips,
        cache,
        reconnect_backoff_base,
        commands_rx,
        connected_tx,
        cancel,
    ));

    PriceFeedHandle {
        commands: commands_tx,
        connected: connected_rx,
    }
}

async fn feed_loop(
    ws_url: String,
    scrips: Arc<ScripTable>,
    cache: Arc<LivePriceCache>,
    backoff_base: Duration,
    mut commands: mpsc::Receiver<FeedCommand>,
    connected_tx: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    // token -> symbol for inbound ticks
    let by_token: HashMap<String, String> = scrips
        .iter()
        .map(|(symbol, token)| (token.clone(), symbol.clone()))
        .collect();

    let mut subscribed: HashSet<String> = HashSet::new();
    let mut reconnect_attempt: u32 = 0;
    let mut last_connect_log: Option<Instant> = None;

    loop {
        if cancel.is_cancelled() {
            info!("Price feed cancelled, exiting");
            return;
        }

        let (mut sink, mut stream) = match connect_async(&ws_url).await {
            Ok((socket, _)) => {
                reconnect_attempt = 0;
                let throttled = last_connect_log
                    .map(|at| at.elapsed() < CONNECT_LOG_WINDOW)
                    .unwrap_or(false);
                if throttled {
                    debug!("Price feed connected (repeat notice suppressed)");
                } else {
                    info!("Price feed connected to {}", ws_url);
                    last_connect_log = Some(Instant::now());
                }
                let _ = connected_tx.send(true);
                socket.split()
            }
            Err(e) => {
                let delay = (backoff_base * 2u32.saturating_pow(reconnect_attempt))
                    .min(RECONNECT_BACKOFF_MAX);
                reconnect_attempt = reconnect_attempt.saturating_add(1);
                warn!("Price feed connect failed ({}), retrying in {:?}", e, delay);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        // replay the current subscription set on every (re)connect
        if !subscribed.is_empty() {
            let tokens: Vec<&str> = subscribed
                .iter()
                .filter_map(|s| scrips.get(s).map(String::as_str))
                .collect();
            if let Err(e) = send_subscription(&mut sink, "subscribe", &tokens).await {
                warn!("Resubscribe failed: {}", e);
                let _ = connected_tx.send(false);
                continue;
            }
            debug!("Resubscribed {} symbols", tokens.len());
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    info!("Price feed cancelled, exiting");
                    return;
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("Price feed command channel closed");
                        return;
                    };
                    let (action, symbols) = match &command {
                        FeedCommand::Subscribe(symbols) => ("subscribe", symbols),
                        FeedCommand::Unsubscribe(symbols) => ("unsubscribe", symbols),
                    };
                    let tokens: Vec<&str> = symbols
                        .iter()
                        .filter_map(|s| scrips.get(s).map(String::as_str))
                        .collect();
                    match &command {
                        FeedCommand::Subscribe(symbols) => {
                            subscribed.extend(symbols.iter().cloned());
                        }
                        FeedCommand::Unsubscribe(symbols) => {
                            for symbol in symbols {
                                subscribed.remove(symbol);
                            }
                        }
                    }
                    if let Err(e) = send_subscription(&mut sink, action, &tokens).await {
                        warn!("Subscription send failed ({}), reconnecting", e);
                        break;
                    }
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            handle_tick(&text, &by_token, &cache);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("Price feed stream closed, reconnecting");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Price feed read error ({}), reconnecting", e);
                            break;
                        }
                    }
                }
            }
        }

        let _ = connected_tx.send(false);
        let delay = backoff_base.min(RECONNECT_BACKOFF_MAX);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn send_subscription<S>(sink: &mut S, action: &str, tokens: &[&str]) -> Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    if tokens.is_empty() {
        return Ok(());
    }
    let payload = serde_json::json!({
        "action": action,
        "tokens": tokens,
    });
    sink.send(Message::Text(payload.to_string()))
        .await
        .map_err(|e| Error::WebSocket(e.to_string()))
}

fn handle_tick(text: &str, by_token: &HashMap<String, String>, cache: &LivePriceCache) {
    // tick frames may batch several instruments
    let ticks: Vec<TickMessage> = match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Array(_)) => serde_json::from_str(text).unwrap_or_default(),
        Ok(_) => serde_json::from_str::<TickMessage>(text)
            .map(|t| vec![t])
            .unwrap_or_default(),
        Err(_) => Vec::new(),
    };
    for tick in ticks {
        match by_token.get(&tick.token) {
            Some(symbol) => cache.update(symbol, tick.price),
            None => debug!("tick for unknown token {}", tick.token),
        }
    }
}
