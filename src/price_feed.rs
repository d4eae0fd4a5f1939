//! Live mark-price feed over the exchange's public WebSocket stream.
//!
//! Mirrors the state machine a resilient market-data client needs:
//! `DISCONNECTED -> CONNECTING -> OPEN`, with exponential backoff on drop and
//! a bulk resubscribe the moment the socket reopens. Ticks fan out over a
//! `tokio::sync::broadcast` channel; the trigger engine is just one listener
//! among potentially several (the SSE layer also taps it for `mark_price`
//! pushes).

use crate::types::{Money, Symbol};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected = 0,
    Connecting = 1,
    Open = 2,
    Terminated = 3,
}

impl From<u8> for FeedState {
    fn from(v: u8) -> Self {
        match v {
            1 => FeedState::Connecting,
            2 => FeedState::Open,
            3 => FeedState::Terminated,
            _ => FeedState::Disconnected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PriceTick {
    pub symbol: Symbol,
    pub price: Money,
    pub ts: DateTime<Utc>,
}

enum FeedCommand {
    Subscribe(Symbol),
    Unsubscribe(Symbol),
    Shutdown,
}

/// Backoff delay before reconnect attempt `n` (1-indexed): `min(30s, 2^(n-1) * 1s)`.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64.saturating_mul(1 << attempt.saturating_sub(1).min(62));
    Duration::from_secs(secs.min(30))
}

#[derive(Clone)]
pub struct PriceFeed {
    cmd_tx: mpsc::UnboundedSender<FeedCommand>,
    tick_tx: broadcast::Sender<PriceTick>,
    last_price: Arc<Mutex<HashMap<Symbol, Money>>>,
    subscribed: Arc<Mutex<HashSet<Symbol>>>,
    state: Arc<AtomicU8>,
}

impl PriceFeed {
    /// Spawns the connection-management task and returns a handle plus the
    /// task's join handle so the caller can await clean shutdown.
    pub fn spawn(ws_url: String) -> (Self, tokio::task::JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (tick_tx, _) = broadcast::channel(1024);
        let last_price = Arc::new(Mutex::new(HashMap::new()));
        let subscribed = Arc::new(Mutex::new(HashSet::new()));
        let state = Arc::new(AtomicU8::new(FeedState::Disconnected as u8));

        let feed = PriceFeed {
            cmd_tx,
            tick_tx: tick_tx.clone(),
            last_price: last_price.clone(),
            subscribed: subscribed.clone(),
            state: state.clone(),
        };

        let handle = tokio::spawn(run_feed(ws_url, cmd_rx, tick_tx, last_price, subscribed, state));
        (feed, handle)
    }

    pub fn subscribe(&self, symbol: Symbol) {
        self.subscribed.lock().unwrap().insert(symbol.clone());
        let _ = self.cmd_tx.send(FeedCommand::Subscribe(symbol));
    }

    pub fn unsubscribe(&self, symbol: Symbol) {
        self.subscribed.lock().unwrap().remove(&symbol);
        let _ = self.cmd_tx.send(FeedCommand::Unsubscribe(symbol));
    }

    pub fn on_tick(&self) -> broadcast::Receiver<PriceTick> {
        self.tick_tx.subscribe()
    }

    pub fn last_price(&self, symbol: &Symbol) -> Option<Money> {
        self.last_price.lock().unwrap().get(symbol).copied()
    }

    pub fn is_connected(&self) -> bool {
        FeedState::from(self.state.load(Ordering::SeqCst)) == FeedState::Open
    }

    pub fn state(&self) -> FeedState {
        FeedState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(FeedCommand::Shutdown);
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BinanceMessage {
    SubResponse { id: u64, result: Option<serde_json::Value> },
    MarkPrice(MarkPriceEvent),
}

#[derive(Debug, Deserialize)]
struct MarkPriceEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "E")]
    event_time: i64,
}

async fn run_feed(
    ws_url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<FeedCommand>,
    tick_tx: broadcast::Sender<PriceTick>,
    last_price: Arc<Mutex<HashMap<Symbol, Money>>>,
    subscribed: Arc<Mutex<HashSet<Symbol>>>,
    state: Arc<AtomicU8>,
) {
    let mut attempt: u32 = 0;

    'reconnect: loop {
        if attempt > 0 {
            let delay = backoff_delay(attempt);
            warn!(attempt, delay_secs = delay.as_secs(), "reconnecting to price feed");
            tokio::time::sleep(delay).await;
        }

        state.store(FeedState::Connecting as u8, Ordering::SeqCst);
        let connect_result = tokio_tungstenite::connect_async(&ws_url).await;
        let (ws_stream, _) = match connect_result {
            Ok(pair) => pair,
            Err(e) => {
                attempt += 1;
                warn!(error = %e, attempt, "price feed connect failed");
                if attempt >= MAX_RECONNECT_ATTEMPTS {
                    warn!("price feed giving up after max reconnect attempts");
                    state.store(FeedState::Terminated as u8, Ordering::SeqCst);
                    return;
                }
                continue 'reconnect;
            }
        };

        info!(url = %ws_url, "price feed connected");
        attempt = 0;
        state.store(FeedState::Open as u8, Ordering::SeqCst);

        let (mut write, mut read) = ws_stream.split();

        // Bulk resubscribe to whatever symbols are already wanted.
        let wanted: Vec<Symbol> = subscribed.lock().unwrap().iter().cloned().collect();
        if !wanted.is_empty() {
            if let Some(frame) = subscribe_frame(&wanted, 1) {
                if write.send(Message::Text(frame)).await.is_err() {
                    continue 'reconnect;
                }
            }
        }

        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(FeedCommand::Subscribe(sym)) => {
                            if let Some(frame) = subscribe_frame(std::slice::from_ref(&sym), 2) {
                                let _ = write.send(Message::Text(frame)).await;
                            }
                        }
                        Some(FeedCommand::Unsubscribe(sym)) => {
                            if let Some(frame) = unsubscribe_frame(std::slice::from_ref(&sym), 3) {
                                let _ = write.send(Message::Text(frame)).await;
                            }
                        }
                        Some(FeedCommand::Shutdown) | None => {
                            let _ = write.close().await;
                            state.store(FeedState::Terminated as u8, Ordering::SeqCst);
                            return;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            handle_message(&text, &tick_tx, &last_price);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("price feed socket closed by peer");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "price feed read error");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        state.store(FeedState::Disconnected as u8, Ordering::SeqCst);
        attempt += 1;
    }
}

fn handle_message(
    text: &str,
    tick_tx: &broadcast::Sender<PriceTick>,
    last_price: &Arc<Mutex<HashMap<Symbol, Money>>>,
) {
    let parsed: BinanceMessage = match serde_json::from_str(text) {
        Ok(p) => p,
        Err(e) => {
            debug!(error = %e, "unparseable feed frame, ignoring");
            return;
        }
    };
    if let BinanceMessage::MarkPrice(tick) = parsed {
        let price = match tick.price.parse::<rust_decimal::Decimal>() {
            Ok(d) => Money::from_decimal(d),
            Err(_) => return,
        };
        let symbol = Symbol::new(tick.symbol);
        let ts = DateTime::from_timestamp_millis(tick.event_time).unwrap_or_else(Utc::now);
        last_price.lock().unwrap().insert(symbol.clone(), price);
        let _ = tick_tx.send(PriceTick { symbol, price, ts });
    }
}

fn subscribe_frame(symbols: &[Symbol], id: u64) -> Option<String> {
    if symbols.is_empty() {
        return None;
    }
    let params: Vec<String> = symbols.iter().map(|s| format!("{}@markPrice", s.to_lowercase())).collect();
    Some(serde_json::json!({"method": "SUBSCRIBE", "params": params, "id": id}).to_string())
}

fn unsubscribe_frame(symbols: &[Symbol], id: u64) -> Option<String> {
    if symbols.is_empty() {
        return None;
    }
    let params: Vec<String> = symbols.iter().map(|s| format!("{}@markPrice", s.to_lowercase())).collect();
    Some(serde_json::json!({"method": "UNSUBSCRIBE", "params": params, "id": id}).to_string())
}
