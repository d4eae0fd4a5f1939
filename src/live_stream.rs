//! Server-Sent Events push layer.
//!
//! Each connecting client gets its own session: a `connected` frame, an
//! `initial` snapshot of the current open positions, then `position-update`
//! and `trigger-executed` frames as they happen, with a `heartbeat` every 30s
//! so proxies and clients alike can tell a silent connection from a dead one.
//!
//! The hub fan-out uses a `tokio::sync::broadcast` channel: bounded, and a
//! slow client simply lags and misses the oldest frames rather than
//! backpressuring the whole feed. Frames are relayed from a single consumer
//! of `TriggerEngine::on_events`, so a client never observes a
//! `trigger-executed` frame out of order with respect to the `position-update`
//! frames that preceded it.

use crate::calc;
use crate::price_feed::PriceFeed;
use crate::store::Store;
use crate::trigger_engine::{EngineEvent, TriggerEngine};
use crate::types::{Money, Position, PositionStatus};
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HUB_CAPACITY: usize = 512;

/// Wire shape for a position on the live stream: the stored fields plus the
/// derived markPrice/unrealizedPnl/pnlPercent, present only when the feed
/// has a cached price for the position's symbol.
#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    #[serde(flatten)]
    pub position: Position,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mark_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unrealized_pnl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_percent: Option<f64>,
}

impl PositionView {
    fn build(position: Position, mark: Option<Money>) -> Self {
        let derived = mark.map(|mark_price| {
            use rust_decimal::prelude::ToPrimitive;
            let unrealized = calc::unrealized_pnl(position.side, position.entry_price, mark_price, position.qty);
            let percent = calc::pnl_percent(unrealized, position.qty, position.entry_price);
            (mark_price.to_f64(), unrealized.to_f64(), percent.to_f64().unwrap_or(0.0))
        });
        match derived {
            Some((mark_price, unrealized_pnl, pnl_percent)) => PositionView {
                position,
                mark_price: Some(mark_price),
                unrealized_pnl: Some(unrealized_pnl),
                pnl_percent: Some(pnl_percent),
            },
            None => PositionView { position, mark_price: None, unrealized_pnl: None, pnl_percent: None },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum StreamEvent {
    Connected,
    Initial { positions: Vec<PositionView> },
    PositionUpdate { position: PositionView },
    TriggerExecuted { position_id: i64, event: String, close_price: f64 },
    Heartbeat,
}

pub struct LiveStream {
    store: Arc<Store>,
    feed: PriceFeed,
    hub_tx: broadcast::Sender<StreamEvent>,
}

impl LiveStream {
    pub fn new(store: Arc<Store>, feed: PriceFeed, trigger_engine: Arc<TriggerEngine>) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (hub_tx, _) = broadcast::channel(HUB_CAPACITY);
        let live_stream = Arc::new(LiveStream { store, feed: feed.clone(), hub_tx: hub_tx.clone() });

        let relay_store = live_stream.store.clone();
        let relay_feed = feed;
        let handle = tokio::spawn(async move {
            let mut events = trigger_engine.on_events();
            loop {
                match events.recv().await {
                    Ok(EngineEvent::PriceUpdate { symbol, .. }) => {
                        if let Ok(positions) = relay_store.list_positions(Some(PositionStatus::Open)) {
                            for pos in positions.into_iter().filter(|p| p.symbol == symbol) {
                                let mark = relay_feed.last_price(&pos.symbol);
                                let _ = hub_tx.send(StreamEvent::PositionUpdate { position: PositionView::build(pos, mark) });
                            }
                        }
                    }
                    Ok(EngineEvent::TriggerExecuted(evt)) => {
                        let _ = hub_tx.send(StreamEvent::TriggerExecuted {
                            position_id: evt.position_id,
                            event: evt.event.to_string(),
                            close_price: evt.close_price.to_f64(),
                        });
                        if let Ok(Some(pos)) = relay_store.get_position(evt.position_id) {
                            let mark = relay_feed.last_price(&pos.symbol);
                            let _ = hub_tx.send(StreamEvent::PositionUpdate { position: PositionView::build(pos, mark) });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!(n, "live stream dropped engine events"),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        (live_stream, handle)
    }

    /// Builds the per-client SSE byte stream: connected + initial snapshot,
    /// then the hub fan-out interleaved with a 30s heartbeat.
    pub fn client_stream(
        &self,
    ) -> impl Stream<Item = Result<actix_web::web::Bytes, actix_web::Error>> + 'static {
        let initial_positions: Vec<PositionView> = self
            .store
            .list_positions(Some(PositionStatus::Open))
            .unwrap_or_default()
            .into_iter()
            .map(|pos| {
                let mark = self.feed.last_price(&pos.symbol);
                PositionView::build(pos, mark)
            })
            .collect();
        let rx = self.hub_tx.subscribe();

        let preamble = vec![
            sse_frame(&StreamEvent::Connected),
            sse_frame(&StreamEvent::Initial { positions: initial_positions }),
        ];

        let live = stream::unfold(
            (rx, tokio::time::interval(HEARTBEAT_INTERVAL)),
            |(mut rx, mut heartbeat)| async move {
                loop {
                    tokio::select! {
                        biased;
                        event = rx.recv() => {
                            match event {
                                Ok(evt) => return Some((sse_frame(&evt), (rx, heartbeat))),
                                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(broadcast::error::RecvError::Closed) => return None,
                            }
                        }
                        _ = heartbeat.tick() => {
                            return Some((sse_frame(&StreamEvent::Heartbeat), (rx, heartbeat)));
                        }
                    }
                }
            },
        );

        stream::iter(preamble.into_iter().map(Ok)).chain(live.map(Ok))
    }
}

fn sse_frame(event: &StreamEvent) -> actix_web::web::Bytes {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    actix_web::web::Bytes::from(format!("data: {json}\n\n"))
}
