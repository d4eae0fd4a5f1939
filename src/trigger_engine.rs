//! Evaluates every open position against each incoming price tick and closes
//! the ones whose stop-loss or take-profit predicate fires.
//!
//! Stop-loss is always checked before take-profit, and a stop-loss firing
//! short-circuits the take-profit check on the same tick - this is what
//! makes a LONG position with `sl=95, tp=94` at `mark=94` resolve as a loss
//! rather than a (contradictory) simultaneous win.

use crate::calc;
use crate::store::Store;
use crate::price_feed::PriceFeed;
use crate::types::{EventKind, Money, Symbol};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct TriggerExecuted {
    pub position_id: i64,
    pub symbol: Symbol,
    pub event: EventKind,
    pub close_price: Money,
}

/// Everything a listener can observe on the engine's own channel, linearized
/// through the single tick-processing task so a `TriggerExecuted` always
/// arrives after every `PriceUpdate` derived from an earlier tick.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PriceUpdate { symbol: Symbol, mark_price: Money, ts: DateTime<Utc> },
    TriggerExecuted(TriggerExecuted),
}

pub struct TriggerEngine {
    store: Arc<Store>,
    feed: PriceFeed,
    index: Arc<Mutex<HashMap<Symbol, HashSet<i64>>>>,
    events_tx: broadcast::Sender<EngineEvent>,
}

impl TriggerEngine {
    pub fn new(store: Arc<Store>, feed: PriceFeed) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        TriggerEngine {
            store,
            feed,
            index: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
        }
    }

    /// One linearized channel carrying both `PriceUpdate` and
    /// `TriggerExecuted` events, in the order the engine produced them.
    pub fn on_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    /// Adds a position to the symbol index, subscribing the feed if this is
    /// the first open position for that symbol.
    pub fn register_position(&self, symbol: &Symbol, position_id: i64) {
        let mut index = self.index.lock().unwrap();
        let entry = index.entry(symbol.clone()).or_default();
        let was_empty = entry.is_empty();
        entry.insert(position_id);
        if was_empty {
            self.feed.subscribe(symbol.clone());
        }
    }

    /// Removes a position from the index, unsubscribing the feed once no
    /// open positions remain for that symbol.
    pub fn unregister_position(&self, symbol: &Symbol, position_id: i64) {
        let mut index = self.index.lock().unwrap();
        if let Some(set) = index.get_mut(symbol) {
            set.remove(&position_id);
            if set.is_empty() {
                index.remove(symbol);
                self.feed.unsubscribe(symbol.clone());
            }
        }
    }

    /// Seeds the index from the store's currently OPEN positions. Called
    /// once at startup to recover feed subscriptions after a restart.
    pub fn recover_open_positions(&self) -> crate::error::AppResult<usize> {
        let open = self.store.list_positions(Some(crate::types::PositionStatus::Open))?;
        let count = open.len();
        for pos in &open {
            self.register_position(&pos.symbol, pos.id);
        }
        info!(count, "trigger engine recovered open positions");
        Ok(count)
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticks = self.feed.on_tick();
            loop {
                match ticks.recv().await {
                    Ok(tick) => self.evaluate_tick(&tick).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "trigger engine lagged behind price feed");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Runs one tick's worth of SL/TP evaluation against every open
    /// position registered for its symbol. Exposed publicly so tests can
    /// drive the engine deterministically without a live socket.
    pub async fn evaluate_tick(&self, tick: &crate::price_feed::PriceTick) {
        // Every accepted tick gets a priceUpdate, even if no open position
        // is currently registered for its symbol.
        let _ = self.events_tx.send(EngineEvent::PriceUpdate {
            symbol: tick.symbol.clone(),
            mark_price: tick.price,
            ts: tick.ts,
        });

        let ids: Vec<i64> = {
            let index = self.index.lock().unwrap();
            match index.get(&tick.symbol) {
                Some(set) => set.iter().copied().collect(),
                None => return,
            }
        };
        if ids.is_empty() {
            return;
        }

        let taker_fee = match self.store.get_settings() {
            Ok(s) => s.taker_fee,
            Err(e) => {
                warn!(error = %e, "failed to load settings for trigger fee calc");
                return;
            }
        };

        for id in ids {
            let position = match self.store.get_position(id) {
                Ok(Some(p)) if p.is_open() => p,
                Ok(Some(_)) => {
                    // Already closed by a manual close racing this tick.
                    self.unregister_position(&tick.symbol, id);
                    continue;
                }
                Ok(None) => {
                    self.unregister_position(&tick.symbol, id);
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, id, "failed to load position during trigger evaluation");
                    continue;
                }
            };

            if calc::should_trigger_sl(position.side, tick.price, position.sl) {
                self.close_for_trigger(&position, tick.price, taker_fee, EventKind::SlTriggered).await;
                continue;
            }
            if calc::should_trigger_tp(position.side, tick.price, position.tp) {
                self.close_for_trigger(&position, tick.price, taker_fee, EventKind::TpTriggered).await;
            }
        }
    }

    async fn close_for_trigger(
        &self,
        position: &crate::types::Position,
        close_price: Money,
        taker_fee: rust_decimal::Decimal,
        event: EventKind,
    ) {
        let fee = calc::fee(calc::notional(position.qty, close_price), taker_fee);
        match self.store.close_position(position.id, close_price, fee, event) {
            Ok(Some(_)) => {
                self.unregister_position(&position.symbol, position.id);
                info!(position_id = position.id, %event, close_price = %close_price, "position closed by trigger");
                let _ = self.events_tx.send(EngineEvent::TriggerExecuted(TriggerExecuted {
                    position_id: position.id,
                    symbol: position.symbol.clone(),
                    event,
                    close_price,
                }));
            }
            Ok(None) => {
                // Lost the race (e.g. to a manual close); nothing to do.
                self.unregister_position(&position.symbol, position.id);
            }
            Err(e) => {
                warn!(error = %e, position_id = position.id, "failed to close triggered position");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewPosition;
    use crate::types::{Side, SizeMode};

    fn open_pos(store: &Store, symbol: &str, side: Side, sl: Option<Money>, tp: Option<Money>) -> crate::types::Position {
        let req = NewPosition {
            symbol: Symbol::new(symbol),
            side,
            size_mode: SizeMode::Usdt,
            size_value: Money::from_f64(1000.0),
            leverage: 1,
            notes: None,
            sl,
            tp,
        };
        store.create_position(&req, Money::from_f64(100.0), Money::from_f64(0.4)).unwrap()
    }

    #[tokio::test]
    async fn sl_short_circuits_tp_on_same_tick() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (feed, _handle) = PriceFeed::spawn("ws://unused.invalid".to_string());
        let pos = open_pos(&store, "BTCUSDT", Side::Long, Some(Money::from_f64(95.0)), Some(Money::from_f64(94.0)));

        let engine = Arc::new(TriggerEngine::new(store.clone(), feed.clone()));
        engine.register_position(&pos.symbol, pos.id);

        let tick = crate::price_feed::PriceTick {
            symbol: pos.symbol.clone(),
            price: Money::from_f64(94.0),
            ts: chrono::Utc::now(),
        };
        engine.evaluate_tick(&tick).await;

        let fetched = store.get_position(pos.id).unwrap().unwrap();
        assert!(!fetched.is_open());
        let events = store.list_events(Some(pos.id), None).unwrap();
        assert!(events.iter().any(|e| e.event == EventKind::SlTriggered));
        assert!(!events.iter().any(|e| e.event == EventKind::TpTriggered));
    }

    #[tokio::test]
    async fn unrelated_symbol_tick_is_ignored() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (feed, _handle) = PriceFeed::spawn("ws://unused.invalid".to_string());
        let pos = open_pos(&store, "BTCUSDT", Side::Long, Some(Money::from_f64(95.0)), None);
        let engine = Arc::new(TriggerEngine::new(store.clone(), feed.clone()));
        engine.register_position(&pos.symbol, pos.id);

        let tick = crate::price_feed::PriceTick {
            symbol: Symbol::new("ETHUSDT"),
            price: Money::from_f64(1.0),
            ts: chrono::Utc::now(),
        };
        engine.evaluate_tick(&tick).await;

        let fetched = store.get_position(pos.id).unwrap().unwrap();
        assert!(fetched.is_open());
    }

    #[tokio::test]
    async fn unregister_unsubscribes_once_symbol_has_no_open_positions() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (feed, _handle) = PriceFeed::spawn("ws://unused.invalid".to_string());
        let pos = open_pos(&store, "BTCUSDT", Side::Long, Some(Money::from_f64(95.0)), None);
        let engine = TriggerEngine::new(store.clone(), feed.clone());
        engine.register_position(&pos.symbol, pos.id);
        engine.unregister_position(&pos.symbol, pos.id);

        let index = engine.index.lock().unwrap();
        assert!(!index.contains_key(&pos.symbol));
    }

    #[tokio::test]
    async fn evaluate_tick_always_emits_price_update() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (feed, _handle) = PriceFeed::spawn("ws://unused.invalid".to_string());
        let engine = TriggerEngine::new(store.clone(), feed.clone());
        let mut events = engine.on_events();

        let tick = crate::price_feed::PriceTick {
            symbol: Symbol::new("BTCUSDT"),
            price: Money::from_f64(100.0),
            ts: chrono::Utc::now(),
        };
        engine.evaluate_tick(&tick).await;

        match events.try_recv().unwrap() {
            EngineEvent::PriceUpdate { symbol, mark_price, .. } => {
                assert_eq!(symbol, Symbol::new("BTCUSDT"));
                assert_eq!(mark_price, Money::from_f64(100.0));
            }
            EngineEvent::TriggerExecuted(_) => panic!("expected a price update first"),
        }
    }

    #[tokio::test]
    async fn price_update_precedes_trigger_executed_on_same_tick() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (feed, _handle) = PriceFeed::spawn("ws://unused.invalid".to_string());
        let pos = open_pos(&store, "BTCUSDT", Side::Long, Some(Money::from_f64(95.0)), None);
        let engine = TriggerEngine::new(store.clone(), feed.clone());
        let mut events = engine.on_events();
        engine.register_position(&pos.symbol, pos.id);

        let tick = crate::price_feed::PriceTick {
            symbol: pos.symbol.clone(),
            price: Money::from_f64(95.0),
            ts: chrono::Utc::now(),
        };
        engine.evaluate_tick(&tick).await;

        assert!(matches!(events.try_recv().unwrap(), EngineEvent::PriceUpdate { .. }));
        assert!(matches!(events.try_recv().unwrap(), EngineEvent::TriggerExecuted(_)));
    }
}
