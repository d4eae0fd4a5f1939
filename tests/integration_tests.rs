//! End-to-end scenarios driving the broker + store + trigger engine
//! together, the way the HTTP API would.

use perp_paper_trader::broker::{Broker, CreatePositionRequest};
use perp_paper_trader::exchange::mock::MockExchange;
use perp_paper_trader::price_feed::{PriceFeed, PriceTick};
use perp_paper_trader::store::{SlTpPatch, Store};
use perp_paper_trader::trigger_engine::TriggerEngine;
use perp_paper_trader::types::{EntryType, EventKind, Money, PositionStatus, PriceMode, Side, SizeMode, Symbol};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static DB_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_db_path() -> std::path::PathBuf {
    let n = DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("perp_paper_trader_test_{}_{n}.db", std::process::id()))
}

struct Harness {
    broker: Broker,
    store: Arc<Store>,
    engine: Arc<TriggerEngine>,
    exchange: Arc<MockExchange>,
    db_path: std::path::PathBuf,
}

impl Harness {
    fn new() -> Self {
        let db_path = temp_db_path();
        let store = Arc::new(Store::open(&db_path).unwrap());
        let (feed, _handle) = PriceFeed::spawn("wss://unused.invalid".to_string());
        let engine = Arc::new(TriggerEngine::new(store.clone(), feed.clone()));
        let exchange = Arc::new(MockExchange::new());
        let broker = Broker::new(store.clone(), feed, engine.clone(), exchange.clone());
        Harness { broker, store, engine, exchange, db_path }
    }

    fn basic_request(&self, symbol: &str, side: Side) -> CreatePositionRequest {
        CreatePositionRequest {
            symbol: symbol.to_string(),
            side,
            size_mode: SizeMode::Qty,
            size_value: 10.0,
            leverage: 1,
            entry_type: EntryType::Market,
            limit_price: None,
            sl_mode: None,
            sl_value: None,
            tp_mode: None,
            tp_value: None,
            notes: None,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_path);
    }
}

/// S1: LONG market entry that rides to its take-profit wins, and
/// realizedPnl + feesOpen + feesClose + fundingPnl == grossPnl exactly.
#[tokio::test]
async fn s1_long_market_wins_on_take_profit() {
    let h = Harness::new();
    h.exchange.set_price(Symbol::new("BTCUSDT"), Money::from_f64(100.0));

    let mut req = h.basic_request("BTCUSDT", Side::Long);
    req.sl_mode = Some(PriceMode::Price);
    req.sl_value = Some(95.0);
    req.tp_mode = Some(PriceMode::Price);
    req.tp_value = Some(110.0);
    let position = h.broker.create_position(req).await.unwrap();
    assert_eq!(position.qty, Money::from_f64(10.0));

    h.exchange.set_price(Symbol::new("BTCUSDT"), Money::from_f64(110.0));
    let tick = PriceTick { symbol: Symbol::new("BTCUSDT"), price: Money::from_f64(110.0), ts: chrono::Utc::now() };
    h.engine.register_position(&position.symbol, position.id);
    h.engine_evaluate(&tick).await;

    let closed = h.store.get_position(position.id).unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    let gross = perp_paper_trader::calc::gross_pnl(Side::Long, closed.entry_price, closed.close_price.unwrap(), closed.qty);
    let realized = closed.realized_pnl.unwrap();
    let fees_open = closed.fees_open;
    let fees_close = closed.fees_close.unwrap();
    assert_eq!(realized + fees_open + fees_close + closed.funding_pnl, gross);

    let events = h.store.list_events(Some(position.id), None).unwrap();
    assert!(events.iter().any(|e| e.event == EventKind::TpTriggered));
}

/// S2: SHORT position stops out at its stop-loss.
#[tokio::test]
async fn s2_short_stops_out() {
    let h = Harness::new();
    h.exchange.set_price(Symbol::new("ETHUSDT"), Money::from_f64(50.0));

    let mut req = h.basic_request("ETHUSDT", Side::Short);
    req.size_value = 2.0;
    req.sl_mode = Some(PriceMode::Price);
    req.sl_value = Some(52.0);
    let position = h.broker.create_position(req).await.unwrap();

    h.engine.register_position(&position.symbol, position.id);
    let tick = PriceTick { symbol: Symbol::new("ETHUSDT"), price: Money::from_f64(52.0), ts: chrono::Utc::now() };
    h.engine_evaluate(&tick).await;

    let closed = h.store.get_position(position.id).unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert!(closed.realized_pnl.unwrap().to_f64() < 0.0);
    let events = h.store.list_events(Some(position.id), None).unwrap();
    assert!(events.iter().any(|e| e.event == EventKind::SlTriggered));
}

/// S3: SL and TP both satisfied on the same tick - SL must win, and no
/// TP_TRIGGERED event is ever written.
#[tokio::test]
async fn s3_simultaneous_sl_and_tp_prefers_stop_loss() {
    let h = Harness::new();
    h.exchange.set_price(Symbol::new("BTCUSDT"), Money::from_f64(100.0));

    let mut req = h.basic_request("BTCUSDT", Side::Long);
    req.sl_mode = Some(PriceMode::Price);
    req.sl_value = Some(95.0);
    req.tp_mode = Some(PriceMode::Price);
    req.tp_value = Some(94.0);
    let position = h.broker.create_position(req).await.unwrap();
    h.engine.register_position(&position.symbol, position.id);

    let tick = PriceTick { symbol: Symbol::new("BTCUSDT"), price: Money::from_f64(94.0), ts: chrono::Utc::now() };
    h.engine_evaluate(&tick).await;

    let events = h.store.list_events(Some(position.id), None).unwrap();
    assert!(events.iter().any(|e| e.event == EventKind::SlTriggered));
    assert!(!events.iter().any(|e| e.event == EventKind::TpTriggered));
}

/// S4: closing a position twice is not idempotent in the silent-success
/// sense - the second close must return a Conflict error.
#[tokio::test]
async fn s4_second_manual_close_returns_conflict() {
    let h = Harness::new();
    h.exchange.set_price(Symbol::new("BTCUSDT"), Money::from_f64(100.0));
    let position = h.broker.create_position(h.basic_request("BTCUSDT", Side::Long)).await.unwrap();

    h.exchange.set_price(Symbol::new("BTCUSDT"), Money::from_f64(105.0));
    let first = h.broker.close_position_manual(position.id).await.unwrap();
    assert_eq!(first.status, PositionStatus::Closed);

    h.exchange.set_price(Symbol::new("BTCUSDT"), Money::from_f64(999.0));
    let second = h.broker.close_position_manual(position.id).await;
    assert!(matches!(second, Err(perp_paper_trader::error::AppError::Conflict(_))));

    let close_fills = h.store.list_fills(position.id).unwrap();
    let close_count = close_fills.iter().filter(|f| f.fill_type == perp_paper_trader::types::FillType::Close).count();
    assert_eq!(close_count, 1);
}

/// S6: restart fidelity - reopening the same database file preserves every
/// field of an open position exactly.
#[tokio::test]
async fn s6_restart_preserves_open_positions() {
    let db_path = temp_db_path();
    let position_id;
    {
        let store = Arc::new(Store::open(&db_path).unwrap());
        let (feed, _handle) = PriceFeed::spawn("wss://unused.invalid".to_string());
        let engine = Arc::new(TriggerEngine::new(store.clone(), feed.clone()));
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price(Symbol::new("BTCUSDT"), Money::from_f64(100.0));
        let broker = Broker::new(store.clone(), feed, engine, exchange);

        let req = CreatePositionRequest {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            size_mode: SizeMode::Qty,
            size_value: 3.0,
            leverage: 5,
            entry_type: EntryType::Market,
            limit_price: None,
            sl_mode: Some(PriceMode::Price),
            sl_value: Some(90.0),
            tp_mode: Some(PriceMode::Price),
            tp_value: Some(120.0),
            notes: Some("restart fidelity check".into()),
        };
        let position = broker.create_position(req).await.unwrap();
        position_id = position.id;
    }

    // Reopen the same file as a fresh process would on restart.
    let store = Store::open(&db_path).unwrap();
    let recovered = store.get_position(position_id).unwrap().unwrap();
    assert_eq!(recovered.symbol.as_str(), "BTCUSDT");
    assert_eq!(recovered.leverage, 5);
    assert_eq!(recovered.sl, Some(Money::from_f64(90.0)));
    assert_eq!(recovered.tp, Some(Money::from_f64(120.0)));
    assert_eq!(recovered.notes.as_deref(), Some("restart fidelity check"));
    assert!(recovered.is_open());

    let _ = std::fs::remove_file(&db_path);
}

/// Deleting a position removes its fills and events too (cascade delete).
#[tokio::test]
async fn cascade_delete_removes_fills_and_events() {
    let h = Harness::new();
    h.exchange.set_price(Symbol::new("BTCUSDT"), Money::from_f64(100.0));
    let position = h.broker.create_position(h.basic_request("BTCUSDT", Side::Long)).await.unwrap();

    h.broker.delete_position(position.id).unwrap();
    assert!(h.store.get_position(position.id).unwrap().is_none());
    assert!(h.store.list_fills(position.id).unwrap().is_empty());
    assert!(h.store.list_events(Some(position.id), None).unwrap().is_empty());
}

/// updateSLTP rejects a patch against an already-closed position.
#[tokio::test]
async fn update_sltp_rejects_closed_position() {
    let h = Harness::new();
    h.exchange.set_price(Symbol::new("BTCUSDT"), Money::from_f64(100.0));
    let position = h.broker.create_position(h.basic_request("BTCUSDT", Side::Long)).await.unwrap();
    h.broker.close_position_manual(position.id).await.unwrap();

    let patch = SlTpPatch { sl: Some(Some(Money::from_f64(90.0))), tp: None };
    let result = h.broker.update_sltp(position.id, patch);
    assert!(result.is_err());
}

impl Harness {
    async fn engine_evaluate(&self, tick: &PriceTick) {
        // Exercise the same evaluation path the background tick loop uses,
        // without needing a live socket for the test.
        self.engine.evaluate_tick(tick).await;
    }
}
