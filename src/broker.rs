//! The command surface: validates requests, resolves entry/close prices,
//! and drives the Store + TriggerEngine + PriceFeed together. Everything the
//! HTTP API exposes funnels through here.

use crate::calc;
use crate::error::{AppError, AppResult};
use crate::exchange::ExchangeRest;
use crate::price_feed::PriceFeed;
use crate::store::{NewPosition, SlTpPatch, Store};
use crate::trigger_engine::TriggerEngine;
use crate::types::{EntryType, EventKind, Money, PriceMode, Settings, SettingsPatch, Side, SizeMode, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePositionRequest {
    pub symbol: String,
    pub side: Side,
    pub size_mode: SizeMode,
    pub size_value: f64,
    pub leverage: i32,
    pub entry_type: EntryType,
    pub limit_price: Option<f64>,
    pub sl_mode: Option<PriceMode>,
    pub sl_value: Option<f64>,
    pub tp_mode: Option<PriceMode>,
    pub tp_value: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub total_trades: i64,
    pub win_rate: Decimal,
    pub avg_r_multiple: Decimal,
    pub best_symbol: Option<String>,
    pub worst_symbol: Option<String>,
    pub current_balance: f64,
}

pub struct Broker {
    store: Arc<Store>,
    feed: PriceFeed,
    trigger_engine: Arc<TriggerEngine>,
    exchange: Arc<dyn ExchangeRest>,
}

impl Broker {
    pub fn new(
        store: Arc<Store>,
        feed: PriceFeed,
        trigger_engine: Arc<TriggerEngine>,
        exchange: Arc<dyn ExchangeRest>,
    ) -> Self {
        Broker { store, feed, trigger_engine, exchange }
    }

    pub async fn create_position(&self, req: CreatePositionRequest) -> AppResult<crate::types::Position> {
        if req.size_value <= 0.0 {
            return Err(AppError::Validation("sizeValue must be positive".into()));
        }
        if !(1..=125).contains(&req.leverage) {
            return Err(AppError::Validation("leverage must be between 1 and 125".into()));
        }
        validate_symbol(&req.symbol, "USDT")?;
        let symbol = Symbol::new(&req.symbol);

        let entry_price = match req.entry_type {
            EntryType::Market => self.resolve_mark_price(&symbol).await?,
            EntryType::Limit => {
                let px = req
                    .limit_price
                    .ok_or_else(|| AppError::Validation("limitPrice is required for LIMIT entries".into()))?;
                if px <= 0.0 {
                    return Err(AppError::Validation("limitPrice must be positive".into()));
                }
                Money::from_f64(px)
            }
        };

        let sl = resolve_trigger_price(req.side, entry_price, req.sl_mode, req.sl_value, true)?;
        let tp = resolve_trigger_price(req.side, entry_price, req.tp_mode, req.tp_value, false)?;

        let size_value = Money::from_f64(req.size_value);
        let qty = match req.size_mode {
            SizeMode::Usdt => size_value / entry_price,
            SizeMode::Qty => size_value,
        };
        let settings = self.store.get_settings()?;
        let open_fee = calc::fee(calc::notional(qty, entry_price), settings.taker_fee);

        let new_pos = NewPosition {
            symbol: symbol.clone(),
            side: req.side,
            size_mode: req.size_mode,
            size_value,
            leverage: req.leverage,
            notes: req.notes,
            sl,
            tp,
        };
        let position = self.store.create_position(&new_pos, entry_price, open_fee)?;
        self.trigger_engine.register_position(&position.symbol, position.id);
        info!(position_id = position.id, symbol = %symbol, "position created");
        Ok(position)
    }

    /// Resolves the live mark price: prefer the feed's cached last tick,
    /// fall back to a REST call for symbols the feed hasn't ticked yet.
    async fn resolve_mark_price(&self, symbol: &Symbol) -> AppResult<Money> {
        if let Some(price) = self.feed.last_price(symbol) {
            return Ok(price);
        }
        self.exchange.get_price(symbol).await
    }

    pub fn get_position(&self, id: i64) -> AppResult<crate::types::Position> {
        self.store.get_position(id)?.ok_or(AppError::NotFound(id))
    }

    pub fn list_positions(&self, status: Option<crate::types::PositionStatus>) -> AppResult<Vec<crate::types::Position>> {
        self.store.list_positions(status)
    }

    pub fn update_sltp(&self, id: i64, patch: SlTpPatch) -> AppResult<crate::types::Position> {
        self.store.update_sltp(id, &patch)
    }

    /// Closing an already-CLOSED position is a conflict, not a no-op: the
    /// close price and fee are only ever computed once per position.
    pub async fn close_position_manual(&self, id: i64) -> AppResult<crate::types::Position> {
        let position = self.get_position(id)?;
        if !position.is_open() {
            return Err(AppError::Conflict(format!("position {id} is already closed")));
        }

        let close_price = self.resolve_mark_price(&position.symbol).await?;
        let settings = self.store.get_settings()?;
        let fee = calc::fee(calc::notional(position.qty, close_price), settings.taker_fee);

        match self.store.close_position(id, close_price, fee, EventKind::ManualClose)? {
            Some(closed) => {
                self.trigger_engine.unregister_position(&position.symbol, id);
                info!(position_id = id, "position closed manually");
                Ok(closed)
            }
            None => {
                // Raced a trigger closure between the open-check and here.
                Err(AppError::Conflict(format!("position {id} is already closed")))
            }
        }
    }

    pub fn delete_position(&self, id: i64) -> AppResult<()> {
        let position = self.get_position(id)?;
        if position.is_open() {
            self.trigger_engine.unregister_position(&position.symbol, id);
        }
        if self.store.delete_position(id)? {
            Ok(())
        } else {
            Err(AppError::NotFound(id))
        }
    }

    pub fn get_events(&self, position_id: Option<i64>, limit: Option<i64>) -> AppResult<Vec<crate::types::Event>> {
        self.store.list_events(position_id, limit)
    }

    pub fn get_settings(&self) -> AppResult<Settings> {
        self.store.get_settings()
    }

    pub fn update_settings(&self, patch: SettingsPatch) -> AppResult<Settings> {
        self.store.update_settings(&patch)
    }

    pub fn get_stats(&self) -> AppResult<Stats> {
        let closed = self.store.list_positions(Some(crate::types::PositionStatus::Closed))?;
        let open = self.store.list_positions(Some(crate::types::PositionStatus::Open))?;
        let settings = self.store.get_settings()?;

        let total_trades = closed.len() as i64;
        let wins = closed.iter().filter(|p| p.realized_pnl.map(|pnl| pnl.is_positive()).unwrap_or(false)).count() as i64;
        let win_rate = if total_trades > 0 {
            Decimal::from(wins) / Decimal::from(total_trades) * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };

        // Insertion-ordered (first-seen-wins) accumulation: a HashMap's
        // iteration order is unspecified and would make best/worst-symbol
        // ties non-deterministic.
        let mut by_symbol: Vec<(String, Money)> = Vec::new();
        let mut r_multiples: Vec<Decimal> = Vec::new();
        for pos in &closed {
            let pnl = pos.realized_pnl.unwrap_or(Money::ZERO);
            match by_symbol.iter_mut().find(|(s, _)| s == pos.symbol.as_str()) {
                Some((_, total)) => *total += pnl,
                None => by_symbol.push((pos.symbol.as_str().to_string(), pnl)),
            }

            if let Some(sl) = pos.sl {
                let risk = (pos.entry_price - sl).abs();
                if !risk.is_zero() {
                    let r = pnl.inner() / (risk.inner() * pos.qty.inner());
                    r_multiples.push(r);
                }
            }
        }
        let mut best_symbol: Option<(&String, Money)> = None;
        let mut worst_symbol: Option<(&String, Money)> = None;
        for (symbol, total) in &by_symbol {
            if best_symbol.map(|(_, best)| *total > best).unwrap_or(true) {
                best_symbol = Some((symbol, *total));
            }
            if worst_symbol.map(|(_, worst)| *total < worst).unwrap_or(true) {
                worst_symbol = Some((symbol, *total));
            }
        }
        let best_symbol = best_symbol.map(|(s, _)| s.clone());
        let worst_symbol = worst_symbol.map(|(s, _)| s.clone());
        let avg_r_multiple = if r_multiples.is_empty() {
            Decimal::ZERO
        } else {
            r_multiples.iter().sum::<Decimal>() / Decimal::from(r_multiples.len())
        };

        let realized_total: Money = closed.iter().filter_map(|p| p.realized_pnl).sum();
        let mut unrealized_total = Money::ZERO;
        for pos in &open {
            if let Some(mark) = self.feed.last_price(&pos.symbol) {
                unrealized_total += calc::unrealized_pnl(pos.side, pos.entry_price, mark, pos.qty);
            }
        }
        let current_balance = settings.base_balance + realized_total + unrealized_total;

        Ok(Stats {
            total_trades,
            win_rate,
            avg_r_multiple,
            best_symbol,
            worst_symbol,
            current_balance: current_balance.to_f64(),
        })
    }

    pub fn export_csv(
        &self,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
        symbol: Option<Symbol>,
    ) -> AppResult<String> {
        let positions = self.store.list_positions(None)?;
        let filtered: Vec<_> = positions
            .into_iter()
            .filter(|p| start_date.map(|f| p.entry_time >= f).unwrap_or(true))
            .filter(|p| end_date.map(|t| p.entry_time <= t).unwrap_or(true))
            .filter(|p| symbol.as_ref().map(|s| &p.symbol == s).unwrap_or(true))
            .collect();
        crate::csv_export::positions_to_csv(&filtered)
    }
}

/// Uppercase, 5-20 alphanumeric characters, ending in the quote asset.
fn validate_symbol(raw: &str, quote_asset: &str) -> AppResult<()> {
    let upper = raw.to_uppercase();
    let len = upper.chars().count();
    if !(5..=20).contains(&len) || !upper.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::Validation(format!(
            "symbol must be 5-20 alphanumeric characters, got {raw:?}"
        )));
    }
    if !upper.ends_with(quote_asset) {
        return Err(AppError::Validation(format!("symbol must end in {quote_asset}, got {raw:?}")));
    }
    Ok(())
}

fn resolve_trigger_price(
    side: Side,
    entry_price: Money,
    mode: Option<PriceMode>,
    value: Option<f64>,
    is_stop_loss: bool,
) -> AppResult<Option<Money>> {
    let (Some(mode), Some(value)) = (mode, value) else {
        return Ok(None);
    };
    if value <= 0.0 {
        return Err(AppError::Validation("SL/TP value must be positive".into()));
    }
    let price = match mode {
        PriceMode::Price => Money::from_f64(value),
        PriceMode::Percent => {
            let percent = Decimal::try_from(value).unwrap_or_default();
            if is_stop_loss {
                calc::sl_price_from_percent(side, entry_price, percent)
            } else {
                calc::tp_price_from_percent(side, entry_price, percent)
            }
        }
    };
    Ok(Some(price))
}
