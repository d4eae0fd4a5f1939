//! Durable persistence for positions, fills, events, and settings.
//!
//! Backed by `rusqlite` with WAL journaling and foreign-key cascade, behind a
//! single `Mutex<Connection>` - the one serialized write path that makes
//! `close_position` the load-bearing at-most-once choke point the trigger
//! engine relies on (see `close_position` below; it is a conditional
//! `UPDATE ... WHERE status = 'OPEN'`, never a read-then-write).

use crate::error::{AppError, AppResult};
use crate::types::{
    Event, EventKind, Fill, FillType, Money, Position, PositionStatus, Settings, SettingsPatch,
    Side, SizeMode, Symbol,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info};

/// Everything needed to create a position, before the entry price/fee are
/// resolved (that happens in the Broker, which then calls `create_position`).
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub symbol: Symbol,
    pub side: Side,
    pub size_mode: SizeMode,
    pub size_value: Money,
    pub leverage: i32,
    pub notes: Option<String>,
    pub sl: Option<Money>,
    pub tp: Option<Money>,
}

/// Patch for `updateSLTP`. Distinguishes "field not supplied" (`None`) from
/// "field supplied and set to null" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct SlTpPatch {
    pub sl: Option<Option<Money>>,
    pub tp: Option<Option<Money>>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::Internal(format!("failed to create db dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init_connection(&conn)?;
        let store = Store {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// In-memory database, used by unit and integration tests.
    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn)?;
        let store = Store {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn init_connection(conn: &Connection) -> AppResult<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    /// Additive-only schema migrations: `CREATE TABLE IF NOT EXISTS` for the
    /// base schema, then a list of `ALTER TABLE ... ADD COLUMN` steps gated
    /// on whether the column already exists, so re-running against an
    /// already-migrated database is a no-op.
    fn migrate(&self) -> AppResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS positions (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol          TEXT NOT NULL,
                side            TEXT NOT NULL,
                qty             TEXT NOT NULL,
                entry_price     TEXT NOT NULL,
                entry_time      TEXT NOT NULL,
                leverage        INTEGER NOT NULL,
                fees_open       TEXT NOT NULL,
                notes           TEXT,
                sl              TEXT,
                tp              TEXT,
                status          TEXT NOT NULL,
                close_price     TEXT,
                close_time      TEXT,
                fees_close      TEXT,
                realized_pnl    TEXT,
                funding_pnl     TEXT NOT NULL DEFAULT '0'
            );

            CREATE TABLE IF NOT EXISTS fills (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id     INTEGER NOT NULL REFERENCES positions(id) ON DELETE CASCADE,
                fill_type       TEXT NOT NULL,
                price           TEXT NOT NULL,
                qty             TEXT NOT NULL,
                fee             TEXT NOT NULL,
                ts              TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id     INTEGER NOT NULL REFERENCES positions(id) ON DELETE CASCADE,
                event           TEXT NOT NULL,
                payload         TEXT NOT NULL,
                ts              TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                id                          INTEGER PRIMARY KEY CHECK (id = 1),
                taker_fee                   TEXT NOT NULL,
                maker_fee                   TEXT NOT NULL,
                enable_funding              INTEGER NOT NULL,
                base_balance                TEXT NOT NULL,
                default_stop_loss_percent   TEXT,
                default_take_profit_percent TEXT,
                number_format               TEXT NOT NULL,
                timezone                    TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
            CREATE INDEX IF NOT EXISTS idx_positions_symbol ON positions(symbol);
            CREATE INDEX IF NOT EXISTS idx_fills_position ON fills(position_id);
            CREATE INDEX IF NOT EXISTS idx_events_position ON events(position_id);
            ",
        )?;

        let settings_exists: i64 =
            conn.query_row("SELECT COUNT(*) FROM settings WHERE id = 1", [], |r| r.get(0))?;
        if settings_exists == 0 {
            let s = Settings::default();
            conn.execute(
                "INSERT INTO settings (id, taker_fee, maker_fee, enable_funding, base_balance,
                    default_stop_loss_percent, default_take_profit_percent, number_format, timezone)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    s.taker_fee.to_string(),
                    s.maker_fee.to_string(),
                    s.enable_funding as i64,
                    s.base_balance.inner().to_string(),
                    s.default_stop_loss_percent.map(|d| d.to_string()),
                    s.default_take_profit_percent.map(|d| d.to_string()),
                    s.number_format,
                    s.timezone,
                ],
            )?;
            debug!("seeded default settings");
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    pub fn create_position(
        &self,
        req: &NewPosition,
        entry_price: Money,
        open_fee: Money,
    ) -> AppResult<Position> {
        let qty = match req.size_mode {
            SizeMode::Usdt => req.size_value / entry_price,
            SizeMode::Qty => req.size_value,
        };
        let now = Utc::now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO positions (symbol, side, qty, entry_price, entry_time, leverage,
                fees_open, notes, sl, tp, status, funding_pnl)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'OPEN', '0')",
            params![
                req.symbol.as_str(),
                side_str(req.side),
                qty.inner().to_string(),
                entry_price.inner().to_string(),
                now.to_rfc3339(),
                req.leverage,
                open_fee.inner().to_string(),
                req.notes,
                req.sl.map(|m| m.inner().to_string()),
                req.tp.map(|m| m.inner().to_string()),
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO fills (position_id, fill_type, price, qty, fee, ts)
             VALUES (?1, 'OPEN', ?2, ?3, ?4, ?5)",
            params![
                id,
                entry_price.inner().to_string(),
                qty.inner().to_string(),
                open_fee.inner().to_string(),
                now.to_rfc3339(),
            ],
        )?;

        let payload = serde_json::json!({
            "symbol": req.symbol.as_str(),
            "side": side_str(req.side),
            "qty": qty.to_f64(),
            "entryPrice": entry_price.to_f64(),
        });
        tx.execute(
            "INSERT INTO events (position_id, event, payload, ts) VALUES (?1, ?2, ?3, ?4)",
            params![id, EventKind::PositionCreated.to_string(), payload.to_string(), now.to_rfc3339()],
        )?;

        tx.commit()?;
        drop(conn);
        self.get_position(id)?
            .ok_or_else(|| AppError::Internal("position vanished immediately after insert".into()))
    }

    pub fn get_position(&self, id: i64) -> AppResult<Option<Position>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(SELECT_POSITION)?;
        let pos = stmt
            .query_row(params![id], row_to_position)
            .optional()?;
        Ok(pos)
    }

    pub fn list_positions(&self, status: Option<PositionStatus>) -> AppResult<Vec<Position>> {
        let conn = self.conn.lock().unwrap();
        let rows = match status {
            Some(s) => {
                let sql = format!("{SELECT_POSITION_BASE} WHERE status = ?1 ORDER BY entry_time DESC");
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![status_str(s)], row_to_position)?
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let sql = format!("{SELECT_POSITION_BASE} ORDER BY entry_time DESC");
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map([], row_to_position)?
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    /// Updates only the provided SL/TP fields on an OPEN position, emitting
    /// one `SL_UPDATED`/`TP_UPDATED` event naming the first-updated field
    /// when both change. Fails with `Conflict` if the position is CLOSED.
    pub fn update_sltp(&self, id: i64, patch: &SlTpPatch) -> AppResult<Position> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let status: Option<String> = tx
            .query_row("SELECT status FROM positions WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?;
        let status = status.ok_or(AppError::NotFound(id))?;
        if status != "OPEN" {
            return Err(AppError::Conflict(format!("position {id} is already closed")));
        }

        let mut first_event: Option<EventKind> = None;
        if let Some(sl) = &patch.sl {
            tx.execute(
                "UPDATE positions SET sl = ?1 WHERE id = ?2",
                params![sl.map(|m| m.inner().to_string()), id],
            )?;
            first_event.get_or_insert(EventKind::SlUpdated);
        }
        if let Some(tp) = &patch.tp {
            tx.execute(
                "UPDATE positions SET tp = ?1 WHERE id = ?2",
                params![tp.map(|m| m.inner().to_string()), id],
            )?;
            first_event.get_or_insert(EventKind::TpUpdated);
        }

        if let Some(event) = first_event {
            let payload = serde_json::json!({"sl": patch.sl.flatten().map(Money::to_f64), "tp": patch.tp.flatten().map(Money::to_f64)});
            tx.execute(
                "INSERT INTO events (position_id, event, payload, ts) VALUES (?1, ?2, ?3, ?4)",
                params![id, event.to_string(), payload.to_string(), Utc::now().to_rfc3339()],
            )?;
        }

        tx.commit()?;
        drop(conn);
        self.get_position(id)?
            .ok_or_else(|| AppError::Internal("position vanished after sltp update".into()))
    }

    /// Guarded closure: `UPDATE ... WHERE status = 'OPEN'`. Returns `Ok(None)`
    /// (a no-op, not an error) if the position was already CLOSED - this is
    /// the primitive that makes the trigger engine's closures idempotent
    /// under concurrent/duplicate tick evaluation.
    pub fn close_position(
        &self,
        id: i64,
        close_price: Money,
        close_fee: Money,
        event: EventKind,
    ) -> AppResult<Option<Position>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let row: Option<(String, String, String, String)> = tx
            .query_row(
                "SELECT side, qty, entry_price, fees_open FROM positions WHERE id = ?1 AND status = 'OPEN'",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let Some((side_s, qty_s, entry_price_s, fees_open_s)) = row else {
            return Ok(None);
        };

        let side = side_from_str(&side_s)?;
        let qty = Money::from_decimal(parse_decimal(&qty_s)?);
        let entry_price = Money::from_decimal(parse_decimal(&entry_price_s)?);
        let fees_open = Money::from_decimal(parse_decimal(&fees_open_s)?);
        let funding_pnl = Money::ZERO;
        let realized = crate::calc::realized_pnl(
            side,
            entry_price,
            close_price,
            qty,
            fees_open,
            close_fee,
            funding_pnl,
        );
        let now = Utc::now();

        let affected = tx.execute(
            "UPDATE positions SET status = 'CLOSED', close_price = ?1, close_time = ?2,
                fees_close = ?3, realized_pnl = ?4
             WHERE id = ?5 AND status = 'OPEN'",
            params![
                close_price.inner().to_string(),
                now.to_rfc3339(),
                close_fee.inner().to_string(),
                realized.inner().to_string(),
                id,
            ],
        )?;
        if affected == 0 {
            // Lost the race between the read above and this write.
            tx.rollback()?;
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO fills (position_id, fill_type, price, qty, fee, ts)
             VALUES (?1, 'CLOSE', ?2, ?3, ?4, ?5)",
            params![id, close_price.inner().to_string(), qty.inner().to_string(), close_fee.inner().to_string(), now.to_rfc3339()],
        )?;

        let payload = serde_json::json!({
            "closePrice": close_price.to_f64(),
            "realizedPnl": realized.to_f64(),
        });
        tx.execute(
            "INSERT INTO events (position_id, event, payload, ts) VALUES (?1, ?2, ?3, ?4)",
            params![id, event.to_string(), payload.to_string(), now.to_rfc3339()],
        )?;

        tx.commit()?;
        drop(conn);
        self.get_position(id)
    }

    pub fn delete_position(&self, id: i64) -> AppResult<bool> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute("DELETE FROM positions WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    /// Forces a WAL checkpoint so every committed write is durable in the
    /// main database file. Called on graceful shutdown.
    pub fn flush(&self) -> AppResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA wal_checkpoint(FULL);")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fills / Events
    // ------------------------------------------------------------------

    pub fn list_events(&self, position_id: Option<i64>, limit: Option<i64>) -> AppResult<Vec<Event>> {
        let conn = self.conn.lock().unwrap();
        let limit = limit.unwrap_or(100);
        let rows = match position_id {
            Some(pid) => {
                let mut stmt = conn.prepare(
                    "SELECT id, position_id, event, payload, ts FROM events
                     WHERE position_id = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                stmt.query_map(params![pid, limit], row_to_event)?
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, position_id, event, payload, ts FROM events ORDER BY id DESC LIMIT ?1",
                )?;
                stmt.query_map(params![limit], row_to_event)?
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    pub fn list_fills(&self, position_id: i64) -> AppResult<Vec<Fill>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, position_id, fill_type, price, qty, fee, ts FROM fills
             WHERE position_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![position_id], row_to_fill)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn get_settings(&self) -> AppResult<Settings> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT taker_fee, maker_fee, enable_funding, base_balance,
                default_stop_loss_percent, default_take_profit_percent, number_format, timezone
             FROM settings WHERE id = 1",
            [],
            row_to_settings,
        )
        .map_err(AppError::from)
    }

    pub fn update_settings(&self, patch: &SettingsPatch) -> AppResult<Settings> {
        let current = self.get_settings()?;
        let next = Settings {
            taker_fee: patch.taker_fee.unwrap_or(current.taker_fee),
            maker_fee: patch.maker_fee.unwrap_or(current.maker_fee),
            enable_funding: patch.enable_funding.unwrap_or(current.enable_funding),
            base_balance: patch.base_balance.map(Money::from_f64).unwrap_or(current.base_balance),
            default_stop_loss_percent: patch
                .default_stop_loss_percent
                .or(current.default_stop_loss_percent),
            default_take_profit_percent: patch
                .default_take_profit_percent
                .or(current.default_take_profit_percent),
            number_format: patch.number_format.clone().unwrap_or(current.number_format),
            timezone: patch.timezone.clone().unwrap_or(current.timezone),
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE settings SET taker_fee = ?1, maker_fee = ?2, enable_funding = ?3,
                base_balance = ?4, default_stop_loss_percent = ?5,
                default_take_profit_percent = ?6, number_format = ?7, timezone = ?8
             WHERE id = 1",
            params![
                next.taker_fee.to_string(),
                next.maker_fee.to_string(),
                next.enable_funding as i64,
                next.base_balance.inner().to_string(),
                next.default_stop_loss_percent.map(|d| d.to_string()),
                next.default_take_profit_percent.map(|d| d.to_string()),
                next.number_format,
                next.timezone,
            ],
        )?;
        Ok(next)
    }
}

const SELECT_POSITION_BASE: &str = "SELECT id, symbol, side, qty, entry_price, entry_time, leverage,
    fees_open, notes, sl, tp, status, close_price, close_time, fees_close, realized_pnl, funding_pnl
    FROM positions";

const SELECT_POSITION: &str = "SELECT id, symbol, side, qty, entry_price, entry_time, leverage,
    fees_open, notes, sl, tp, status, close_price, close_time, fees_close, realized_pnl, funding_pnl
    FROM positions WHERE id = ?1";

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Long => "LONG",
        Side::Short => "SHORT",
    }
}

fn side_from_str(s: &str) -> AppResult<Side> {
    match s {
        "LONG" => Ok(Side::Long),
        "SHORT" => Ok(Side::Short),
        other => Err(AppError::Internal(format!("corrupt side in store: {other}"))),
    }
}

fn status_str(status: PositionStatus) -> &'static str {
    match status {
        PositionStatus::Open => "OPEN",
        PositionStatus::Closed => "CLOSED",
    }
}

fn parse_decimal(s: &str) -> AppResult<rust_decimal::Decimal> {
    rust_decimal::Decimal::from_str(s)
        .map_err(|e| AppError::Internal(format!("corrupt decimal in store: {e}")))
}

fn parse_money(s: &str) -> rusqlite::Result<Money> {
    rust_decimal::Decimal::from_str(s)
        .map(Money::from_decimal)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_money_opt(s: Option<String>) -> rusqlite::Result<Option<Money>> {
    s.map(|s| parse_money(&s)).transpose()
}

fn parse_datetime(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn row_to_position(row: &rusqlite::Row) -> rusqlite::Result<Position> {
    let side_s: String = row.get(2)?;
    let status_s: String = row.get(11)?;
    Ok(Position {
        id: row.get(0)?,
        symbol: Symbol::new(row.get::<_, String>(1)?),
        side: match side_s.as_str() {
            "LONG" => Side::Long,
            _ => Side::Short,
        },
        qty: parse_money(&row.get::<_, String>(3)?)?,
        entry_price: parse_money(&row.get::<_, String>(4)?)?,
        entry_time: parse_datetime(&row.get::<_, String>(5)?)?,
        leverage: row.get(6)?,
        fees_open: parse_money(&row.get::<_, String>(7)?)?,
        notes: row.get(8)?,
        sl: parse_money_opt(row.get(9)?)?,
        tp: parse_money_opt(row.get(10)?)?,
        status: match status_s.as_str() {
            "OPEN" => PositionStatus::Open,
            _ => PositionStatus::Closed,
        },
        close_price: parse_money_opt(row.get(12)?)?,
        close_time: row.get::<_, Option<String>>(13)?.map(|s| parse_datetime(&s)).transpose()?,
        fees_close: parse_money_opt(row.get(14)?)?,
        realized_pnl: parse_money_opt(row.get(15)?)?,
        funding_pnl: parse_money(&row.get::<_, String>(16)?)?,
    })
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let event_s: String = row.get(2)?;
    let payload_s: String = row.get(3)?;
    let ts_s: String = row.get(4)?;
    Ok(Event {
        id: row.get(0)?,
        position_id: row.get(1)?,
        event: EventKind::from_str(&event_s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into()))?,
        payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::Value::Null),
        ts: parse_datetime(&ts_s)?,
    })
}

fn row_to_fill(row: &rusqlite::Row) -> rusqlite::Result<Fill> {
    let fill_type_s: String = row.get(2)?;
    Ok(Fill {
        id: row.get(0)?,
        position_id: row.get(1)?,
        fill_type: match fill_type_s.as_str() {
            "OPEN" => FillType::Open,
            "CLOSE" => FillType::Close,
            _ => FillType::Partial,
        },
        price: parse_money(&row.get::<_, String>(3)?)?,
        qty: parse_money(&row.get::<_, String>(4)?)?,
        fee: parse_money(&row.get::<_, String>(5)?)?,
        ts: parse_datetime(&row.get::<_, String>(6)?)?,
    })
}

fn row_to_settings(row: &rusqlite::Row) -> rusqlite::Result<Settings> {
    let taker_fee: String = row.get(0)?;
    let maker_fee: String = row.get(1)?;
    let enable_funding: i64 = row.get(2)?;
    let base_balance: String = row.get(3)?;
    let default_sl: Option<String> = row.get(4)?;
    let default_tp: Option<String> = row.get(5)?;
    Ok(Settings {
        taker_fee: rust_decimal::Decimal::from_str(&taker_fee).unwrap_or_default(),
        maker_fee: rust_decimal::Decimal::from_str(&maker_fee).unwrap_or_default(),
        enable_funding: enable_funding != 0,
        base_balance: parse_money(&base_balance)?,
        default_stop_loss_percent: default_sl.and_then(|s| rust_decimal::Decimal::from_str(&s).ok()),
        default_take_profit_percent: default_tp.and_then(|s| rust_decimal::Decimal::from_str(&s).ok()),
        number_format: row.get(6)?,
        timezone: row.get(7)?,
    })
}
