//! CSV export of the position ledger.
//!
//! One row per position, entry and exit economics side by side so a trade's
//! full P&L story reads left to right without needing to join against the
//! fills table.

use crate::error::{AppError, AppResult};
use crate::types::Position;
use csv::{QuoteStyle, WriterBuilder};

const HEADERS: &[&str] = &[
    "ID", "Symbol", "Side", "Quantity", "Entry Price", "Close Price", "Entry Time (ISO-8601)",
    "Close Time (ISO-8601)", "Realized PnL", "Fees Open", "Fees Close", "Funding PnL", "Leverage", "Notes",
];

pub fn positions_to_csv(positions: &[Position]) -> AppResult<String> {
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Necessary)
        .from_writer(Vec::new());

    writer
        .write_record(HEADERS)
        .map_err(|e| AppError::Internal(format!("csv header write failed: {e}")))?;

    for p in positions {
        writer
            .write_record(&[
                p.id.to_string(),
                p.symbol.as_str().to_string(),
                p.side.to_string(),
                p.qty.to_string(),
                p.entry_price.to_string(),
                p.close_price.map(|m| m.to_string()).unwrap_or_default(),
                p.entry_time.to_rfc3339(),
                p.close_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
                p.realized_pnl.map(|m| m.to_string()).unwrap_or_default(),
                p.fees_open.to_string(),
                p.fees_close.map(|m| m.to_string()).unwrap_or_default(),
                p.funding_pnl.to_string(),
                p.leverage.to_string(),
                p.notes.clone().unwrap_or_default(),
            ])
            .map_err(|e| AppError::Internal(format!("csv row write failed: {e}")))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| AppError::Internal(format!("csv writer flush failed: {e}")))?;
    String::from_utf8(bytes).map_err(|e| AppError::Internal(format!("csv output not utf8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PositionStatus, Side};
    use chrono::Utc;
    use crate::types::Money;

    fn sample_position(notes: Option<&str>) -> Position {
        Position {
            id: 1,
            symbol: crate::types::Symbol::new("BTCUSDT"),
            side: Side::Long,
            qty: Money::from_f64(10.0),
            entry_price: Money::from_f64(100.0),
            entry_time: Utc::now(),
            leverage: 1,
            fees_open: Money::from_f64(0.4),
            notes: notes.map(|s| s.to_string()),
            sl: Some(Money::from_f64(95.0)),
            tp: Some(Money::from_f64(110.0)),
            status: PositionStatus::Closed,
            close_price: Some(Money::from_f64(110.0)),
            close_time: Some(Utc::now()),
            fees_close: Some(Money::from_f64(0.44)),
            realized_pnl: Some(Money::from_f64(99.16)),
            funding_pnl: Money::ZERO,
        }
    }

    #[test]
    fn header_row_matches_column_order() {
        let csv = positions_to_csv(&[]).unwrap();
        assert_eq!(csv.trim_end(), HEADERS.join(","));
    }

    #[test]
    fn notes_with_comma_are_quoted() {
        let pos = sample_position(Some("nice trade, closed early"));
        let csv = positions_to_csv(&[pos]).unwrap();
        assert!(csv.contains("\"nice trade, closed early\""));
    }

    #[test]
    fn plain_notes_are_not_quoted() {
        let pos = sample_position(Some("plain note"));
        let csv = positions_to_csv(&[pos]).unwrap();
        assert!(csv.contains(",plain note\n") || csv.ends_with(",plain note"));
    }
}
