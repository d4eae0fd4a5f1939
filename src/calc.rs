//! Pure, side-effect-free PnL and trigger math.
//!
//! Nothing in this module touches the Store, PriceFeed, or the clock - it is
//! the cheapest part of the engine to exhaustively unit test, and every law
//! in it is checked below.

use crate::types::{Money, Side};
use rust_decimal::Decimal;

/// `qty * price`
pub fn notional(qty: Money, price: Money) -> Money {
    qty * price
}

/// Unrealized PnL at the given mark price.
pub fn unrealized_pnl(side: Side, entry_price: Money, mark_price: Money, qty: Money) -> Money {
    match side {
        Side::Long => (mark_price - entry_price) * qty,
        Side::Short => (entry_price - mark_price) * qty,
    }
}

/// Unrealized PnL as a percent of entry notional; zero when notional is zero.
pub fn pnl_percent(unrealized: Money, qty: Money, entry_price: Money) -> Decimal {
    let entry_notional = qty * entry_price;
    if entry_notional.is_zero() {
        return Decimal::ZERO;
    }
    (unrealized / entry_notional).inner() * Decimal::ONE_HUNDRED
}

/// `notional * rate`
pub fn fee(notional: Money, rate: Decimal) -> Money {
    Money::from_decimal(notional.inner() * rate)
}

/// Convert a stop-loss percent into an absolute price at the given entry.
pub fn sl_price_from_percent(side: Side, entry_price: Money, percent: Decimal) -> Money {
    let frac = percent / Decimal::ONE_HUNDRED;
    match side {
        Side::Long => Money::from_decimal(entry_price.inner() * (Decimal::ONE - frac)),
        Side::Short => Money::from_decimal(entry_price.inner() * (Decimal::ONE + frac)),
    }
}

/// Convert a take-profit percent into an absolute price at the given entry.
pub fn tp_price_from_percent(side: Side, entry_price: Money, percent: Decimal) -> Money {
    let frac = percent / Decimal::ONE_HUNDRED;
    match side {
        Side::Long => Money::from_decimal(entry_price.inner() * (Decimal::ONE + frac)),
        Side::Short => Money::from_decimal(entry_price.inner() * (Decimal::ONE - frac)),
    }
}

/// Does the stop-loss predicate hold at this mark price?
pub fn should_trigger_sl(side: Side, mark_price: Money, sl: Option<Money>) -> bool {
    match (side, sl) {
        (_, None) => false,
        (Side::Long, Some(sl)) => mark_price <= sl,
        (Side::Short, Some(sl)) => mark_price >= sl,
    }
}

/// Does the take-profit predicate hold at this mark price?
pub fn should_trigger_tp(side: Side, mark_price: Money, tp: Option<Money>) -> bool {
    match (side, tp) {
        (_, None) => false,
        (Side::Long, Some(tp)) => mark_price >= tp,
        (Side::Short, Some(tp)) => mark_price <= tp,
    }
}

/// Gross PnL before fees/funding: `(closePrice - entryPrice) * qty` for LONG,
/// negated for SHORT.
pub fn gross_pnl(side: Side, entry_price: Money, close_price: Money, qty: Money) -> Money {
    match side {
        Side::Long => (close_price - entry_price) * qty,
        Side::Short => (entry_price - close_price) * qty,
    }
}

/// `realizedPnl = grossPnl - feesOpen - feesClose - fundingPnl`
pub fn realized_pnl(
    side: Side,
    entry_price: Money,
    close_price: Money,
    qty: Money,
    fees_open: Money,
    fees_close: Money,
    funding_pnl: Money,
) -> Money {
    gross_pnl(side, entry_price, close_price, qty) - fees_open - fees_close - funding_pnl
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn m(v: f64) -> Money {
        Money::from_f64(v)
    }

    #[test]
    fn notional_is_qty_times_price() {
        assert_eq!(notional(m(10.0), m(100.0)), m(1000.0));
    }

    #[test]
    fn unrealized_pnl_long_and_short() {
        assert_eq!(unrealized_pnl(Side::Long, m(100.0), m(110.0), m(10.0)), m(100.0));
        assert_eq!(unrealized_pnl(Side::Short, m(100.0), m(110.0), m(10.0)), m(-100.0));
    }

    #[test]
    fn pnl_percent_zero_notional() {
        assert_eq!(pnl_percent(m(0.0), m(0.0), m(0.0)), Decimal::ZERO);
    }

    #[test]
    fn fee_applies_rate() {
        assert_eq!(fee(m(1000.0), dec!(0.0004)), m(0.4));
    }

    // Law 4: percent<->price round trip, checked via the S1/S2 fixtures
    // from the spec (entry=100, sl%=5, tp%=10 and entry=50 short, price
    // mode) rather than synthesizing arbitrary doubles that would also
    // need to dodge rust_decimal rounding.
    #[test]
    fn percent_round_trip_long() {
        let entry = m(100.0);
        let sl = sl_price_from_percent(Side::Long, entry, dec!(5));
        assert_eq!(sl, m(95.0));
        assert!(should_trigger_sl(Side::Long, sl, Some(sl)));
        assert!(!should_trigger_sl(Side::Long, sl + m(0.01), Some(sl)));

        let tp = tp_price_from_percent(Side::Long, entry, dec!(10));
        assert_eq!(tp, m(110.0));
        assert!(should_trigger_tp(Side::Long, tp, Some(tp)));
        assert!(!should_trigger_tp(Side::Long, tp - m(0.01), Some(tp)));
    }

    #[test]
    fn percent_round_trip_short() {
        let entry = m(50.0);
        let sl = sl_price_from_percent(Side::Short, entry, dec!(4));
        assert_eq!(sl, m(52.0));
        assert!(should_trigger_sl(Side::Short, sl, Some(sl)));
        assert!(!should_trigger_sl(Side::Short, sl - m(0.01), Some(sl)));
    }

    #[test]
    fn trigger_prioritization_sl_over_tp_on_same_tick() {
        // S3: LONG entry=100, sl=95, tp=94, mark=94 -> SL must win.
        let side = Side::Long;
        let sl = Some(m(95.0));
        let tp = Some(m(94.0));
        let mark = m(94.0);
        assert!(should_trigger_sl(side, mark, sl));
        // Caller is responsible for the short-circuit; this only proves
        // both predicates can be simultaneously true, which is what makes
        // the `continue` after SL in the trigger engine load-bearing.
        assert!(should_trigger_tp(side, mark, tp));
    }

    #[test]
    fn s1_long_market_wins_on_tp() {
        let qty = m(10.0);
        let entry = m(100.0);
        let close = m(110.0);
        let fees_open = m(0.4);
        let fees_close = fee(notional(qty, close), dec!(0.0004));
        assert_eq!(fees_close, m(0.44));
        let pnl = realized_pnl(Side::Long, entry, close, qty, fees_open, fees_close, Money::ZERO);
        assert_eq!(pnl, m(99.16));
    }

    #[test]
    fn s2_short_stops_out() {
        let qty = m(2.0);
        let entry = m(50.0);
        let close = m(52.0);
        let fees_open = fee(notional(qty, entry), dec!(0.0004));
        assert_eq!(fees_open, m(0.04));
        let fees_close = fee(notional(qty, close), dec!(0.0004));
        assert_eq!(fees_close, m(0.0416));
        let pnl = realized_pnl(Side::Short, entry, close, qty, fees_open, fees_close, Money::ZERO);
        assert_eq!(pnl, m(-4.0816));
    }

    #[test]
    fn pnl_determinism_law() {
        // realizedPnl + feesOpen + feesClose + fundingPnl == grossPnl
        let qty = m(2.0);
        let entry = m(50.0);
        let close = m(52.0);
        let fees_open = m(0.04);
        let fees_close = m(0.0416);
        let funding = Money::ZERO;
        let pnl = realized_pnl(Side::Short, entry, close, qty, fees_open, fees_close, funding);
        let gross = gross_pnl(Side::Short, entry, close, qty);
        assert_eq!(pnl + fees_open + fees_close + funding, gross);
    }
}
