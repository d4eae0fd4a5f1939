//! Core data types shared across the trading engine

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// Trading pair symbol using `Arc<str>` for cheap cloning.
///
/// Symbols are cloned frequently: positions, PriceFeed subscriptions, the
/// trigger engine's per-symbol index, and every SSE frame all carry one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref().to_uppercase().as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Binance wire format subscribes to lowercase stream names.
    pub fn to_lowercase(&self) -> String {
        self.0.to_lowercase()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Symbol::new(s)
    }
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Position lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::Open => write!(f, "OPEN"),
            PositionStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// How the requested position size was expressed on creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SizeMode {
    /// `sizeValue` is a notional amount in quote currency; qty = value / entryPrice.
    Usdt,
    /// `sizeValue` is already base-asset quantity.
    Qty,
}

/// Whether a position is entered at the live mark price or a resting limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryType {
    Market,
    Limit,
}

/// Whether an SL/TP value was supplied as an absolute price or a percent
/// offset from the entry price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriceMode {
    Price,
    Percent,
}

/// Append-only fill kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FillType {
    Open,
    Close,
    /// Reserved, unused in this version.
    Partial,
}

/// Position lifecycle event kind. Append-only, never mutated once written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    PositionCreated,
    SlTriggered,
    TpTriggered,
    ManualClose,
    SlUpdated,
    TpUpdated,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::PositionCreated => "POSITION_CREATED",
            EventKind::SlTriggered => "SL_TRIGGERED",
            EventKind::TpTriggered => "TP_TRIGGERED",
            EventKind::ManualClose => "MANUAL_CLOSE",
            EventKind::SlUpdated => "SL_UPDATED",
            EventKind::TpUpdated => "TP_UPDATED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "POSITION_CREATED" => Ok(EventKind::PositionCreated),
            "SL_TRIGGERED" => Ok(EventKind::SlTriggered),
            "TP_TRIGGERED" => Ok(EventKind::TpTriggered),
            "MANUAL_CLOSE" => Ok(EventKind::ManualClose),
            "SL_UPDATED" => Ok(EventKind::SlUpdated),
            "TP_UPDATED" => Ok(EventKind::TpUpdated),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// The central entity: a simulated perpetual-futures position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Money,
    pub entry_price: Money,
    pub entry_time: DateTime<Utc>,
    pub leverage: i32,
    pub fees_open: Money,
    pub notes: Option<String>,

    pub sl: Option<Money>,
    pub tp: Option<Money>,

    pub status: PositionStatus,
    pub close_price: Option<Money>,
    pub close_time: Option<DateTime<Utc>>,
    pub fees_close: Option<Money>,
    pub realized_pnl: Option<Money>,
    pub funding_pnl: Money,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// Append-only audit of entry/exit economics for a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub id: i64,
    pub position_id: i64,
    pub fill_type: FillType,
    pub price: Money,
    pub qty: Money,
    pub fee: Money,
    pub ts: DateTime<Utc>,
}

/// Append-only audit log entry for a position state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub position_id: i64,
    pub event: EventKind,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

/// Single-row global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub taker_fee: Decimal,
    pub maker_fee: Decimal,
    pub enable_funding: bool,
    pub base_balance: Money,
    pub default_stop_loss_percent: Option<Decimal>,
    pub default_take_profit_percent: Option<Decimal>,
    pub number_format: String,
    pub timezone: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            taker_fee: Decimal::new(4, 4),  // 0.0004
            maker_fee: Decimal::new(2, 4),  // 0.0002
            enable_funding: false,
            base_balance: Money::from_f64(10_000.0),
            default_stop_loss_percent: None,
            default_take_profit_percent: None,
            number_format: "en-US".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

/// Partial update to settings; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    pub taker_fee: Option<Decimal>,
    pub maker_fee: Option<Decimal>,
    pub enable_funding: Option<bool>,
    pub base_balance: Option<f64>,
    pub default_stop_loss_percent: Option<Decimal>,
    pub default_take_profit_percent: Option<Decimal>,
    pub number_format: Option<String>,
    pub timezone: Option<String>,
}

// ============================================================================
// Money - precise decimal arithmetic for monetary and price values
// ============================================================================

/// Wraps `rust_decimal::Decimal` to prevent floating-point drift in PnL
/// tracking. Used for all monetary values: prices, quantities, fees, pnl.
///
/// `0.1 + 0.2 != 0.3` in `f64`; over enough fills that drift would break the
/// PnL-determinism invariant (realizedPnl + fees + funding == gross pnl).
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn from_f64(value: f64) -> Self {
        Money(Decimal::try_from(value).unwrap_or(Decimal::ZERO))
    }

    pub fn from_decimal(value: Decimal) -> Self {
        Money(value)
    }

    pub fn to_f64(self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn inner(self) -> Decimal {
        self.0
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    pub fn round_dp(self, dp: u32) -> Self {
        Money(self.0.round_dp(dp))
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq for Money {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Money {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Mul for Money {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Money(self.0 * rhs.0)
    }
}

impl Div for Money {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        if rhs.0.is_zero() {
            Money::ZERO
        } else {
            Money(self.0 / rhs.0)
        }
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl From<f64> for Money {
    fn from(value: f64) -> Self {
        Money::from_f64(value)
    }
}

impl From<Money> for f64 {
    fn from(value: Money) -> Self {
        value.to_f64()
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_precision() {
        let a = Money::from_f64(0.1);
        let b = Money::from_f64(0.2);
        let c = Money::from_f64(0.3);
        assert_eq!(a + b, c);
    }

    #[test]
    fn money_div_by_zero_is_zero() {
        assert_eq!(Money::from_f64(100.0) / Money::ZERO, Money::ZERO);
    }

    #[test]
    fn symbol_normalizes_uppercase() {
        let s = Symbol::new("btcusdt");
        assert_eq!(s.as_str(), "BTCUSDT");
        assert_eq!(s.to_lowercase(), "btcusdt");
    }

    #[test]
    fn event_kind_round_trips_through_str() {
        for kind in [
            EventKind::PositionCreated,
            EventKind::SlTriggered,
            EventKind::TpTriggered,
            EventKind::ManualClose,
            EventKind::SlUpdated,
            EventKind::TpUpdated,
        ] {
            let s = kind.to_string();
            let parsed: EventKind = s.parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
