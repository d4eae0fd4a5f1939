//! Local paper-trading simulator for perpetual-futures markets
//!
//! Streams live mark prices, evaluates every open position's stop-loss and
//! take-profit on each tick, and persists the full position/fill/event
//! ledger to SQLite so a restart picks up exactly where it left off.

pub mod api;
pub mod broker;
pub mod calc;
pub mod config;
pub mod csv_export;
pub mod error;
pub mod exchange;
pub mod live_stream;
pub mod price_feed;
pub mod store;
pub mod trigger_engine;
pub mod types;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use types::*;
