//! Runtime configuration
//!
//! Loaded from environment variables (with an optional `.env` file picked up
//! via `dotenv`), each with a sane default so the server runs out of the box
//! against Binance's public endpoints and a local SQLite file.

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub binance_ws_url: String,
    pub binance_rest_url: String,
    pub database_path: String,
    pub log_level: String,
    pub http_bind: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            binance_ws_url: "wss://fstream.binance.com/ws".to_string(),
            binance_rest_url: "https://fapi.binance.com".to_string(),
            database_path: "paper_trader.db".to_string(),
            log_level: "info".to_string(),
            http_bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads config from the environment, falling back to defaults for
    /// anything unset. Call once at startup, before `setup_logging`.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();
        let defaults = AppConfig::default();
        Ok(AppConfig {
            binance_ws_url: std::env::var("BINANCE_WS_URL").unwrap_or(defaults.binance_ws_url),
            binance_rest_url: std::env::var("BINANCE_REST_URL").unwrap_or(defaults.binance_rest_url),
            database_path: std::env::var("DATABASE_PATH").unwrap_or(defaults.database_path),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            http_bind: std::env::var("HTTP_BIND").unwrap_or(defaults.http_bind),
        })
    }
}
