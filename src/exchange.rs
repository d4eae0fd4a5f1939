//! REST fallback for resolving prices the live feed doesn't have yet: the
//! very first tick after subscribing, or a MARKET entry for a symbol that
//! isn't already being watched.
//!
//! Abstracted behind a trait so the broker can be exercised in tests without
//! a live network call.

use crate::error::{AppError, AppResult};
use crate::types::{Money, Symbol};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub trait ExchangeRest: Send + Sync {
    fn get_price<'a>(
        &'a self,
        symbol: &'a Symbol,
    ) -> Pin<Box<dyn Future<Output = AppResult<Money>> + Send + 'a>>;
}

pub struct BinanceRestClient {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceRestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client builder should not fail with default TLS backend");
        BinanceRestClient { client, base_url: base_url.into() }
    }
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

impl ExchangeRest for BinanceRestClient {
    fn get_price<'a>(
        &'a self,
        symbol: &'a Symbol,
    ) -> Pin<Box<dyn Future<Output = AppResult<Money>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, symbol.as_str());
            let resp = self.client.get(&url).send().await?.error_for_status()?;
            let ticker: TickerPrice = resp.json().await?;
            ticker
                .price
                .parse::<rust_decimal::Decimal>()
                .map(Money::from_decimal)
                .map_err(|e| AppError::Upstream(format!("unparseable price from exchange: {e}")))
        })
    }
}

/// Test-only stand-in for a live exchange; kept unguarded by `cfg(test)` so
/// integration tests in `tests/` can depend on it too.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Fixed-price stand-in for `ExchangeRest`, used by broker tests.
    pub struct MockExchange {
        prices: Mutex<HashMap<Symbol, Money>>,
    }

    impl MockExchange {
        pub fn new() -> Self {
            MockExchange { prices: Mutex::new(HashMap::new()) }
        }

        pub fn set_price(&self, symbol: Symbol, price: Money) {
            self.prices.lock().unwrap().insert(symbol, price);
        }
    }

    impl ExchangeRest for MockExchange {
        fn get_price<'a>(
            &'a self,
            symbol: &'a Symbol,
        ) -> Pin<Box<dyn Future<Output = AppResult<Money>> + Send + 'a>> {
            let price = self.prices.lock().unwrap().get(symbol).copied();
            Box::pin(async move {
                price.ok_or_else(|| AppError::Upstream(format!("no mock price for {symbol}")))
            })
        }
    }
}
