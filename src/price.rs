// ===============================
// src/price.rs (price feed collaborator)
// ===============================
//
// Adapters behind `PriceFeed`:
// - StaticPrices   : in-memory table (PRICES="AAPL=150,MSFT=300")
// - run_random_walk: mock market that nudges a StaticPrices table
// - HttpPriceFeed  : GET {PRICE_URL with {ticker}} -> {"price": ...}
//
// Every lookup made by the PnL workers goes through `price_with_timeout`.
//
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::metrics::PRICE_MISSES;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PriceError {
    #[error("no price for {0}")]
    NotFound(String),
    #[error("price lookup for {0} timed out")]
    Timeout(String),
    #[error("price transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait PriceFeed: Send + Sync + 'static {
    async fn price(&self, ticker: &str) -> Result<Decimal, PriceError>;
}

/// Looks up `ticker`, giving up after `limit`. Misses are counted per ticker.
pub async fn price_with_timeout(feed: &dyn PriceFeed, ticker: &str, limit: Duration) -> Result<Decimal, PriceError> {
    let res = match timeout(limit, feed.price(ticker)).await {
        Ok(r) => r,
        Err(_) => Err(PriceError::Timeout(ticker.to_string())),
    };
    if res.is_err() {
        PRICE_MISSES.with_label_values(&[ticker]).inc();
    }
    res
}

#[derive(Debug, Default)]
pub struct StaticPrices {
    table: RwLock<HashMap<String, Decimal>>,
}

impl StaticPrices {
    pub fn new(prices: impl IntoIterator<Item = (String, Decimal)>) -> Self {
        Self { table: RwLock::new(prices.into_iter().collect()) }
    }

    /// Parses `"AAPL=150,MSFT=300.5"`; malformed items are skipped with a warning.
    pub fn parse_table(s: &str) -> Self {
        let mut out = Vec::new();
        for item in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match item.split_once('=').map(|(t, p)| (t.trim(), Decimal::from_str(p.trim()))) {
                Some((t, Ok(px))) if !t.is_empty() => out.push((t.to_ascii_uppercase(), px)),
                _ => warn!(%item, "ignoring malformed price entry"),
            }
        }
        Self::new(out)
    }

    pub fn set(&self, ticker: &str, px: Decimal) {
        if let Ok(mut t) = self.table.write() {
            t.insert(ticker.to_string(), px);
        }
    }

    pub fn tickers(&self) -> Vec<String> {
        self.table.read().map(|t| t.keys().cloned().collect()).unwrap_or_default()
    }
}

#[async_trait]
impl PriceFeed for StaticPrices {
    async fn price(&self, ticker: &str) -> Result<Decimal, PriceError> {
        let table = self
            .table
            .read()
            .map_err(|_| PriceError::Transport("price table poisoned".into()))?;
        table
            .get(ticker)
            .or_else(|| table.get(&ticker.to_ascii_uppercase()))
            .copied()
            .ok_or_else(|| PriceError::NotFound(ticker.to_string()))
    }
}

/// Mock market: random walk of every ticker in `prices` by up to ±`step_bps`
/// basis points per tick.
pub async fn run_random_walk(prices: Arc<StaticPrices>, step_bps: i64, every: Duration) {
    info!(step_bps, every_ms = every.as_millis() as u64, "price random walk started");
    loop {
        for ticker in prices.tickers() {
            let Ok(current) = prices.price(&ticker).await else { continue };
            // do not hold ThreadRng across .await
            let bps = rand::thread_rng().gen_range(-step_bps..=step_bps);
            let next = (current + current * Decimal::new(bps, 4)).round_dp(2);
            if next > Decimal::ZERO {
                prices.set(&ticker, next);
            }
        }
        sleep(every).await;
    }
}

/// HTTP JSON price endpoint. `url` contains a `{ticker}` placeholder and the
/// response is either a bare number or an object with a `price` field.
pub struct HttpPriceFeed {
    http: reqwest::Client,
    url: String,
}

impl HttpPriceFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), url: url.into() }
    }

    fn parse_body(ticker: &str, v: &serde_json::Value) -> Result<Decimal, PriceError> {
        let raw = v.get("price").unwrap_or(v);
        let text = match raw {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return Err(PriceError::NotFound(ticker.to_string())),
        };
        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(|_| PriceError::NotFound(ticker.to_string()))
    }
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    async fn price(&self, ticker: &str) -> Result<Decimal, PriceError> {
        let url = self.url.replace("{ticker}", ticker);
        debug!(%url, "fetching price");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PriceError::Transport(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PriceError::NotFound(ticker.to_string()));
        }
        let v: serde_json::Value = resp
            .error_for_status()
            .map_err(|e| PriceError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| PriceError::Transport(e.to_string()))?;
        Self::parse_body(ticker, &v)
    }
}
