pub mod binance;
pub mod cache;

pub use binance::BinanceHistory;
pub use cache::MarketDataCache;

use crate::artifact::ArtifactError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One OHLCV bar; `timestamp` is the open time in epoch milliseconds (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(thiserror::Error, Debug)]
pub enum MarketDataError {
    #[error("no historical data available for {0}")]
    NoData(String),
    #[error("unsupported exchange: {0}")]
    UnsupportedExchange(String),
    #[error("history fetch failed: {0}")]
    Fetch(String),
    #[error("market cache store error: {0}")]
    Store(#[from] ArtifactError),
    #[error("market cache io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Upstream provider of raw candles, one calendar year at a time.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_year(
        &self,
        exchange: &str,
        pair: &str,
        timeframe: &str,
        year: i32,
    ) -> Result<Vec<Candle>, MarketDataError>;
}

/// `BTC/USDT:USDT` -> `btc-usdt-usdt`
pub fn pair_slug(pair: &str) -> String {
    pair.replace(['/', ':'], "-").to_lowercase()
}

/// Bar length in milliseconds. Unknown or empty timeframes fall back to one hour.
pub fn timeframe_to_ms(timeframe: &str) -> i64 {
    const MINUTE: i64 = 60 * 1000;
    let tf = timeframe.trim();
    let Some(unit) = tf.chars().last() else {
        return 60 * MINUTE;
    };
    let digits = &tf[..tf.len() - unit.len_utf8()];
    let value: i64 = if digits.is_empty() {
        1
    } else {
        match digits.parse() {
            Ok(v) => v,
            Err(_) => return 60 * MINUTE,
        }
    };
    match unit {
        'm' => value * MINUTE,
        'h' => value * 60 * MINUTE,
        'd' => value * 24 * 60 * MINUTE,
        'w' => value * 7 * 24 * 60 * MINUTE,
        _ => 60 * MINUTE,
    }
}
