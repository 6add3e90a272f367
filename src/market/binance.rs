use crate::market::{timeframe_to_ms, Candle, HistorySource, MarketDataError};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use log::warn;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

const PAGE_LIMIT: usize = 1000;
const MAX_ATTEMPTS: u32 = 4;

/// Spot klines from the Binance public REST API.
pub struct BinanceHistory {
    client: reqwest::Client,
    base_url: String,
}

pub(crate) fn build_history_http_client() -> Result<reqwest::Client, MarketDataError> {
    let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));

    if let Ok(raw) = std::env::var("HISTORY_PROXY") {
        let t = raw.trim();
        if !t.is_empty() {
            let url = if t.contains("://") {
                t.to_string()
            } else {
                format!("socks5h://{}", t)
            };
            let proxy =
                reqwest::Proxy::all(&url).map_err(|e| MarketDataError::Fetch(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
    }

    builder
        .build()
        .map_err(|e| MarketDataError::Fetch(e.to_string()))
}

/// `BTC/USDT` and `BTC/USDT:USDT` -> `BTCUSDT`
fn binance_symbol(pair: &str) -> String {
    let spot = pair.split(':').next().unwrap_or(pair);
    spot.replace('/', "").to_uppercase()
}

fn year_start_ms(year: i32) -> Option<i64> {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .map(|d| d.and_time(NaiveTime::default()).and_utc().timestamp_millis())
}

fn num(row: &[Value], idx: usize) -> Option<f64> {
    match row.get(idx)? {
        Value::String(s) => s.parse().ok(),
        v => v.as_f64(),
    }
}

fn parse_row(row: &Value) -> Option<Candle> {
    let row = row.as_array()?;
    Some(Candle {
        timestamp: row.first()?.as_i64()?,
        open: num(row, 1)?,
        high: num(row, 2)?,
        low: num(row, 3)?,
        close: num(row, 4)?,
        volume: num(row, 5)?,
    })
}

impl BinanceHistory {
    pub fn new(base_url: &str) -> Result<Self, MarketDataError> {
        Ok(Self {
            client: build_history_http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn page(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, MarketDataError> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let query = [
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("startTime", start_ms.to_string()),
            ("endTime", end_ms.to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];

        let mut last_err = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            let resp = match self.client.get(&url).query(&query).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = format!("network error: {}", e);
                    warn!("⚠ klines {} attempt {}/{}: {}", symbol, attempt, MAX_ATTEMPTS, last_err);
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    continue;
                }
            };

            let status = resp.status();
            if status.is_success() {
                let rows: Vec<Value> = resp
                    .json()
                    .await
                    .map_err(|e| MarketDataError::Fetch(format!("invalid klines body: {}", e)))?;
                return Ok(rows.iter().filter_map(parse_row).collect());
            }

            let text = resp.text().await.unwrap_or_default();
            match status {
                StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => {
                    last_err = format!("rate limited ({})", status);
                }
                s if s.is_server_error() => {
                    last_err = format!("server error ({})", s);
                }
                s => {
                    return Err(MarketDataError::Fetch(format!(
                        "klines {} rejected ({}): {}",
                        symbol, s, text
                    )));
                }
            }
            warn!("⚠ klines {} attempt {}/{}: {}", symbol, attempt, MAX_ATTEMPTS, last_err);
            tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
        }

        Err(MarketDataError::Fetch(format!(
            "klines {} gave up after {} attempts: {}",
            symbol, MAX_ATTEMPTS, last_err
        )))
    }
}

#[async_trait]
impl HistorySource for BinanceHistory {
    async fn fetch_year(
        &self,
        exchange: &str,
        pair: &str,
        timeframe: &str,
        year: i32,
    ) -> Result<Vec<Candle>, MarketDataError> {
        if !exchange.eq_ignore_ascii_case("binance") {
            return Err(MarketDataError::UnsupportedExchange(exchange.to_string()));
        }
        let (Some(since), Some(until)) = (year_start_ms(year), year_start_ms(year + 1)) else {
            return Err(MarketDataError::Fetch(format!("year out of range: {}", year)));
        };
        let symbol = binance_symbol(pair);
        let step = timeframe_to_ms(timeframe);

        let mut out = Vec::new();
        let mut cursor = since;
        while cursor < until {
            let batch = self.page(&symbol, timeframe, cursor, until - 1).await?;
            let Some(last) = batch.last() else {
                break;
            };
            let next = (last.timestamp + step).max(cursor + step);
            let full = batch.len() >= PAGE_LIMIT;
            out.extend(batch);
            if !full {
                break;
            }
            cursor = next;
        }
        Ok(out)
    }
}
