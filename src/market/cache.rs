use crate::artifact::ArtifactStore;
use crate::market::{pair_slug, Candle, HistorySource, MarketDataError};
use crate::research::model::MarketSpec;
use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Utc};
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Per-year candle cache: local file, then the artifact store, then the history source.
/// Whatever had to be fetched is written back to both layers.
pub struct MarketDataCache {
    cache_dir: PathBuf,
    store: Option<ArtifactStore>,
    source: Arc<dyn HistorySource>,
}

struct YearKey<'a> {
    exchange: &'a str,
    pair: &'a str,
    timeframe: &'a str,
    year: i32,
}

impl YearKey<'_> {
    fn file_name(&self) -> String {
        format!(
            "{}_{}_{}_{}.json",
            self.exchange,
            pair_slug(self.pair),
            self.timeframe,
            self.year
        )
    }

    fn blob_key(&self) -> String {
        format!(
            "data/{}/{}/{}/{}.json",
            self.exchange,
            pair_slug(self.pair),
            self.timeframe,
            self.year
        )
    }
}

fn default_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2022, 1, 1).unwrap_or(NaiveDate::MIN)
}

fn day_start_ms(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::default()).and_utc().timestamp_millis()
}

/// Effective `[start, end]` of a spec: missing start is 2022-01-01, missing end is
/// today, and an empty or inverted range becomes thirty days from start.
pub fn effective_range(spec: &MarketSpec) -> (NaiveDate, NaiveDate) {
    let start = spec.start_date().unwrap_or_else(default_start);
    let mut end = spec.end_date().unwrap_or_else(|| Utc::now().date_naive());
    if end <= start {
        end = start + Duration::days(30);
    }
    (start, end)
}

impl MarketDataCache {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        store: Option<ArtifactStore>,
        source: Arc<dyn HistorySource>,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            store,
            source,
        }
    }

    /// Sorted, de-duplicated candles covering the requested date range.
    pub async fn load(&self, spec: &MarketSpec) -> Result<Vec<Candle>, MarketDataError> {
        let exchange = spec.exchange.to_lowercase();
        let (start, end) = effective_range(spec);
        let (start_ms, end_ms) = (day_start_ms(start), day_start_ms(end));

        tokio::fs::create_dir_all(&self.cache_dir).await?;

        let mut merged: BTreeMap<i64, Candle> = BTreeMap::new();
        for year in start.year()..=end.year() {
            let key = YearKey {
                exchange: &exchange,
                pair: &spec.pair,
                timeframe: &spec.timeframe,
                year,
            };
            for candle in self.load_year(&key).await? {
                if candle.timestamp >= start_ms && candle.timestamp <= end_ms {
                    merged.entry(candle.timestamp).or_insert(candle);
                }
            }
        }

        if merged.is_empty() {
            return Err(MarketDataError::NoData(format!(
                "{} {} {} {}..{}",
                exchange, spec.pair, spec.timeframe, start, end
            )));
        }
        Ok(merged.into_values().collect())
    }

    async fn load_year(&self, key: &YearKey<'_>) -> Result<Vec<Candle>, MarketDataError> {
        let local = self.cache_dir.join(key.file_name());

        if !local.exists() && !self.pull_from_store(key, &local).await? {
            let candles = self.fetch(key).await?;
            if candles.is_empty() {
                return Ok(candles);
            }
            self.write_through(key, &local, &candles).await?;
            return Ok(candles);
        }

        match read_candles(&local).await {
            Ok(candles) => Ok(candles),
            Err(e) => {
                warn!("⚠ unreadable market cache {} ({}), refetching", local.display(), e);
                let candles = self.fetch(key).await?;
                if !candles.is_empty() {
                    self.write_through(key, &local, &candles).await?;
                }
                Ok(candles)
            }
        }
    }

    async fn pull_from_store(&self, key: &YearKey<'_>, local: &Path) -> Result<bool, MarketDataError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        match store.get_opt(&key.blob_key()).await? {
            Some(data) => {
                tokio::fs::write(local, data).await?;
                info!("cached {} -> {}", store.location(&key.blob_key()), local.display());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fetch(&self, key: &YearKey<'_>) -> Result<Vec<Candle>, MarketDataError> {
        info!(
            "fetching {} {} {} for {}",
            key.exchange, key.pair, key.timeframe, key.year
        );
        self.source
            .fetch_year(key.exchange, key.pair, key.timeframe, key.year)
            .await
    }

    async fn write_through(
        &self,
        key: &YearKey<'_>,
        local: &Path,
        candles: &[Candle],
    ) -> Result<(), MarketDataError> {
        let body = serde_json::to_vec(candles).map_err(crate::artifact::ArtifactError::from)?;
        tokio::fs::write(local, &body).await?;
        if let Some(store) = &self.store {
            store
                .put_bytes(&key.blob_key(), body, "application/json")
                .await?;
        }
        Ok(())
    }
}

async fn read_candles(path: &Path) -> Result<Vec<Candle>, String> {
    let data = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    serde_json::from_slice(&data).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOUR: i64 = 3_600_000;

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HistorySource for CountingSource {
        async fn fetch_year(
            &self,
            _exchange: &str,
            _pair: &str,
            _timeframe: &str,
            year: i32,
        ) -> Result<Vec<Candle>, MarketDataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let base = day_start_ms(NaiveDate::from_ymd_opt(year, 1, 1).unwrap());
            Ok((0..48)
                .map(|i| Candle {
                    timestamp: base + i * HOUR,
                    open: 1.0,
                    high: 2.0,
                    low: 0.5,
                    close: 1.5,
                    volume: 10.0,
                })
                .collect())
        }
    }

    fn spec(start: &str, end: &str) -> MarketSpec {
        MarketSpec {
            start: Some(start.into()),
            end: Some(end.into()),
            ..MarketSpec::default()
        }
    }

    #[tokio::test]
    async fn fetches_once_then_reads_through_both_layers() {
        let store = ArtifactStore::in_memory();
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0) });
        let dir = tempfile::tempdir().unwrap();

        let cache = MarketDataCache::new(dir.path().join("a"), Some(store.clone()), source.clone());
        let candles = cache.load(&spec("2022-01-01", "2022-01-02")).await.unwrap();
        assert_eq!(candles.len(), 25);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("a/binance_btc-usdt_1h_2022.json").exists());
        assert!(store.get_opt("data/binance/btc-usdt/1h/2022.json").await.unwrap().is_some());

        // Same local dir: served from the file.
        cache.load(&spec("2022-01-01", "2022-01-02")).await.unwrap();
        // Fresh local dir: served from the store.
        let other = MarketDataCache::new(dir.path().join("b"), Some(store), source.clone());
        other.load(&spec("2022-01-01", "2022-01-02")).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("b/binance_btc-usdt_1h_2022.json").exists());
    }

    #[tokio::test]
    async fn corrupt_local_file_is_refetched() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0) });
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("binance_btc-usdt_1h_2022.json"), "{oops").unwrap();

        let cache = MarketDataCache::new(dir.path(), None, source.clone());
        let candles = cache.load(&spec("2022-01-01", "2022-01-03")).await.unwrap();
        assert_eq!(candles.len(), 48);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn range_outside_data_is_unavailable() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0) });
        let dir = tempfile::tempdir().unwrap();
        let cache = MarketDataCache::new(dir.path(), None, source);

        let err = cache.load(&spec("2022-03-01", "2022-04-01")).await.unwrap_err();
        assert!(matches!(err, MarketDataError::NoData(_)));
    }

    #[test]
    fn inverted_range_becomes_thirty_days() {
        let (start, end) = effective_range(&spec("2022-05-01", "2022-04-01"));
        assert_eq!(start, NaiveDate::from_ymd_opt(2022, 5, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2022, 5, 31).unwrap());
    }
}
