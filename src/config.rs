use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Settings shared by the queue worker and `run-local`.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub database_url: Option<String>,
    pub queue_wait: Duration,
    pub visibility: Duration,
    pub backoff_max: Duration,
    pub idle_log_every: u64,
    pub failure_pause: Duration,
    pub workdir: PathBuf,
    pub market_cache_dir: PathBuf,
    pub engine_bin: String,
    pub engine_args: Vec<String>,
    pub child_estimate: Duration,
    pub history_base_url: String,
}

/// Full configuration for the queue-driven worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub region: String,
    pub queue_url: String,
    pub bucket: String,
    pub runtime: RuntimeSettings,
}

struct Lookup<F> {
    get: F,
}

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Present and non-blank.
    fn value(&self, key: &str) -> Option<String> {
        (self.get)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.value(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.value(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value: raw }),
        }
    }

    fn secs(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_secs)
    }
}

impl RuntimeSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup { get };
        let engine_bin = env
            .value("ENGINE_BIN")
            .or_else(|| env.value("FREQTRADE_BIN"))
            .unwrap_or_else(|| "research-engine".to_string());
        let engine_args = env
            .value("ENGINE_ARGS")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Self {
            database_url: env.value("DATABASE_URL"),
            queue_wait: env.secs("QUEUE_WAIT_SECS", 20)?,
            visibility: env.secs("QUEUE_VISIBILITY_SECS", 900)?,
            backoff_max: env.secs("RECEIVE_BACKOFF_MAX_SECS", 30)?,
            idle_log_every: env.parse("IDLE_LOG_EVERY", 6)?,
            failure_pause: env.secs("FAILURE_PAUSE_SECS", 5)?,
            workdir: PathBuf::from(env.or("WORKDIR", "/tmp/workdir")),
            market_cache_dir: PathBuf::from(env.or("MARKET_CACHE_DIR", "/tmp/market-data")),
            engine_bin,
            engine_args,
            child_estimate: env.secs("ENGINE_CHILD_ESTIMATE_SECS", 60)?,
            history_base_url: env.or("HISTORY_BASE_URL", "https://api.binance.com"),
        })
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Every missing required key is reported at once.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup { get: &get };
        let queue_url = env.value("SQS_RESEARCH_JOBS_URL");
        let bucket = env.value("S3_BUCKET");

        let mut missing = Vec::new();
        if queue_url.is_none() {
            missing.push("SQS_RESEARCH_JOBS_URL");
        }
        if bucket.is_none() {
            missing.push("S3_BUCKET");
        }
        let (Some(queue_url), Some(bucket)) = (queue_url, bucket) else {
            return Err(ConfigError::Missing(missing));
        };

        Ok(Self {
            region: env.or("AWS_REGION", "ap-southeast-2"),
            queue_url,
            bucket,
            runtime: RuntimeSettings::from_lookup(&get)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn all_missing_required_values_reported_together() {
        let err = WorkerConfig::from_lookup(lookup(&[("S3_BUCKET", "  ")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing(vec!["SQS_RESEARCH_JOBS_URL", "S3_BUCKET"])
        );
        assert!(err.to_string().contains("SQS_RESEARCH_JOBS_URL, S3_BUCKET"));
    }

    #[test]
    fn defaults_apply() {
        let cfg = WorkerConfig::from_lookup(lookup(&[
            ("SQS_RESEARCH_JOBS_URL", "https://sqs.example/q"),
            ("S3_BUCKET", "research"),
        ]))
        .unwrap();

        assert_eq!(cfg.region, "ap-southeast-2");
        assert_eq!(cfg.runtime.database_url, None);
        assert_eq!(cfg.runtime.queue_wait, Duration::from_secs(20));
        assert_eq!(cfg.runtime.visibility, Duration::from_secs(900));
        assert_eq!(cfg.runtime.backoff_max, Duration::from_secs(30));
        assert_eq!(cfg.runtime.idle_log_every, 6);
        assert_eq!(cfg.runtime.engine_bin, "research-engine");
        assert_eq!(cfg.runtime.workdir, PathBuf::from("/tmp/workdir"));
    }

    #[test]
    fn overrides_and_legacy_engine_name() {
        let settings = RuntimeSettings::from_lookup(lookup(&[
            ("FREQTRADE_BIN", "/usr/local/bin/freqtrade-shim"),
            ("ENGINE_ARGS", "--fast  --quiet"),
            ("QUEUE_VISIBILITY_SECS", "3600"),
            ("DATABASE_URL", "sqlite://runs.db?mode=rwc"),
        ]))
        .unwrap();

        assert_eq!(settings.engine_bin, "/usr/local/bin/freqtrade-shim");
        assert_eq!(settings.engine_args, vec!["--fast", "--quiet"]);
        assert_eq!(settings.visibility, Duration::from_secs(3600));
        assert_eq!(settings.database_url.as_deref(), Some("sqlite://runs.db?mode=rwc"));
    }

    #[test]
    fn unparsable_numbers_are_rejected() {
        let err = RuntimeSettings::from_lookup(lookup(&[("QUEUE_WAIT_SECS", "twenty")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "QUEUE_WAIT_SECS",
                value: "twenty".into()
            }
        );
    }
}
