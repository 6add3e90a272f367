use crate::artifact::ArtifactError;
use crate::engine::EngineError;
use crate::market::MarketDataError;
use crate::storage::entity::RunKind;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub type ParamSet = Map<String, Value>;
pub type Kpis = Map<String, Value>;

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    /// Body is not a usable job; retrying cannot help.
    #[error("malformed job message: {0}")]
    Malformed(String),
    #[error("unknown job kind: {0}")]
    UnknownKind(String),
    /// Parsed fine but cannot be executed as submitted (empty grid, bad walk-forward spec).
    #[error("invalid job: {0}")]
    Invalid(String),
    #[error("infrastructure error: {0}")]
    Infra(String),
    #[error("data unavailable: {0}")]
    DataUnavailable(String),
    #[error("engine execution failed: {0}")]
    Engine(String),
}

impl JobError {
    /// Permanent errors are acknowledged; everything else is left for redelivery.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            JobError::Malformed(_) | JobError::UnknownKind(_) | JobError::Invalid(_)
        )
    }
}

impl From<ArtifactError> for JobError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::NotFound(key) => JobError::DataUnavailable(format!("missing object {}", key)),
            other => JobError::Infra(other.to_string()),
        }
    }
}

impl From<MarketDataError> for JobError {
    fn from(err: MarketDataError) -> Self {
        match err {
            MarketDataError::Store(inner) => JobError::Infra(inner.to_string()),
            MarketDataError::Io(inner) => JobError::Infra(inner.to_string()),
            other => JobError::DataUnavailable(other.to_string()),
        }
    }
}

impl From<EngineError> for JobError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Data(inner) => inner.into(),
            other => JobError::Engine(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backtest,
    Grid,
    Walkforward,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Backtest => "backtest",
            JobKind::Grid => "grid",
            JobKind::Walkforward => "walkforward",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "backtest" => Ok(JobKind::Backtest),
            "grid" => Ok(JobKind::Grid),
            "walkforward" => Ok(JobKind::Walkforward),
            other => Err(JobError::UnknownKind(other.to_string())),
        }
    }
}

impl From<JobKind> for RunKind {
    fn from(kind: JobKind) -> Self {
        match kind {
            JobKind::Backtest => RunKind::Backtest,
            JobKind::Grid => RunKind::Grid,
            JobKind::Walkforward => RunKind::Walkforward,
        }
    }
}

fn default_exchange() -> String {
    "binance".to_string()
}

fn default_pair() -> String {
    "BTC/USDT".to_string()
}

fn default_timeframe() -> String {
    "1h".to_string()
}

/// Market and time range a job runs against. Unknown fields are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSpec {
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_pair")]
    pub pair: String,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for MarketSpec {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            pair: default_pair(),
            timeframe: default_timeframe(),
            start: None,
            end: None,
            extra: Map::new(),
        }
    }
}

impl MarketSpec {
    pub fn start_date(&self) -> Option<NaiveDate> {
        self.start.as_deref().and_then(parse_date)
    }

    pub fn end_date(&self) -> Option<NaiveDate> {
        self.end.as_deref().and_then(parse_date)
    }
}

/// Accepts `YYYY-MM-DD`, RFC 3339 timestamps and naive `YYYY-MM-DDTHH:MM:SS`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|ts| ts.date())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkForwardSpec {
    pub train_months: u32,
    pub test_months: u32,
    pub step_months: u32,
}

impl WalkForwardSpec {
    /// Reads the submitted `walkforward` object. Month counts may be integers or integer
    /// strings (`"3"`); anything else is `Invalid`.
    pub fn from_value(raw: &Value) -> Result<Self, JobError> {
        let Value::Object(fields) = raw else {
            return Err(JobError::Invalid("walkforward must be an object".into()));
        };
        let spec = Self {
            train_months: month_count(fields, "trainMonths")?,
            test_months: month_count(fields, "testMonths")?,
            step_months: month_count(fields, "stepMonths")?,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.test_months == 0 {
            return Err(JobError::Invalid("walkforward.testMonths must be at least 1".into()));
        }
        if self.step_months == 0 {
            return Err(JobError::Invalid("walkforward.stepMonths must be at least 1".into()));
        }
        Ok(())
    }
}

fn month_count(fields: &Map<String, Value>, key: &str) -> Result<u32, JobError> {
    let invalid = |what: &str| JobError::Invalid(format!("walkforward.{} {}", key, what));
    let count = match fields.get(key) {
        None | Some(Value::Null) => return Err(invalid("is required")),
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    }
    .ok_or_else(|| invalid("must be an integer"))?;
    u32::try_from(count).map_err(|_| invalid("must not be negative"))
}

/// Kind-specific work. The variant is the dispatch key.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPlan {
    Backtest { params: ParamSet },
    Grid { grid: Vec<ParamSet> },
    /// Raw `walkforward` object; read when the job runs so a bad one fails the run.
    WalkForward { walkforward: Option<Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub run_id: String,
    pub strategy_id: String,
    pub owner_id: Option<String>,
    pub spec: MarketSpec,
    pub manifest_key: String,
    pub artifact_prefix: String,
    /// Submitted `params`, recorded on the run row regardless of kind.
    pub params: ParamSet,
    pub plan: JobPlan,
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self.plan {
            JobPlan::Backtest { .. } => JobKind::Backtest,
            JobPlan::Grid { .. } => JobKind::Grid,
            JobPlan::WalkForward { .. } => JobKind::Walkforward,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobPayload {
    strategy_id: String,
    #[serde(default)]
    owner_id: Option<String>,
    #[serde(default)]
    spec: Option<MarketSpec>,
    #[serde(alias = "manifestS3Key")]
    manifest_key: String,
    #[serde(default)]
    params: Option<ParamSet>,
    #[serde(default)]
    grid: Option<Vec<ParamSet>>,
    #[serde(default)]
    walkforward: Option<Value>,
}

/// First parsing stage: enough to identify the run before the body is fully validated.
#[derive(Debug, Clone)]
pub struct JobEnvelope {
    pub run_id: String,
    pub artifact_prefix: String,
    pub kind: String,
    body: Map<String, Value>,
}

impl JobEnvelope {
    pub fn parse(body: &str) -> Result<Self, JobError> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| JobError::Malformed(e.to_string()))?;
        let Value::Object(body) = value else {
            return Err(JobError::Malformed("job body is not a JSON object".into()));
        };

        let run_id = non_empty_str(&body, "runId")
            .map(str::to_string)
            .unwrap_or_else(|| format!("r_{}", uuid::Uuid::new_v4()));
        let artifact_prefix = non_empty_str(&body, "artifactPrefix")
            .map(str::to_string)
            .unwrap_or_else(|| format!("runs/{}/", run_id));
        let kind = non_empty_str(&body, "kind")
            .unwrap_or("backtest")
            .to_lowercase();

        Ok(Self {
            run_id,
            artifact_prefix,
            kind,
            body,
        })
    }

    pub fn into_job(self) -> Result<Job, JobError> {
        let kind: JobKind = self.kind.parse()?;
        let payload: JobPayload = serde_json::from_value(Value::Object(self.body))
            .map_err(|e| JobError::Malformed(e.to_string()))?;

        let params = payload.params.unwrap_or_default();
        let plan = match kind {
            JobKind::Backtest => JobPlan::Backtest {
                params: params.clone(),
            },
            JobKind::Grid => JobPlan::Grid {
                grid: payload.grid.unwrap_or_default(),
            },
            JobKind::Walkforward => JobPlan::WalkForward {
                walkforward: payload.walkforward.filter(|v| !v.is_null()),
            },
        };

        Ok(Job {
            run_id: self.run_id,
            strategy_id: payload.strategy_id,
            owner_id: payload.owner_id,
            spec: payload.spec.unwrap_or_default(),
            manifest_key: payload.manifest_key,
            artifact_prefix: self.artifact_prefix,
            params,
            plan,
        })
    }
}

fn non_empty_str<'a>(body: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
