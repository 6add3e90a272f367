use crate::market::MarketDataError;
use crate::research::model::{Kpis, MarketSpec, ParamSet};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Strategy source downloaded once per job and shared by every child run.
#[derive(Clone, Debug)]
pub struct StrategyArtifact {
    pub path: PathBuf,
    pub manifest: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    WalkForwardTest,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::WalkForwardTest => "walkforward_test",
        }
    }
}

pub struct EngineRequest<'a> {
    pub strategy: &'a StrategyArtifact,
    pub spec: &'a MarketSpec,
    pub params: &'a ParamSet,
    pub phase: Option<Phase>,
    /// Scratch directory owned by this invocation.
    pub workdir: &'a Path,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDescriptor {
    pub path: PathBuf,
    pub name: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl ArtifactDescriptor {
    pub fn new(path: impl Into<PathBuf>, name: &str, content_type: &str) -> Self {
        Self {
            path: path.into(),
            name: name.to_string(),
            content_type: Some(content_type.to_string()),
        }
    }

    /// Declared content type, else a guess from the file name.
    pub fn content_type(&self) -> &str {
        if let Some(ct) = self.content_type.as_deref().filter(|c| !c.is_empty()) {
            return ct;
        }
        match self.name.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
            Some("csv") => "text/csv",
            Some("json") => "application/json",
            Some("txt") | Some("log") => "text/plain",
            Some("html") => "text/html",
            Some("png") => "image/png",
            _ => "application/octet-stream",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct EngineOutput {
    /// May be empty; an empty map is a valid result.
    pub kpis: Kpis,
    pub artifacts: Vec<ArtifactDescriptor>,
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("engine exited with status {code:?}: {tail}")]
    Exit { code: Option<i32>, tail: String },
    #[error("engine produced invalid output: {0}")]
    InvalidOutput(String),
    #[error("engine could not be started: {0}")]
    Spawn(String),
    #[error("engine workspace io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Data(#[from] MarketDataError),
}

/// External computation: (strategy, spec, params, phase) -> (kpis, artifacts).
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn run(&self, req: EngineRequest<'_>) -> Result<EngineOutput, EngineError>;
}
