use crate::engine::types::{
    ArtifactDescriptor, EngineError, EngineOutput, EngineRequest, ExecutionEngine,
};
use crate::market::{Candle, MarketDataCache};
use crate::research::model::Kpis;
use async_trait::async_trait;
use chrono::DateTime;
use log::{debug, info};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Deserialize)]
struct ResultFile {
    #[serde(default)]
    kpis: Option<Kpis>,
    #[serde(default)]
    artifacts: Vec<ArtifactDescriptor>,
}

struct Workspace {
    root: PathBuf,
    strategies: PathBuf,
    data: PathBuf,
    results: PathBuf,
}

impl Workspace {
    async fn prepare(workdir: &Path) -> Result<Self, EngineError> {
        let root = workdir.join("engine");
        let ws = Self {
            strategies: root.join("strategies"),
            data: root.join("data"),
            results: root.join("results"),
            root,
        };
        if tokio::fs::try_exists(&ws.results).await? {
            tokio::fs::remove_dir_all(&ws.results).await?;
        }
        for dir in [&ws.strategies, &ws.data, &ws.results] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(ws)
    }
}

/// Runs an external engine binary per invocation.
///
/// The binary gets the path of `request.json` as its last argument (also in
/// `ENGINE_REQUEST`) and must leave `result.json` in `ENGINE_RESULTS_DIR`.
pub struct ProcessEngine {
    program: String,
    args: Vec<String>,
    market: Option<Arc<MarketDataCache>>,
}

impl ProcessEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            market: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Materialises candles for every invocation from this cache.
    pub fn with_market_data(mut self, market: Arc<MarketDataCache>) -> Self {
        self.market = Some(market);
        self
    }

    async fn write_dataset(
        &self,
        ws: &Workspace,
        req: &EngineRequest<'_>,
    ) -> Result<Option<PathBuf>, EngineError> {
        let Some(market) = &self.market else {
            return Ok(None);
        };
        let candles = market.load(req.spec).await?;

        let dir = ws.data.join(req.spec.exchange.to_lowercase());
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!(
            "{}-{}.json",
            req.spec.pair.replace('/', "_"),
            req.spec.timeframe
        ));
        let records: Vec<Value> = candles.iter().map(dataset_record).collect();
        tokio::fs::write(&path, serde_json::to_vec(&records).map_err(invalid)?).await?;
        debug!("dataset {} ({} candles)", path.display(), candles.len());
        Ok(Some(path))
    }
}

fn invalid(e: serde_json::Error) -> EngineError {
    EngineError::InvalidOutput(e.to_string())
}

fn dataset_record(c: &Candle) -> Value {
    let date = DateTime::from_timestamp_millis(c.timestamp)
        .map(|d| d.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default();
    json!({
        "date": date,
        "open": c.open,
        "high": c.high,
        "low": c.low,
        "close": c.close,
        "volume": c.volume,
    })
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[async_trait]
impl ExecutionEngine for ProcessEngine {
    async fn run(&self, req: EngineRequest<'_>) -> Result<EngineOutput, EngineError> {
        let ws = Workspace::prepare(req.workdir).await?;

        let file_name = req
            .strategy
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "strategy".into());
        let strategy_path = ws.strategies.join(file_name);
        tokio::fs::copy(&req.strategy.path, &strategy_path).await?;

        let dataset_path = self.write_dataset(&ws, &req).await?;

        let request_path = ws.root.join("request.json");
        let request = json!({
            "strategyPath": strategy_path,
            "datasetPath": dataset_path,
            "resultsDir": ws.results,
            "spec": req.spec,
            "params": req.params,
            "phase": req.phase.map(|p| p.as_str()),
            "manifest": req.strategy.manifest,
        });
        tokio::fs::write(
            &request_path,
            serde_json::to_vec_pretty(&request).map_err(invalid)?,
        )
        .await?;

        info!(
            "engine: {} {} ({})",
            self.program,
            request_path.display(),
            req.phase.map_or("full", |p| p.as_str())
        );
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&request_path)
            .env("ENGINE_REQUEST", &request_path)
            .env("ENGINE_RESULTS_DIR", &ws.results)
            .current_dir(&ws.root)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::Spawn(format!("{}: {}", self.program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let logs_path = ws.root.join("logs.txt");
        tokio::fs::write(&logs_path, format!("{}\n--- stderr ---\n{}", stdout, stderr)).await?;

        if !output.status.success() {
            return Err(EngineError::Exit {
                code: output.status.code(),
                tail: tail(&stderr, STDERR_TAIL_LINES),
            });
        }

        let result_path = ws.results.join("result.json");
        let raw = tokio::fs::read(&result_path).await.map_err(|e| {
            EngineError::InvalidOutput(format!("{}: {}", result_path.display(), e))
        })?;
        let result: ResultFile = serde_json::from_slice(&raw).map_err(invalid)?;

        let mut artifacts: Vec<ArtifactDescriptor> = result
            .artifacts
            .into_iter()
            .map(|mut a| {
                if a.path.is_relative() {
                    a.path = ws.results.join(&a.path);
                }
                a
            })
            .collect();
        artifacts.push(ArtifactDescriptor::new(logs_path, "logs.txt", "text/plain"));

        Ok(EngineOutput {
            kpis: result.kpis.unwrap_or_default(),
            artifacts,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::types::{Phase, StrategyArtifact};
    use crate::research::model::{MarketSpec, ParamSet};
    use serde_json::json;

    fn shell(script: &str) -> ProcessEngine {
        ProcessEngine::new("sh").with_args(vec!["-c".into(), script.into(), "engine".into()])
    }

    fn strategy(dir: &Path) -> StrategyArtifact {
        let path = dir.join("main.py");
        std::fs::write(&path, "class Strat: pass\n").unwrap();
        StrategyArtifact {
            path,
            manifest: json!({"className": "Strat"}),
        }
    }

    #[tokio::test]
    async fn collects_kpis_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(dir.path());
        let spec = MarketSpec::default();
        let params: ParamSet = json!({"fast": 3}).as_object().cloned().unwrap();
        let engine = shell(
            r#"cat "$1"
printf 't,equity\n0,1\n' > "$ENGINE_RESULTS_DIR/equity.csv"
printf '{"kpis":{"sharpe":1.2},"artifacts":[{"path":"equity.csv","name":"equity.csv","contentType":"text/csv"}]}' > "$ENGINE_RESULTS_DIR/result.json""#,
        );

        let out = engine
            .run(EngineRequest {
                strategy: &strategy,
                spec: &spec,
                params: &params,
                phase: Some(Phase::WalkForwardTest),
                workdir: &dir.path().join("job"),
            })
            .await
            .unwrap();

        assert_eq!(out.kpis.get("sharpe"), Some(&json!(1.2)));
        assert_eq!(out.artifacts.len(), 2);
        assert!(out.artifacts[0].path.ends_with("engine/results/equity.csv"));
        assert_eq!(out.artifacts[1].name, "logs.txt");

        let logs = std::fs::read_to_string(&out.artifacts[1].path).unwrap();
        assert!(logs.contains("\"phase\": \"walkforward_test\""));
        assert!(logs.contains("\"fast\": 3"));
        assert!(dir.path().join("job/engine/strategies/main.py").exists());
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_engine_error() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(dir.path());
        let engine = shell("echo boom >&2; exit 3");

        let err = engine
            .run(EngineRequest {
                strategy: &strategy,
                spec: &MarketSpec::default(),
                params: &ParamSet::new(),
                phase: None,
                workdir: dir.path(),
            })
            .await
            .unwrap_err();
        match err {
            EngineError::Exit { code, tail } => {
                assert_eq!(code, Some(3));
                assert_eq!(tail, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_result_file_is_invalid_output() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(dir.path());

        let err = shell("true")
            .run(EngineRequest {
                strategy: &strategy,
                spec: &MarketSpec::default(),
                params: &ParamSet::new(),
                phase: None,
                workdir: dir.path(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOutput(_)));
    }

    #[tokio::test]
    async fn empty_kpis_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(dir.path());

        let out = shell(r#"echo '{}' > "$ENGINE_RESULTS_DIR/result.json""#)
            .run(EngineRequest {
                strategy: &strategy,
                spec: &MarketSpec::default(),
                params: &ParamSet::new(),
                phase: None,
                workdir: dir.path(),
            })
            .await
            .unwrap();
        assert!(out.kpis.is_empty());
        assert_eq!(out.artifacts.len(), 1);
    }
}
