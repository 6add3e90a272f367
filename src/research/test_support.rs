use crate::artifact::ArtifactStore;
use crate::engine::{
    ArtifactDescriptor, EngineError, EngineOutput, EngineRequest, ExecutionEngine, Phase,
};
use crate::research::model::{Job, JobEnvelope, Kpis, MarketSpec, ParamSet};
use crate::research::worker::{ResearchWorker, WorkerOptions};
use crate::storage::entity::run;
use crate::storage::repository::RunRepository;
use crate::storage::RunStore;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Behaviour = Box<dyn Fn(&ParamSet, usize) -> Result<Kpis, EngineError> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub params: ParamSet,
    pub phase: Option<Phase>,
    pub manifest: Value,
    pub spec: MarketSpec,
    pub workdir: PathBuf,
}

/// Engine double: records every call, writes one real artifact and lists one missing one.
pub struct StubEngine {
    behaviour: Behaviour,
    delay: Option<Duration>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl StubEngine {
    pub fn new(
        behaviour: impl Fn(&ParamSet, usize) -> Result<Kpis, EngineError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            behaviour: Box::new(behaviour),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Each invocation sleeps this long (tokio time) before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn ok(kpis: Value) -> Self {
        let kpis = kpis.as_object().cloned().unwrap_or_default();
        Self::new(move |_, _| Ok(kpis.clone()))
    }

    pub fn failing() -> Self {
        Self::new(|_, _| {
            Err(EngineError::Exit {
                code: Some(1),
                tail: "strategy raised".into(),
            })
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionEngine for StubEngine {
    async fn run(&self, req: EngineRequest<'_>) -> Result<EngineOutput, EngineError> {
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(RecordedCall {
                params: req.params.clone(),
                phase: req.phase,
                manifest: req.strategy.manifest.clone(),
                spec: req.spec.clone(),
                workdir: req.workdir.to_path_buf(),
            });
            calls.len() - 1
        };
        assert!(req.strategy.path.exists(), "strategy not downloaded");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let kpis = (self.behaviour)(req.params, call_index)?;
        let equity = req.workdir.join("equity.csv");
        tokio::fs::write(&equity, "t,equity\n0,1000\n").await?;

        Ok(EngineOutput {
            kpis,
            artifacts: vec![
                ArtifactDescriptor::new(equity, "equity.csv", "text/csv"),
                ArtifactDescriptor::new(req.workdir.join("nope.csv"), "missing.csv", "text/csv"),
            ],
        })
    }
}

pub struct Fixture {
    pub worker: ResearchWorker,
    pub artifacts: ArtifactStore,
    pub engine: Arc<StubEngine>,
    pub workdir: tempfile::TempDir,
}

/// Worker over an in-memory artifact store and a SQLite run store.
pub async fn fixture(engine: StubEngine) -> Fixture {
    let runs = RunStore::connect(Some("sqlite::memory:")).await;
    assert!(runs.enabled());
    build(engine, runs).await
}

/// Same, without run tracking. Safe under paused time: nothing waits on a driver thread.
pub async fn fixture_without_runs(engine: StubEngine) -> Fixture {
    build(engine, RunStore::disabled()).await
}

async fn build(engine: StubEngine, runs: RunStore) -> Fixture {
    let artifacts = ArtifactStore::in_memory();
    artifacts
        .put_bytes("strategies/s1/main.py", b"class Momentum: pass\n".to_vec(), "text/x-python")
        .await
        .unwrap();

    let engine = Arc::new(engine);
    let workdir = tempfile::tempdir().unwrap();
    let worker = ResearchWorker::new(
        artifacts.clone(),
        runs,
        engine.clone(),
        WorkerOptions {
            workdir_root: workdir.path().to_path_buf(),
            lease: Duration::from_secs(900),
            child_estimate: Duration::from_secs(60),
        },
    );

    Fixture {
        worker,
        artifacts,
        engine,
        workdir,
    }
}

impl Fixture {
    pub async fn json(&self, key: &str) -> Value {
        let raw = self.artifacts.get(key).await.unwrap();
        serde_json::from_slice(&raw).unwrap()
    }

    pub async fn row(&self, id: &str) -> run::Model {
        let db = self.worker.runs().connection().unwrap();
        RunRepository::find(db, id).await.unwrap().unwrap()
    }

    pub fn job_json(&self, body: Value) -> Job {
        JobEnvelope::parse(&body.to_string())
            .unwrap()
            .into_job()
            .unwrap()
    }
}
