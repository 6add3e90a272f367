use crate::artifact::join_key;
use crate::engine::{EngineRequest, Phase, StrategyArtifact};
use crate::research::kpi::aggregate_kpis;
use crate::research::model::{Job, JobError, Kpis, ParamSet, WalkForwardSpec};
use crate::research::window::{windows, Window};
use crate::research::worker::{now_iso, JobOutcome, ResearchWorker};
use log::info;
use serde_json::{json, Value};
use std::path::Path;

/// One fanned-out engine invocation. Lives only for the parent's processing.
#[derive(Debug, Clone)]
pub struct ChildRun {
    pub run_id: String,
    pub index: usize,
    pub artifact_prefix: String,
    pub params: ParamSet,
    pub window: Option<Window>,
    pub kpis: Kpis,
}

#[derive(Clone, Copy)]
enum FanOut {
    Grid,
    WalkForward,
}

impl FanOut {
    fn child_id(self, parent: &str, index: usize) -> String {
        match self {
            FanOut::Grid => format!("{}_{:03}", parent, index),
            FanOut::WalkForward => format!("{}_wf_{:03}", parent, index),
        }
    }

    fn segment(self) -> &'static str {
        match self {
            FanOut::Grid => "grid",
            FanOut::WalkForward => "wf",
        }
    }

    fn child_kind(self) -> &'static str {
        match self {
            FanOut::Grid => "grid:member",
            FanOut::WalkForward => "walkforward:window",
        }
    }
}

impl ResearchWorker {
    pub(super) async fn run_grid(
        &self,
        job: &Job,
        grid: &[ParamSet],
        workdir: &Path,
    ) -> Result<JobOutcome, JobError> {
        if grid.is_empty() {
            return Err(JobError::Invalid("grid is empty".into()));
        }
        self.check_lease_budget(&job.run_id, grid.len());
        let strategy = self.fetch_strategy(job, workdir).await?;

        // 1. Members in order; the first failure fails the parent
        let started_at = now_iso();
        let mut children = Vec::with_capacity(grid.len());
        for (index, params) in grid.iter().enumerate() {
            let child = self
                .run_child(job, &strategy, FanOut::Grid, index, params.clone(), None, workdir)
                .await?;
            children.push(child);
        }
        let finished_at = now_iso();

        // 2. grid/index.json
        let entries: Vec<Value> = children
            .iter()
            .map(|c| {
                json!({
                    "runId": c.run_id,
                    "index": c.index,
                    "artifactPrefix": c.artifact_prefix,
                    "params": c.params,
                    "kpis": c.kpis,
                })
            })
            .collect();
        let index_doc = json!({
            "runId": job.run_id,
            "kind": "grid",
            "spec": job.spec,
            "children": entries,
            "startedAt": started_at,
            "finishedAt": finished_at,
        });
        self.artifacts
            .put_json(&join_key(&job.artifact_prefix, "grid/index.json"), &index_doc)
            .await?;

        // 3. Parent metrics with aggregated KPIs
        let kpis = aggregate_kpis(children.iter().map(|c| &c.kpis));
        let parent = json!({
            "runId": job.run_id,
            "strategyId": job.strategy_id,
            "kind": "grid",
            "startedAt": started_at,
            "finishedAt": finished_at,
            "members": children.iter().map(|c| c.run_id.as_str()).collect::<Vec<_>>(),
            "spec": job.spec,
            "kpis": kpis,
        });
        self.artifacts
            .put_json(&join_key(&job.artifact_prefix, "metrics.json"), &parent)
            .await?;

        info!("[{}] grid finished: {} members", job.run_id, children.len());
        Ok(JobOutcome {
            kpis,
            artifact_prefix: job.artifact_prefix.clone(),
        })
    }

    pub(super) async fn run_walkforward(
        &self,
        job: &Job,
        raw: Option<&Value>,
        workdir: &Path,
    ) -> Result<JobOutcome, JobError> {
        let raw = raw.ok_or_else(|| JobError::Invalid("walkforward spec is required".into()))?;
        let wf = WalkForwardSpec::from_value(raw)?;
        let start = job
            .spec
            .start_date()
            .ok_or_else(|| JobError::Invalid("walkforward requires a valid spec.start".into()))?;
        let end = job
            .spec
            .end_date()
            .ok_or_else(|| JobError::Invalid("walkforward requires a valid spec.end".into()))?;

        // 1. Windows are planned up front so the lease budget can be checked
        let planned = windows(start, end, &wf);
        self.check_lease_budget(&job.run_id, planned.clone().count());
        let strategy = self.fetch_strategy(job, workdir).await?;

        // 2. One test-phase run per window
        let started_at = now_iso();
        let mut children = Vec::new();
        for (index, window) in planned.enumerate() {
            let mut params = ParamSet::new();
            params.insert("wfWindow".into(), json!(window));
            let child = self
                .run_child(job, &strategy, FanOut::WalkForward, index, params, Some(window), workdir)
                .await?;
            children.push(child);
        }
        let finished_at = now_iso();

        let entries: Vec<Value> = children
            .iter()
            .map(|c| {
                json!({
                    "runId": c.run_id,
                    "index": c.index,
                    "artifactPrefix": c.artifact_prefix,
                    "window": c.window,
                    "kpis": c.kpis,
                })
            })
            .collect();
        // 3. wf/index.json, then the parent metrics
        let index_doc = json!({
            "runId": job.run_id,
            "kind": "walkforward",
            "spec": job.spec,
            "wf": wf,
            "windows": entries,
            "startedAt": started_at,
            "finishedAt": finished_at,
        });
        self.artifacts
            .put_json(&join_key(&job.artifact_prefix, "wf/index.json"), &index_doc)
            .await?;

        let kpis = aggregate_kpis(children.iter().map(|c| &c.kpis));
        let parent = json!({
            "runId": job.run_id,
            "strategyId": job.strategy_id,
            "kind": "walkforward",
            "startedAt": started_at,
            "finishedAt": finished_at,
            "windows": children.iter().map(|c| c.run_id.as_str()).collect::<Vec<_>>(),
            "spec": job.spec,
            "wf": wf,
            "kpis": kpis,
        });
        self.artifacts
            .put_json(&join_key(&job.artifact_prefix, "metrics.json"), &parent)
            .await?;

        info!("[{}] walk-forward finished: {} windows", job.run_id, children.len());
        Ok(JobOutcome {
            kpis,
            artifact_prefix: job.artifact_prefix.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_child(
        &self,
        job: &Job,
        strategy: &StrategyArtifact,
        fan_out: FanOut,
        index: usize,
        params: ParamSet,
        window: Option<Window>,
        workdir: &Path,
    ) -> Result<ChildRun, JobError> {
        let run_id = fan_out.child_id(&job.run_id, index);
        let prefix = join_key(
            &job.artifact_prefix,
            &format!("{}/{:03}", fan_out.segment(), index),
        );
        let child_dir = workdir.join(format!("{}_{:03}", fan_out.segment(), index));
        tokio::fs::create_dir_all(&child_dir)
            .await
            .map_err(|e| JobError::Infra(format!("workdir {}: {}", child_dir.display(), e)))?;

        let phase = window.map(|_| Phase::WalkForwardTest);
        info!("[{}] child {} starting", job.run_id, run_id);
        let started_at = now_iso();
        let output = self
            .engine
            .run(EngineRequest {
                strategy,
                spec: &job.spec,
                params: &params,
                phase,
                workdir: &child_dir,
            })
            .await?;
        let finished_at = now_iso();

        let mut metrics = json!({
            "runId": run_id,
            "parentRunId": job.run_id,
            "strategyId": job.strategy_id,
            "kind": fan_out.child_kind(),
            "index": index,
            "startedAt": started_at,
            "finishedAt": finished_at,
            "params": params,
            "kpis": output.kpis,
            "spec": job.spec,
        });
        if let (Some(w), Some(obj)) = (window, metrics.as_object_mut()) {
            obj.insert("window".into(), json!(w));
        }
        self.artifacts
            .put_json(&join_key(&prefix, "metrics.json"), &metrics)
            .await?;
        self.upload_engine_artifacts(&prefix, &output.artifacts).await?;

        Ok(ChildRun {
            run_id,
            index,
            artifact_prefix: format!("{}/", prefix),
            params,
            window,
            kpis: output.kpis,
        })
    }
}
