use crate::artifact::{join_key, ArtifactStore};
use crate::engine::{ArtifactDescriptor, EngineRequest, ExecutionEngine, StrategyArtifact};
use crate::queue::QueueMessage;
use crate::research::model::{Job, JobEnvelope, JobError, JobPlan, Kpis, ParamSet};
use crate::storage::RunStore;
use chrono::{SecondsFormat, Utc};
use log::{error, info, warn};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// What the consumer loop does with a message once the worker is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acknowledge,
    /// Leave leased; the queue redelivers it after the visibility timeout.
    Release,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub workdir_root: PathBuf,
    pub lease: Duration,
    pub child_estimate: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub kpis: Kpis,
    pub artifact_prefix: String,
}

pub struct ResearchWorker {
    pub(super) artifacts: ArtifactStore,
    pub(super) runs: RunStore,
    pub(super) engine: Arc<dyn ExecutionEngine>,
    pub(super) options: WorkerOptions,
}

pub(super) fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn sanitize_dir_name(run_id: &str) -> String {
    run_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// `strategies/s1/v3/main.py` -> `strategies/s1/v3/manifest.json`
fn manifest_key_for(strategy_key: &str) -> Option<String> {
    let (dir, _) = strategy_key.rsplit_once('/')?;
    Some(format!("{}/manifest.json", dir))
}

impl ResearchWorker {
    pub fn new(
        artifacts: ArtifactStore,
        runs: RunStore,
        engine: Arc<dyn ExecutionEngine>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            artifacts,
            runs,
            engine,
            options,
        }
    }

    #[cfg(test)]
    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    pub fn lease(&self) -> Duration {
        self.options.lease
    }

    /// Processes one delivery end to end and decides its fate.
    /// Never returns an error: every failure is logged and folded into the disposition.
    pub async fn handle(&self, msg: &QueueMessage) -> Disposition {
        // 1. Envelope: without a run id there is nothing to record
        let envelope = match JobEnvelope::parse(&msg.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("✗ poison message {} dropped: {}", msg.message_id, e);
                return Disposition::Acknowledge;
            }
        };
        let run_id = envelope.run_id.clone();

        // 2. Full job; the run id is known, so a row the API pre-created is closed out
        let job = match envelope.into_job() {
            Ok(job) => job,
            Err(e) => {
                error!("✗ [{}] {}; marking failed and dropping", run_id, e);
                self.runs.mark_failed(&run_id).await;
                return Disposition::Acknowledge;
            }
        };

        info!(
            "🚀 [{}] {} job for strategy {} (delivery #{})",
            job.run_id,
            job.kind(),
            job.strategy_id,
            msg.receive_count
        );
        // 3. QUEUED row if absent, then RUNNING
        self.runs.ensure(&job).await;
        self.runs.mark_running(&job.run_id).await;

        // 4. Execute in a private workdir, removed whatever the outcome
        let workdir = self
            .options
            .workdir_root
            .join(sanitize_dir_name(&job.run_id));
        let result = self.process(&job, &workdir).await;
        remove_workdir(&workdir).await;

        // 5. Terminal status and disposition
        match result {
            Ok(outcome) => {
                self.runs
                    .mark_succeeded(&job.run_id, Some(&outcome.kpis), Some(&outcome.artifact_prefix))
                    .await;
                info!("✓ [{}] succeeded -> {}", job.run_id, self.artifacts.location(&outcome.artifact_prefix));
                Disposition::Acknowledge
            }
            Err(e) => {
                self.runs.mark_failed(&job.run_id).await;
                if e.is_permanent() {
                    error!("✗ [{}] rejected: {}", job.run_id, e);
                    Disposition::Acknowledge
                } else {
                    error!("✗ [{}] failed, leaving for redelivery: {}", job.run_id, e);
                    Disposition::Release
                }
            }
        }
    }

    /// Runs the job's plan. Nothing is acknowledged or recorded here.
    pub async fn process(&self, job: &Job, workdir: &Path) -> Result<JobOutcome, JobError> {
        tokio::fs::create_dir_all(workdir)
            .await
            .map_err(|e| JobError::Infra(format!("workdir {}: {}", workdir.display(), e)))?;

        match &job.plan {
            JobPlan::Backtest { params } => self.run_backtest(job, params, workdir).await,
            JobPlan::Grid { grid } => self.run_grid(job, grid, workdir).await,
            JobPlan::WalkForward { walkforward } => {
                self.run_walkforward(job, walkforward.as_ref(), workdir).await
            }
        }
    }

    async fn run_backtest(
        &self,
        job: &Job,
        params: &ParamSet,
        workdir: &Path,
    ) -> Result<JobOutcome, JobError> {
        let strategy = self.fetch_strategy(job, workdir).await?;

        let started_at = now_iso();
        let output = self
            .engine
            .run(EngineRequest {
                strategy: &strategy,
                spec: &job.spec,
                params,
                phase: None,
                workdir,
            })
            .await?;
        let finished_at = now_iso();

        let metrics = json!({
            "runId": job.run_id,
            "strategyId": job.strategy_id,
            "kind": "backtest",
            "startedAt": started_at,
            "finishedAt": finished_at,
            "params": params,
            "kpis": output.kpis,
            "spec": job.spec,
        });
        self.artifacts
            .put_json(&join_key(&job.artifact_prefix, "metrics.json"), &metrics)
            .await?;
        self.upload_engine_artifacts(&job.artifact_prefix, &output.artifacts)
            .await?;

        Ok(JobOutcome {
            kpis: output.kpis,
            artifact_prefix: job.artifact_prefix.clone(),
        })
    }

    /// Downloads the strategy source and its sibling `manifest.json`, once per job.
    pub(super) async fn fetch_strategy(
        &self,
        job: &Job,
        workdir: &Path,
    ) -> Result<StrategyArtifact, JobError> {
        let file_name = job
            .manifest_key
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or("strategy_payload");
        let path = workdir.join("strategy").join(file_name);
        self.artifacts.download_to(&job.manifest_key, &path).await?;
        info!("[{}] strategy {} -> {}", job.run_id, job.manifest_key, path.display());

        let manifest = match manifest_key_for(&job.manifest_key) {
            Some(key) => self.load_manifest(&job.run_id, &key).await?,
            None => Value::Object(Map::new()),
        };

        Ok(StrategyArtifact {
            path,
            manifest,
        })
    }

    async fn load_manifest(&self, run_id: &str, key: &str) -> Result<Value, JobError> {
        let Some(raw) = self.artifacts.get_opt(key).await? else {
            return Ok(Value::Object(Map::new()));
        };
        match serde_json::from_slice::<Value>(&raw) {
            Ok(manifest @ Value::Object(_)) => Ok(manifest),
            Ok(_) => {
                warn!("⚠ [{}] manifest {} is not an object, ignoring", run_id, key);
                Ok(Value::Object(Map::new()))
            }
            Err(e) => {
                warn!("⚠ [{}] failed to parse manifest {}: {}", run_id, key, e);
                Ok(Value::Object(Map::new()))
            }
        }
    }

    pub(super) async fn upload_engine_artifacts(
        &self,
        prefix: &str,
        artifacts: &[ArtifactDescriptor],
    ) -> Result<(), JobError> {
        for artifact in artifacts {
            let exists = tokio::fs::try_exists(&artifact.path).await.map_err(|e| {
                JobError::Infra(format!("artifact {}: {}", artifact.path.display(), e))
            })?;
            if !exists {
                warn!(
                    "⚠ engine artifact {} missing at {}, skipped",
                    artifact.name,
                    artifact.path.display()
                );
                continue;
            }
            self.artifacts
                .upload_file(
                    &artifact.path,
                    &join_key(prefix, &artifact.name),
                    artifact.content_type(),
                )
                .await?;
        }
        Ok(())
    }

    /// Warns when a fan-out is unlikely to finish inside one lease.
    pub(super) fn check_lease_budget(&self, run_id: &str, children: usize) {
        let estimate = self
            .options
            .child_estimate
            .saturating_mul(children.min(u32::MAX as usize) as u32);
        if estimate > self.options.lease {
            warn!(
                "⚠ [{}] {} children at ~{}s each may outlast the {}s lease; expect a duplicate delivery",
                run_id,
                children,
                self.options.child_estimate.as_secs(),
                self.options.lease.as_secs()
            );
        }
    }
}

async fn remove_workdir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("⚠ could not remove workdir {}: {}", dir.display(), e),
    }
}
