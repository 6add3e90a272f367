use crate::research::model::{Job, Kpis};
use crate::storage::establish_connection;
use crate::storage::repository::{NewRun, RunRepository};
use log::{info, warn};
use sea_orm::{DatabaseConnection, DbErr};
use serde_json::Value;
use std::sync::Arc;

/// Best-effort run ledger. Every call is a no-op without a database, and
/// database errors are logged, never returned: run tracking must not decide
/// whether a job succeeds.
#[derive(Clone, Default)]
pub struct RunStore {
    db: Option<Arc<DatabaseConnection>>,
}

impl RunStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db: Some(db) }
    }

    pub fn disabled() -> Self {
        Self { db: None }
    }

    /// Connects when a URL is given. A failed connection degrades to a disabled store.
    pub async fn connect(db_url: Option<&str>) -> Self {
        let Some(url) = db_url.filter(|u| !u.trim().is_empty()) else {
            warn!("⚠ DATABASE_URL not set; run status tracking is disabled");
            return Self::disabled();
        };
        match establish_connection(url).await {
            Ok(db) => Self::new(Arc::new(db)),
            Err(e) => {
                warn!("⚠ Run store unavailable ({}); run status tracking is disabled", e);
                Self::disabled()
            }
        }
    }

    #[cfg(test)]
    pub fn enabled(&self) -> bool {
        self.db.is_some()
    }

    pub fn connection(&self) -> Option<&DatabaseConnection> {
        self.db.as_deref()
    }

    /// Inserts the QUEUED row if absent. Returns whether a row was created.
    pub async fn ensure(&self, job: &Job) -> bool {
        let Some(db) = self.connection() else {
            return false;
        };
        let new_run = NewRun {
            id: job.run_id.clone(),
            strategy_id: job.strategy_id.clone(),
            owner_id: job.owner_id.clone(),
            kind: job.kind().into(),
            artifact_prefix: job.artifact_prefix.clone(),
            spec: serde_json::to_value(&job.spec).unwrap_or(Value::Null),
            params: Value::Object(job.params.clone()),
        };
        match RunRepository::ensure(db, new_run).await {
            Ok(created) => {
                if !created {
                    info!("[{}] run row already present (redelivery or API-created)", job.run_id);
                }
                created
            }
            Err(e) => {
                log_failure(&job.run_id, "ensure", e);
                false
            }
        }
    }

    pub async fn mark_running(&self, run_id: &str) {
        if let Some(db) = self.connection() {
            if let Err(e) = RunRepository::mark_running(db, run_id).await {
                log_failure(run_id, "mark_running", e);
            }
        }
    }

    pub async fn mark_succeeded(&self, run_id: &str, kpis: Option<&Kpis>, artifact_prefix: Option<&str>) {
        if let Some(db) = self.connection() {
            let kpis = kpis.map(|k| Value::Object(k.clone()));
            let prefix = artifact_prefix.map(str::to_string);
            if let Err(e) = RunRepository::mark_succeeded(db, run_id, kpis, prefix).await {
                log_failure(run_id, "mark_succeeded", e);
            }
        }
    }

    pub async fn mark_failed(&self, run_id: &str) {
        if let Some(db) = self.connection() {
            if let Err(e) = RunRepository::mark_failed(db, run_id).await {
                log_failure(run_id, "mark_failed", e);
            }
        }
    }
}

fn log_failure(run_id: &str, op: &str, err: DbErr) {
    warn!("⚠ [{}] run store {} failed: {}", run_id, op, err);
}
