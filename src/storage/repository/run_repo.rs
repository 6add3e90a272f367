use crate::storage::entity::run::{
    self, ActiveModel as RunActiveModel, Entity as Run, RunKind, RunStatus,
};
use chrono::{NaiveDateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict, SimpleExpr};
use sea_orm::{
    ActiveEnum, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde_json::Value;

/// Row contents written when a run is first seen.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: String,
    pub strategy_id: String,
    pub owner_id: Option<String>,
    pub kind: RunKind,
    pub artifact_prefix: String,
    pub spec: Value,
    pub params: Value,
}

impl NewRun {
    fn into_active_model(self, now: NaiveDateTime) -> RunActiveModel {
        RunActiveModel {
            id: Set(self.id),
            strategy_id: Set(self.strategy_id),
            owner_id: Set(self.owner_id),
            kind: Set(self.kind),
            status: Set(RunStatus::Queued),
            artifact_prefix: Set(self.artifact_prefix),
            spec: Set(self.spec),
            params: Set(self.params),
            kpis: Set(None),
            started_at: Set(None),
            finished_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
    }
}

/// Status literal for `update_many`; cast to the column's enum type where the backend has one.
fn status_value(status: RunStatus) -> SimpleExpr {
    run::Column::Status.save_as(Expr::val(status.to_value()))
}

pub struct RunRepository;

impl RunRepository {
    /// Inserts a QUEUED row unless one already exists for the id.
    /// Returns whether a row was created.
    pub async fn ensure(db: &DatabaseConnection, new_run: NewRun) -> Result<bool, sea_orm::DbErr> {
        let active_model = new_run.into_active_model(Utc::now().naive_utc());
        let inserted = Run::insert(active_model)
            .on_conflict(OnConflict::column(run::Column::Id).do_nothing().to_owned())
            .exec_without_returning(db)
            .await?;
        Ok(inserted > 0)
    }

    /// RUNNING; `startedAt` is only stamped the first time so redeliveries keep the original start.
    pub async fn mark_running(db: &DatabaseConnection, id: &str) -> Result<(), sea_orm::DbErr> {
        let now = Utc::now().naive_utc();
        Run::update_many()
            .col_expr(run::Column::Status, status_value(RunStatus::Running))
            .col_expr(run::Column::UpdatedAt, Expr::value(now))
            .filter(run::Column::Id.eq(id))
            .exec(db)
            .await?;

        Run::update_many()
            .col_expr(run::Column::StartedAt, Expr::value(now))
            .filter(run::Column::Id.eq(id))
            .filter(run::Column::StartedAt.is_null())
            .exec(db)
            .await?;
        Ok(())
    }

    pub async fn mark_succeeded(
        db: &DatabaseConnection,
        id: &str,
        kpis: Option<Value>,
        artifact_prefix: Option<String>,
    ) -> Result<(), sea_orm::DbErr> {
        let now = Utc::now().naive_utc();
        let mut update = Run::update_many()
            .col_expr(run::Column::Status, status_value(RunStatus::Succeeded))
            .col_expr(run::Column::FinishedAt, Expr::value(now))
            .col_expr(run::Column::UpdatedAt, Expr::value(now));
        if let Some(kpis) = kpis {
            update = update.col_expr(run::Column::Kpis, Expr::value(kpis));
        }
        if let Some(prefix) = artifact_prefix.filter(|p| !p.is_empty()) {
            update = update.col_expr(run::Column::ArtifactPrefix, Expr::value(prefix));
        }
        update.filter(run::Column::Id.eq(id)).exec(db).await?;
        Ok(())
    }

    pub async fn mark_failed(db: &DatabaseConnection, id: &str) -> Result<(), sea_orm::DbErr> {
        let now = Utc::now().naive_utc();
        Run::update_many()
            .col_expr(run::Column::Status, status_value(RunStatus::Failed))
            .col_expr(run::Column::FinishedAt, Expr::value(now))
            .col_expr(run::Column::UpdatedAt, Expr::value(now))
            .filter(run::Column::Id.eq(id))
            .exec(db)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn find(
        db: &DatabaseConnection,
        id: &str,
    ) -> Result<Option<run::Model>, sea_orm::DbErr> {
        Run::find_by_id(id.to_string()).one(db).await
    }
}
