use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "RunKind")]
pub enum RunKind {
    #[sea_orm(string_value = "BACKTEST")]
    Backtest,
    #[sea_orm(string_value = "GRID")]
    Grid,
    #[sea_orm(string_value = "WALKFORWARD")]
    Walkforward,
}

/// QUEUED -> RUNNING -> SUCCEEDED | FAILED
///
/// Native enum types on Postgres, so writes are cast to `"RunStatus"` / `"RunKind"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "RunStatus")]
pub enum RunStatus {
    #[sea_orm(string_value = "QUEUED")]
    Queued,
    #[sea_orm(string_value = "RUNNING")]
    Running,
    #[sea_orm(string_value = "SUCCEEDED")]
    Succeeded,
    #[sea_orm(string_value = "FAILED")]
    Failed,
}

// Table and column names are shared with the web API, hence the camelCase.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "Run")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(column_name = "strategyId")]
    pub strategy_id: String,
    #[sea_orm(column_name = "ownerId", nullable)]
    pub owner_id: Option<String>,
    pub kind: RunKind,
    pub status: RunStatus,
    #[sea_orm(column_name = "artifactPrefix")]
    pub artifact_prefix: String,
    pub spec: Json,
    pub params: Json,
    #[sea_orm(nullable)]
    pub kpis: Option<Json>,
    #[sea_orm(column_name = "startedAt", nullable)]
    pub started_at: Option<DateTime>,
    #[sea_orm(column_name = "finishedAt", nullable)]
    pub finished_at: Option<DateTime>,
    #[sea_orm(column_name = "createdAt")]
    pub created_at: DateTime,
    #[sea_orm(column_name = "updatedAt")]
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
