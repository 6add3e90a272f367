use crate::storage::entity::run;
use log::info;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema};
use std::time::Duration;

pub async fn establish_connection(db_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(db_url.to_owned());
    opt.sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    // One connection for SQLite so `sqlite::memory:` stays a single database.
    if db_url.starts_with("sqlite:") {
        opt.max_connections(1).min_connections(1);
    } else {
        opt.max_connections(4)
            .min_connections(1)
            .connect_timeout(Duration::from_secs(8))
            .acquire_timeout(Duration::from_secs(8))
            .idle_timeout(Duration::from_secs(300));
    }

    let db = Database::connect(opt).await?;

    // On Postgres the `Run` table and its enum types belong to the web app's migrations.
    let backend = db.get_database_backend();
    if backend == sea_orm::DatabaseBackend::Sqlite {
        db.execute(sea_orm::Statement::from_string(
            backend,
            "PRAGMA journal_mode=WAL;".to_string(),
        ))
        .await?;
        create_schema(&db).await?;
    }

    info!("Run store connection established ({:?}).", backend);

    Ok(db)
}

/// Creates the `Run` table when it does not exist yet.
pub async fn create_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    let stmt = builder.build(
        schema
            .create_table_from_entity(run::Entity)
            .if_not_exists(),
    );
    db.execute(stmt).await?;

    Ok(())
}
