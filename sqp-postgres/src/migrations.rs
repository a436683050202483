use sqlx::Executor;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqp_config::shared::{IntoConnectOptions, PgConnectionConfig};
use tracing::info;

/// Schema holding every table of the store and the migration metadata.
pub const SQP_SCHEMA: &str = "sqp";

/// Applies pending migrations to the `sqp` schema of the store database.
///
/// The schema is created first and set as `search_path`, so that the `_sqlx_migrations`
/// table lands next to the store tables instead of in `public`.
pub async fn apply_store_migrations(
    connection_config: &PgConnectionConfig,
) -> Result<(), sqlx::Error> {
    let options: PgConnectOptions = connection_config.with_db();

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("create schema if not exists sqp;").await?;
                conn.execute("set search_path = 'sqp';").await?;

                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    info!(schema = SQP_SCHEMA, "applying store migrations");

    let migrator = sqlx::migrate!("./migrations");
    migrator.run(&pool).await?;

    info!("store migrations successfully applied");

    pool.close().await;

    Ok(())
}
