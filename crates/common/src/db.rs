use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::AppConfig;

/// Open the Postgres pool for the notification store and bring the schema up
/// to date.
///
/// Workers never hold a connection between store calls; each call checks one
/// out of the pool and returns it immediately, so `DB_MAX_CONNECTIONS` bounds
/// concurrent store work across every app.
pub async fn connect_store_pool(config: &AppConfig) -> anyhow::Result<PgPool> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required for the postgres store"))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(config.http.connect_timeout)
        .connect(url)
        .await?;
    tracing::info!(max_connections = config.db_max_connections, "Connected to PostgreSQL");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");
    Ok(pool)
}
