use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};

use crate::config::AppConfig;

/// Connect the Redis-backed store.
///
/// The manager reconnects on its own and is cheap to clone, so each store
/// call works on its own clone. A PING on startup turns a wrong URL into a
/// startup failure instead of a first-poll failure.
pub async fn connect_store_redis(config: &AppConfig) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(config.redis_url.as_str())?;
    let manager_config = ConnectionManagerConfig::new()
        .set_connection_timeout(config.http.connect_timeout)
        .set_response_timeout(config.http.read_timeout);
    let mut manager = ConnectionManager::new_with_config(client, manager_config).await?;

    let _: String = redis::cmd("PING").query_async(&mut manager).await?;
    tracing::info!(url = %config.redis_url, "Connected to Redis");
    Ok(manager)
}
