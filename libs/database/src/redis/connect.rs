use redis::Client;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::error::DatabaseError;
use crate::retry::{RetryConfig, retry_with_backoff};

/// An open Redis connection pair.
///
/// The [`ConnectionManager`] serves normal commands and reconnects by
/// itself; the [`Client`] stays around because pub/sub subscriptions
/// need their own dedicated connections.
#[derive(Clone)]
pub struct RedisConnection {
    pub client: Client,
    pub manager: ConnectionManager,
}

impl RedisConnection {
    /// Cloned manager for handing to components.
    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

/// Connect to Redis and verify the connection with a PING.
pub async fn connect(url: &str) -> redis::RedisResult<RedisConnection> {
    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client.clone()).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("Connected to Redis");
    Ok(RedisConnection { client, manager })
}

/// Connect with exponential-backoff retry, for startup resilience
/// against a Redis that is still coming up.
pub async fn connect_with_retry(
    url: &str,
    retry_config: Option<RetryConfig>,
) -> redis::RedisResult<RedisConnection> {
    let url = url.to_string();
    retry_with_backoff(|| connect(&url), retry_config.unwrap_or_default()).await
}

/// PING-based health check for readiness probes.
pub async fn check_health(conn: &mut ConnectionManager) -> Result<(), DatabaseError> {
    let response: String = redis::cmd("PING")
        .query_async(conn)
        .await
        .map_err(|e| DatabaseError::HealthCheckFailed(format!("Redis PING failed: {e}")))?;

    if response != "PONG" {
        return Err(DatabaseError::HealthCheckFailed(format!(
            "Redis PING returned unexpected response: {response}"
        )));
    }
    Ok(())
}
