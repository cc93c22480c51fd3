//! Redis test infrastructure.
//!
//! `TestRedis` starts a Redis container and tears it down on drop.

use redis::Client;
use redis::aio::MultiplexedConnection;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestRedis;
/// use redis::AsyncCommands;
///
/// # async fn example() {
/// let redis = TestRedis::new().await;
/// let mut conn = redis.connection();
/// conn.set::<_, _, ()>("key", "value").await.unwrap();
/// # }
/// ```
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    pub connection_string: String,
}

impl TestRedis {
    /// Start a fresh Redis container (8-alpine) and connect.
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");
        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client =
            Client::open(connection_string.clone()).expect("Failed to create Redis client");
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready");

        Self {
            container,
            connection,
            connection_string,
        }
    }

    /// Cloned connection for passing to components under test.
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::AsyncCommands;

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_redis_set_get() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        conn.set::<_, _, ()>("test_key", "test_value")
            .await
            .unwrap();
        let value: String = conn.get("test_key").await.unwrap();
        assert_eq!(value, "test_value");
    }
}
