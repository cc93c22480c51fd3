//! Redis connector and configuration.

mod config;
mod connect;

pub use config::RedisConfig;
pub use connect::{RedisConnection, check_health, connect, connect_with_retry};

// Re-export redis types for convenience
pub use redis::aio::ConnectionManager;
pub use redis::{AsyncCommands, Client, RedisResult};
