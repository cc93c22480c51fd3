/// Unified error type for connection-layer operations.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Connection failed after retries
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Health check failed
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for connection-layer operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;
