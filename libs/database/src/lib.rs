//! Redis connectivity for the node agent.
//!
//! Provides configuration loading, connection establishment with
//! retry, and health checks around `redis::aio::ConnectionManager`
//! (which reconnects transparently after transient failures).
//!
//! # Example
//!
//! ```ignore
//! use core_config::FromEnv;
//! use database::redis::{RedisConfig, connect_with_retry};
//!
//! let config = RedisConfig::from_env()?;
//! let conn = connect_with_retry(&config.connection_url(), None).await?;
//! ```

pub mod error;
pub mod redis;
pub mod retry;

pub use error::{DatabaseError, DatabaseResult};
pub use retry::{RetryConfig, retry_with_backoff};
