//! Shared test infrastructure.
//!
//! Provides [`TestRedis`], a throwaway Redis container for
//! integration tests of the stream source and transport. Tests using
//! it are marked `#[ignore]` since they need a working Docker daemon:
//!
//! ```text
//! cargo test -- --ignored
//! ```

mod redis;

pub use redis::TestRedis;
