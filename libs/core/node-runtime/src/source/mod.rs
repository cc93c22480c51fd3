//! Job source and transport capabilities.
//!
//! A source hands jobs to the runner with ack/nack semantics; the
//! same backend also carries the node's side-channels (status
//! publishes, config pushes, usage stream). Two backends exist:
//! [`redis::RedisSource`] talks straight to the stream database,
//! [`bridge::BridgeSource`] goes through the HTTP + WebSocket bridge.
//! The runner only ever sees the capability traits; backend choice is
//! a one-time startup decision.

pub mod bridge;
pub mod redis;

use crate::error::SourceError;
use crate::job::{Delivery, DeliveryToken, PartialFrame};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Pull-based job acquisition with per-delivery acknowledgement.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Pull the next job, blocking up to the configured block timeout.
    /// `Ok(None)` means nothing was ready. Only the runner's driver
    /// task calls this; concurrent fetches are not supported.
    async fn fetch(&self) -> Result<Option<Delivery>, SourceError>;

    /// Acknowledge a delivery. Idempotent; after ack the delivery is
    /// never redelivered.
    async fn ack(&self, token: &DeliveryToken) -> Result<(), SourceError>;

    /// Reject a delivery. A retryable nack re-queues the job while it
    /// has attempts left; otherwise it goes to the dead-letter sink.
    async fn nack(&self, delivery: &Delivery, retryable: bool) -> Result<(), SourceError>;

    /// Emit one partial-output frame. Ordering per job id is
    /// preserved by the backend.
    async fn publish_partial(&self, frame: &PartialFrame) -> Result<(), SourceError>;

    /// Reclaim deliveries whose owner has not acknowledged within the
    /// visibility timeout.
    async fn claim_stale(&self) -> Result<Vec<Delivery>, SourceError>;

    /// Give the backend a chance to repair state after a fetch error
    /// (e.g. recreate a dropped consumer group). Default: no-op.
    async fn recover(&self, _error: &SourceError) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Side-channels sharing the source's connection: fire-and-forget
/// pub/sub, durable stream appends, and channel subscriptions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), SourceError>;

    async fn append(&self, stream: &str, payload: &[u8]) -> Result<(), SourceError>;

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>, SourceError>;
}

/// Configuration shared by both source backends.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Queue (stream) names, drained with round-robin fairness when
    /// more than one is configured.
    pub queues: Vec<String>,
    pub consumer_group: String,
    /// Per-process consumer name.
    pub consumer_name: String,
    /// Blocking read timeout; keeps idle loops responsive.
    pub block_timeout_ms: u64,
    /// Deliveries per job before it is dead-lettered.
    pub max_attempts: u32,
    /// Unacked deliveries older than this are eligible for reclaim.
    pub visibility_timeout_ms: u64,
    /// Entries read per queue per sweep.
    pub batch_size: usize,
    /// Appended to a queue name to form its dead-letter stream.
    pub dlq_suffix: String,
    /// Log every fetched envelope at debug level.
    pub debug: bool,
}

impl SourceConfig {
    pub fn new(
        queues: Vec<String>,
        consumer_group: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Self {
        Self {
            queues,
            consumer_group: consumer_group.into(),
            consumer_name: consumer_name.into(),
            block_timeout_ms: 5000,
            max_attempts: 3,
            visibility_timeout_ms: 30_000,
            batch_size: 10,
            dlq_suffix: ":dlq".to_string(),
            debug: false,
        }
    }

    pub fn with_block_timeout_ms(mut self, ms: u64) -> Self {
        self.block_timeout_ms = ms;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_visibility_timeout_ms(mut self, ms: u64) -> Self {
        self.visibility_timeout_ms = ms;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Dead-letter stream for a queue.
    pub fn dlq_stream(&self, queue: &str) -> String {
        format!("{}{}", queue, self.dlq_suffix)
    }
}

/// Stream receiving usage envelopes from every node.
pub const USAGE_STREAM: &str = "node:usage:stream";

/// Channel carrying a node's periodic status snapshot.
pub fn status_channel(node_id: &str) -> String {
    format!("node:status:{node_id}")
}

/// Channel carrying config pushes for a node.
pub fn config_channel(node_id: &str) -> String {
    format!("node:config:{node_id}")
}

/// Channel carrying partial-output frames for a job.
pub fn output_channel(job_id: &str) -> String {
    format!("job:output:{job_id}")
}
