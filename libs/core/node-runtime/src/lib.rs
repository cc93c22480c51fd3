//! Worker runtime for the Citadel node agent.
//!
//! The runtime pulls jobs from a durable queue, admits them onto
//! bounded device slots, streams partial output back while a job
//! runs, records per-job usage, and keeps the node's status and
//! configuration in sync with the control plane.
//!
//! # Architecture
//!
//! ```text
//! JobSource (Redis streams | HTTP/WS bridge)
//!   ↓ fetch / ack / nack / claim-stale
//! Runner ── GpuTracker (FIFO admission)
//!   ↓ dispatch         └─ one permit per accelerator
//! HandlerRegistry → JobHandler
//!   ↓ partial frames through StreamWriter
//! remote consumers
//!
//! Runner → UsageSink (durable journal) → usage syncer → control plane
//! StatusPublisher / ConfigSubscriber run alongside on the same
//! transport, sharing only the runner's gauges.
//! ```
//!
//! Backend choice is a one-time bootstrap decision; everything above
//! the source traits is backend-agnostic.

mod config_sync;
mod error;
mod gpu;
pub mod health;
mod job;
pub mod metrics;
mod registry;
mod runner;
pub mod source;
mod status;
mod stream;
mod usage;

pub use config_sync::ConfigSubscriber;
pub use error::{HandlerError, RunnerError, SourceError, UsageSinkError};
pub use gpu::{GpuLease, GpuTracker};
pub use health::{HealthState, health_router};
pub use job::{Delivery, DeliveryToken, Job, PartialFrame};
pub use registry::{HandlerOutput, HandlerRegistry, JobHandler};
pub use runner::{
    Runner, RunnerConfig, RunnerStats, RuntimeKnobs, shutdown_signalled,
};
pub use source::{
    JobSource, SourceConfig, Transport, USAGE_STREAM, bridge::BridgeConfig, bridge::BridgeSource,
    config_channel, output_channel, redis::RedisSource, status_channel,
};
pub use status::{HealthCollector, NoServices, StatusPublisher};
pub use stream::StreamWriter;
pub use usage::{JobStatus, UsageEnvelope, UsageRecord, UsageSink};
