//! Periodic node status publication.
//!
//! Every tick (default 30 s, live-tunable) a snapshot of identity,
//! load and collaborator health goes out on `node:status:{node_id}`
//! over the source's transport. Publish failures are logged and the
//! next tick tries again; nothing here can take the runner down.

use crate::gpu::GpuTracker;
use crate::runner::{RunnerStats, RuntimeKnobs, shutdown_signalled};
use crate::source::{Transport, status_channel};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Probes the local collaborators (model server, journal, ...) whose
/// health belongs in the status snapshot.
#[async_trait]
pub trait HealthCollector: Send + Sync {
    /// Service name to "ok" or a short error summary.
    async fn probe(&self) -> BTreeMap<String, String>;
}

/// Collector for nodes with nothing to probe.
pub struct NoServices;

#[async_trait]
impl HealthCollector for NoServices {
    async fn probe(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusEnvelope<'a> {
    node_id: &'a str,
    org_id: &'a str,
    version: &'a str,
    in_flight: usize,
    slots: SlotGauges,
    services: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct SlotGauges {
    total: usize,
    leased: usize,
}

pub struct StatusPublisher {
    transport: Arc<dyn Transport>,
    node_id: String,
    org_id: String,
    version: String,
    stats: Arc<RunnerStats>,
    gpus: Arc<GpuTracker>,
    collector: Arc<dyn HealthCollector>,
    interval: Duration,
    knobs: watch::Receiver<RuntimeKnobs>,
}

impl StatusPublisher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        node_id: impl Into<String>,
        org_id: impl Into<String>,
        version: impl Into<String>,
        stats: Arc<RunnerStats>,
        gpus: Arc<GpuTracker>,
        collector: Arc<dyn HealthCollector>,
        knobs: watch::Receiver<RuntimeKnobs>,
    ) -> Self {
        Self {
            transport,
            node_id: node_id.into(),
            org_id: org_id.into(),
            version: version.into(),
            stats,
            gpus,
            collector,
            interval: Duration::from_secs(30),
            knobs,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let channel = status_channel(&self.node_id);
        info!(channel = %channel, interval_secs = self.interval.as_secs(), "Status publisher started");

        loop {
            let interval = self
                .knobs
                .borrow()
                .status_interval
                .unwrap_or(self.interval);
            tokio::select! {
                _ = shutdown_signalled(shutdown.clone()) => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if let Err(e) = self.publish_snapshot(&channel).await {
                warn!(error = %e, "Status publish failed");
                crate::metrics::record_source_error("status");
            }
        }

        info!("Status publisher stopped");
    }

    async fn publish_snapshot(&self, channel: &str) -> Result<(), crate::error::SourceError> {
        let services = self.collector.probe().await;
        let envelope = StatusEnvelope {
            node_id: &self.node_id,
            org_id: &self.org_id,
            version: &self.version,
            in_flight: self.stats.in_flight(),
            slots: SlotGauges {
                total: self.gpus.total_slots(),
                leased: self.gpus.leased(),
            },
            services: &services,
        };

        let payload = serde_json::to_vec(&envelope)?;
        self.transport.publish(channel, &payload).await?;
        debug!(in_flight = envelope.in_flight, "Published node status");
        Ok(())
    }
}
