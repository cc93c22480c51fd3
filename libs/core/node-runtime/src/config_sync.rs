//! Live configuration subscriber.
//!
//! Listens on `node:config:{node_id}`. Each message is a JSON object
//! atomically replacing a subset of runtime knobs; application is
//! serialized through this single task, so the runner always observes
//! a consistent snapshot via its watch channel. Unknown keys are
//! ignored, malformed messages are logged and dropped.

use crate::runner::{RuntimeKnobs, shutdown_signalled};
use crate::source::{Transport, config_channel};
use core_config::logging::LogHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct ConfigSubscriber {
    transport: Arc<dyn Transport>,
    node_id: String,
    knobs: watch::Sender<RuntimeKnobs>,
    log: Option<Arc<LogHandle>>,
}

impl ConfigSubscriber {
    pub fn new(
        transport: Arc<dyn Transport>,
        node_id: impl Into<String>,
        knobs: watch::Sender<RuntimeKnobs>,
    ) -> Self {
        Self {
            transport,
            node_id: node_id.into(),
            knobs,
            log: None,
        }
    }

    /// Attach the tracing reload handle so `logLevel` pushes take
    /// effect immediately.
    pub fn with_log_handle(mut self, log: Arc<LogHandle>) -> Self {
        self.log = Some(log);
        self
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let channel = config_channel(&self.node_id);
        info!(channel = %channel, "Config subscriber started");

        loop {
            let mut rx = match self.transport.subscribe(&channel).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "Config subscribe failed, retrying");
                    tokio::select! {
                        _ = shutdown_signalled(shutdown.clone()) => break,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown_signalled(shutdown.clone()) => {
                        info!("Config subscriber stopped");
                        return;
                    }
                    message = rx.recv() => match message {
                        Some(payload) => self.apply(&payload),
                        None => {
                            warn!("Config channel closed, resubscribing");
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown_signalled(shutdown.clone()) => break,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }

        info!("Config subscriber stopped");
    }

    /// Apply one config push. Only whole messages take effect; a
    /// malformed payload changes nothing.
    fn apply(&self, payload: &[u8]) {
        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Malformed config push dropped");
                return;
            }
        };
        let Some(map) = value.as_object() else {
            warn!("Config push is not an object, dropped");
            return;
        };

        let mut knobs = self.knobs.borrow().clone();
        for (key, value) in map {
            match key.as_str() {
                "maxConcurrency" => match value.as_u64() {
                    Some(n) if n >= 1 => knobs.max_concurrency = Some(n as usize),
                    _ => warn!(value = %value, "Invalid maxConcurrency, ignored"),
                },
                "statusIntervalSecs" => match value.as_u64() {
                    Some(secs) if secs >= 1 => {
                        knobs.status_interval = Some(Duration::from_secs(secs));
                    }
                    _ => warn!(value = %value, "Invalid statusIntervalSecs, ignored"),
                },
                "logLevel" => match value.as_str() {
                    Some(directives) => {
                        knobs.log_level = Some(directives.to_string());
                        if let Some(log) = &self.log {
                            if let Err(e) = log.set_level(directives) {
                                warn!(error = %e, "Pushed log level rejected");
                            }
                        }
                    }
                    None => warn!(value = %value, "Invalid logLevel, ignored"),
                },
                unknown => debug!(key = %unknown, "Ignoring unknown config key"),
            }
        }

        if knobs != *self.knobs.borrow() {
            info!(
                max_concurrency = ?knobs.max_concurrency,
                status_interval = ?knobs.status_interval,
                log_level = ?knobs.log_level,
                "Applied config update"
            );
            self.knobs.send_replace(knobs);
        }
    }
}
