//! Handler registry: resolves a job type tag to its executor.
//!
//! The registry is fixed at process start. Handlers are stateless
//! beyond the resources they lease and talk to the locally-running
//! model server themselves.

use crate::error::HandlerError;
use crate::job::Job;
use crate::stream::StreamWriter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Counters a handler reports on success; all flow into the job's
/// usage record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    pub backend: Option<String>,
    pub model: Option<String>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub request_bytes: Option<u64>,
    pub response_bytes: Option<u64>,
}

/// Executor for one job type.
///
/// Implementations must respect the shutdown signal: a cancelled
/// handler gets a bounded wind-down budget before the runner abandons
/// its task.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(
        &self,
        job: &Job,
        writer: Option<&StreamWriter>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<HandlerOutput, HandlerError>;

    /// Handler name for logging.
    fn name(&self) -> &'static str;
}

/// Mapping from job type tag to executor.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    pub fn resolve(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Registered type tags, for startup logging.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
