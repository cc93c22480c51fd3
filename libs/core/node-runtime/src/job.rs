//! The job envelope and its delivery wrapper.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A unit of work pulled from the queue. Immutable after receipt.
///
/// Wire format: `{"id": str, "type": str, "payload": {..}, "attempts": int}`.
/// The payload stays an opaque mapping until the handler validates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Delivery count so far; monotonically increases per job id.
    #[serde(default)]
    pub attempts: u32,
}

impl Job {
    pub fn new(id: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            job_type: job_type.into(),
            payload: Map::new(),
            attempts: 0,
        }
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Copy that gets re-queued after a retryable failure.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempts: self.attempts + 1,
            ..self.clone()
        }
    }

    /// String field from the payload, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Opaque token needed to ack or nack one specific delivery of a job.
/// Produced by the source backend; never interpreted by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryToken(pub String);

impl fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One delivery of a job, as handed to the runner.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    pub token: DeliveryToken,
}

/// A frame of intermediate output for a still-running job.
///
/// Wire format: `{"jobId": str, "seq": int, "data": str, "final": bool}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialFrame {
    pub job_id: String,
    pub seq: u64,
    pub data: String,
    #[serde(rename = "final")]
    pub is_final: bool,
}
