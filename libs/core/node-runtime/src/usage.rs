//! Per-job usage accounting types and the sink the runner writes
//! records through. The durable journal and the syncer that drains it
//! to the control plane live in the `usage` crate.

use crate::error::UsageSinkError;
use crate::job::Job;
use crate::registry::HandlerOutput;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal outcome of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Success,
    Failure,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Accounting entry emitted once per terminal job outcome.
///
/// Serializes to the camelCase wire shape used inside the usage
/// envelope. Internal error messages never appear here. `node_id` is
/// stamped by the journal at insert time and travels in the envelope,
/// not the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub job_id: String,
    pub job_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_bytes: Option<u64>,
}

impl UsageRecord {
    pub fn new(
        job: &Job,
        status: JobStatus,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            backend: None,
            model: None,
            status,
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds().max(0),
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            request_bytes: None,
            response_bytes: None,
        }
    }

    /// Fold in the counters a successful handler reported.
    pub fn with_output(mut self, output: &HandlerOutput) -> Self {
        self.backend = output.backend.clone();
        self.model = output.model.clone();
        self.prompt_tokens = output.prompt_tokens;
        self.completion_tokens = output.completion_tokens;
        self.total_tokens = output.total_tokens;
        self.request_bytes = output.request_bytes;
        self.response_bytes = output.response_bytes;
        self
    }
}

/// Envelope published on the usage stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEnvelope {
    pub version: String,
    pub node_id: String,
    pub record: UsageRecord,
}

impl UsageEnvelope {
    pub fn new(node_id: impl Into<String>, record: UsageRecord) -> Self {
        Self {
            version: "1.0".to_string(),
            node_id: node_id.into(),
            record,
        }
    }
}

/// Where the runner drops terminal usage records. Implemented by the
/// durable journal; failures here are fatal to the runner.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<(), UsageSinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn record() -> UsageRecord {
        let started = Utc::now();
        UsageRecord::new(
            &Job::new("j1", "echo"),
            JobStatus::Success,
            started,
            started + TimeDelta::milliseconds(250),
        )
    }

    #[test]
    fn test_duration_computed() {
        let rec = record();
        assert_eq!(rec.duration_ms, 250);
        assert!(rec.completed_at >= rec.started_at);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = UsageEnvelope::new("node-1", record());
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["version"], "1.0");
        assert_eq!(value["nodeId"], "node-1");
        assert_eq!(value["record"]["jobId"], "j1");
        assert_eq!(value["record"]["jobType"], "echo");
        assert_eq!(value["record"]["status"], "SUCCESS");
        assert_eq!(value["record"]["durationMs"], 250);
        // optional counters and error details are absent
        assert!(value["record"].get("promptTokens").is_none());
        assert!(value["record"].get("error").is_none());
        // timestamps are RFC3339
        assert!(value["record"]["startedAt"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_with_output_folds_counters() {
        let output = HandlerOutput {
            backend: Some("llama-server".to_string()),
            model: Some("llama-3-8b".to_string()),
            prompt_tokens: Some(12),
            completion_tokens: Some(34),
            total_tokens: Some(46),
            ..Default::default()
        };
        let rec = record().with_output(&output);
        assert_eq!(rec.model.as_deref(), Some("llama-3-8b"));
        assert_eq!(rec.total_tokens, Some(46));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [JobStatus::Success, JobStatus::Failure, JobStatus::Cancelled] {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("BOGUS".parse::<JobStatus>().is_err());
    }
}
