//! Prometheus metrics for the node runtime.
//!
//! ## Available Metrics
//!
//! - `node_jobs_processed_total` - Counter of terminal jobs by type and outcome
//! - `node_job_duration_seconds` - Histogram of handler wall-clock time
//! - `node_in_flight_jobs` - Gauge of currently running jobs
//! - `node_device_slots_leased` - Gauge of leased accelerator slots
//! - `node_job_retries_total` - Counter of retryable nacks
//! - `node_partial_frames_total` - Counter of emitted partial-output frames
//! - `node_source_errors_total` - Counter of source/transport errors by kind
//! - `node_usage_records_synced_total` - Counter of usage records acked remotely
//! - `node_usage_journal_rows` - Gauge of unsynced journal rows

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency
pub mod names {
    pub const JOBS_PROCESSED: &str = "node_jobs_processed_total";
    pub const JOB_DURATION: &str = "node_job_duration_seconds";
    pub const IN_FLIGHT_JOBS: &str = "node_in_flight_jobs";
    pub const SLOTS_LEASED: &str = "node_device_slots_leased";
    pub const RETRIES: &str = "node_job_retries_total";
    pub const PARTIAL_FRAMES: &str = "node_partial_frames_total";
    pub const SOURCE_ERRORS: &str = "node_source_errors_total";
    pub const USAGE_SYNCED: &str = "node_usage_records_synced_total";
    pub const USAGE_JOURNAL_ROWS: &str = "node_usage_journal_rows";
}

/// Install the Prometheus recorder. Call once at startup; the handle
/// renders the exposition format for the `/metrics` endpoint.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Global handle, or None before `init_metrics`.
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Terminal job outcome, plus the duplicate-suppression case.
pub fn record_job_processed(job_type: &str, outcome: &'static str) {
    counter!(
        names::JOBS_PROCESSED,
        "job_type" => job_type.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_job_duration(job_type: &str, duration: Duration) {
    histogram!(
        names::JOB_DURATION,
        "job_type" => job_type.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn set_in_flight_jobs(count: f64) {
    gauge!(names::IN_FLIGHT_JOBS).set(count);
}

pub fn set_slots_leased(count: f64) {
    gauge!(names::SLOTS_LEASED).set(count);
}

pub fn record_retry(job_type: &str) {
    counter!(
        names::RETRIES,
        "job_type" => job_type.to_string()
    )
    .increment(1);
}

pub fn record_partial_frame() {
    counter!(names::PARTIAL_FRAMES).increment(1);
}

pub fn record_source_error(kind: &'static str) {
    counter!(
        names::SOURCE_ERRORS,
        "kind" => kind
    )
    .increment(1);
}

pub fn record_usage_synced(count: u64) {
    counter!(names::USAGE_SYNCED).increment(count);
}

pub fn set_usage_journal_rows(rows: f64) {
    gauge!(names::USAGE_JOURNAL_ROWS).set(rows);
}
