//! Periodic drain of the usage journal to the control plane.
//!
//! Each tick peeks a batch of the oldest records, wraps them in the
//! versioned envelope, appends them to the remote usage stream in
//! insertion order, and deletes them only after every append
//! succeeded. A publish failure aborts the tick with the records
//! still journaled, which makes the pipeline resumable after any
//! crash. The transport client is created once and reused across
//! ticks.

use crate::journal::{Journal, JournalError};
use node_runtime::{
    SourceError, Transport, USAGE_STREAM, UsageEnvelope, metrics, shutdown_signalled,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Transport(#[from] SourceError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Blocking task failed: {0}")]
    Task(String),
}

pub struct UsageSyncer {
    journal: Arc<Journal>,
    transport: Arc<dyn Transport>,
    node_id: String,
    interval: Duration,
    batch: usize,
}

impl UsageSyncer {
    pub fn new(journal: Arc<Journal>, transport: Arc<dyn Transport>) -> Self {
        let node_id = journal.node_id().to_string();
        Self {
            journal,
            transport,
            node_id,
            interval: Duration::from_secs(60),
            batch: 256,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            batch = self.batch,
            "Usage syncer started"
        );

        loop {
            tokio::select! {
                _ = shutdown_signalled(shutdown.clone()) => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.sync_once().await {
                Ok(0) => {}
                Ok(count) => debug!(count, "Usage records synced"),
                // Records stay journaled; the next tick retries.
                Err(e) => warn!(error = %e, "Usage sync tick failed"),
            }
        }

        // Final best-effort drain so a clean shutdown leaves nothing
        // behind.
        if let Err(e) = self.sync_once().await {
            warn!(error = %e, "Final usage drain failed");
        }
        info!("Usage syncer stopped");
    }

    /// Publish one batch. Returns how many records were acked and
    /// deleted.
    pub async fn sync_once(&self) -> Result<usize, SyncError> {
        let journal = Arc::clone(&self.journal);
        let batch = self.batch;
        let entries = tokio::task::spawn_blocking(move || journal.peek(batch))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))??;

        if entries.is_empty() {
            metrics::set_usage_journal_rows(0.0);
            return Ok(0);
        }

        let mut synced = Vec::with_capacity(entries.len());
        for entry in entries {
            let envelope = UsageEnvelope::new(&self.node_id, entry.record);
            let payload = serde_json::to_vec(&envelope)?;
            // In-order appends; any failure aborts the tick.
            self.transport.append(USAGE_STREAM, &payload).await?;
            synced.push(entry.seq);
        }

        let journal = Arc::clone(&self.journal);
        let seqs = synced.clone();
        tokio::task::spawn_blocking(move || journal.delete(&seqs))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))??;

        metrics::record_usage_synced(synced.len() as u64);
        metrics::set_usage_journal_rows(self.journal.len().unwrap_or(0) as f64);
        Ok(synced.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use node_runtime::{Job, JobStatus, UsageRecord};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CaptureTransport {
        appended: Mutex<Vec<(String, Vec<u8>)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Transport for CaptureTransport {
        async fn publish(&self, _channel: &str, _payload: &[u8]) -> Result<(), SourceError> {
            Ok(())
        }

        async fn append(&self, stream: &str, payload: &[u8]) -> Result<(), SourceError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SourceError::Timeout("append".to_string()));
            }
            self.appended
                .lock()
                .unwrap()
                .push((stream.to_string(), payload.to_vec()));
            Ok(())
        }

        async fn subscribe(
            &self,
            _channel: &str,
        ) -> Result<mpsc::Receiver<Vec<u8>>, SourceError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    fn record(id: &str) -> UsageRecord {
        let now = Utc::now();
        UsageRecord::new(&Job::new(id, "echo"), JobStatus::Success, now, now)
    }

    fn journal(dir: &tempfile::TempDir) -> Arc<Journal> {
        Arc::new(Journal::open(&dir.path().join("usage.db"), "n1").unwrap())
    }

    #[tokio::test]
    async fn test_sync_publishes_in_order_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);
        for i in 0..3 {
            journal.insert(&record(&format!("j{i}"))).unwrap();
        }

        let transport = Arc::new(CaptureTransport::default());
        let syncer = UsageSyncer::new(journal.clone(), transport.clone());

        let synced = syncer.sync_once().await.unwrap();
        assert_eq!(synced, 3);
        assert!(journal.is_empty().unwrap());

        let appended = transport.appended.lock().unwrap();
        assert!(appended.iter().all(|(stream, _)| stream == USAGE_STREAM));
        let ids: Vec<String> = appended
            .iter()
            .map(|(_, payload)| {
                let envelope: serde_json::Value = serde_json::from_slice(payload).unwrap();
                assert_eq!(envelope["version"], "1.0");
                assert_eq!(envelope["nodeId"], "n1");
                envelope["record"]["jobId"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(ids, vec!["j0", "j1", "j2"]);
    }

    #[tokio::test]
    async fn test_failed_tick_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);
        journal.insert(&record("j0")).unwrap();

        let transport = Arc::new(CaptureTransport::default());
        transport.fail.store(true, Ordering::SeqCst);
        let syncer = UsageSyncer::new(journal.clone(), transport.clone());

        assert!(syncer.sync_once().await.is_err());
        assert_eq!(journal.len().unwrap(), 1);

        // Next tick succeeds and drains.
        transport.fail.store(false, Ordering::SeqCst);
        assert_eq!(syncer.sync_once().await.unwrap(), 1);
        assert!(journal.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_resume_after_crash_publishes_backlog_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.db");

        {
            let journal = Arc::new(Journal::open(&path, "n1").unwrap());
            for i in 0..10 {
                journal.insert(&record(&format!("j{i}"))).unwrap();
            }
            // Process dies before any sync tick.
        }

        let journal = Arc::new(Journal::open(&path, "n1").unwrap());
        let transport = Arc::new(CaptureTransport::default());
        let syncer = UsageSyncer::new(journal.clone(), transport.clone());

        assert_eq!(syncer.sync_once().await.unwrap(), 10);
        let appended = transport.appended.lock().unwrap();
        assert_eq!(appended.len(), 10);
        let first: serde_json::Value = serde_json::from_slice(&appended[0].1).unwrap();
        let last: serde_json::Value = serde_json::from_slice(&appended[9].1).unwrap();
        assert_eq!(first["record"]["jobId"], "j0");
        assert_eq!(last["record"]["jobId"], "j9");
    }

    #[tokio::test]
    async fn test_batch_limit_respected() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir);
        for i in 0..5 {
            journal.insert(&record(&format!("j{i}"))).unwrap();
        }

        let transport = Arc::new(CaptureTransport::default());
        let syncer = UsageSyncer::new(journal.clone(), transport.clone()).with_batch(2);

        assert_eq!(syncer.sync_once().await.unwrap(), 2);
        assert_eq!(journal.len().unwrap(), 3);
        // Oldest first.
        let remaining = journal.peek(10).unwrap();
        assert_eq!(remaining[0].record.job_id, "j2");
    }
}
