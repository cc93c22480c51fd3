//! Per-job append-only output channel.
//!
//! Each running job gets one writer. Frames carry a strictly
//! increasing sequence number starting at 0; closing emits exactly
//! one terminal frame and fails later appends. The writer does not
//! buffer: if the transport stalls, `append` blocks with it.

use crate::error::SourceError;
use crate::job::PartialFrame;
use crate::source::JobSource;
use crate::usage::JobStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

pub struct StreamWriter {
    source: Arc<dyn JobSource>,
    job_id: String,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl StreamWriter {
    pub fn new(source: Arc<dyn JobSource>, job_id: impl Into<String>) -> Self {
        Self {
            source,
            job_id: job_id.into(),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Emit one chunk of intermediate output.
    pub async fn append(&self, data: impl AsRef<[u8]>) -> Result<(), SourceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SourceError::WriterClosed);
        }

        let frame = PartialFrame {
            job_id: self.job_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            data: String::from_utf8_lossy(data.as_ref()).into_owned(),
            is_final: false,
        };
        self.source.publish_partial(&frame).await?;
        crate::metrics::record_partial_frame();
        Ok(())
    }

    /// Emit the terminal frame. Idempotent: only the first call
    /// publishes; every later append fails.
    pub async fn close(&self, status: JobStatus) -> Result<(), SourceError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let frame = PartialFrame {
            job_id: self.job_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            data: status.as_str().to_string(),
            is_final: true,
        };
        debug!(job_id = %self.job_id, frames = frame.seq, "Closing output stream");
        self.source.publish_partial(&frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::job::{Delivery, DeliveryToken};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FrameCapture {
        frames: Mutex<Vec<PartialFrame>>,
    }

    #[async_trait]
    impl JobSource for FrameCapture {
        async fn fetch(&self) -> Result<Option<Delivery>, SourceError> {
            Ok(None)
        }

        async fn ack(&self, _token: &DeliveryToken) -> Result<(), SourceError> {
            Ok(())
        }

        async fn nack(&self, _delivery: &Delivery, _retryable: bool) -> Result<(), SourceError> {
            Ok(())
        }

        async fn publish_partial(&self, frame: &PartialFrame) -> Result<(), SourceError> {
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }

        async fn claim_stale(&self) -> Result<Vec<Delivery>, SourceError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_sequence_starts_at_zero_and_is_contiguous() {
        let capture = Arc::new(FrameCapture::default());
        let writer = StreamWriter::new(capture.clone(), "j1");

        writer.append("h").await.unwrap();
        writer.append("i").await.unwrap();
        writer.close(JobStatus::Success).await.unwrap();

        let frames = capture.frames.lock().unwrap();
        let seqs: Vec<u64> = frames.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(frames[..2].iter().all(|f| !f.is_final));
        assert!(frames[2].is_final);
        assert_eq!(frames[2].data, "SUCCESS");
    }

    #[tokio::test]
    async fn test_append_after_close_fails() {
        let capture = Arc::new(FrameCapture::default());
        let writer = StreamWriter::new(capture.clone(), "j1");

        writer.close(JobStatus::Cancelled).await.unwrap();
        let err = writer.append("late").await.unwrap_err();
        assert!(matches!(err, SourceError::WriterClosed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let capture = Arc::new(FrameCapture::default());
        let writer = StreamWriter::new(capture.clone(), "j1");

        writer.close(JobStatus::Failure).await.unwrap();
        writer.close(JobStatus::Failure).await.unwrap();

        let frames = capture.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_final);
    }
}
