//! Echo handler: streams the payload message back one character per
//! frame. Used as the end-to-end smoke test for the whole delivery
//! and streaming pipeline, without touching the model server.

use async_trait::async_trait;
use node_runtime::{HandlerError, HandlerOutput, Job, JobHandler, StreamWriter};
use tokio::sync::watch;

pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn execute(
        &self,
        job: &Job,
        writer: Option<&StreamWriter>,
        _shutdown: watch::Receiver<bool>,
    ) -> Result<HandlerOutput, HandlerError> {
        let msg = job
            .payload_str("msg")
            .ok_or_else(|| HandlerError::terminal("echo payload missing 'msg'"))?;

        if let Some(writer) = writer {
            for ch in msg.chars() {
                writer
                    .append(ch.to_string())
                    .await
                    .map_err(|e| HandlerError::transient(e.to_string()))?;
            }
        }

        Ok(HandlerOutput {
            backend: Some("echo".to_string()),
            request_bytes: Some(msg.len() as u64),
            response_bytes: Some(msg.len() as u64),
            ..Default::default()
        })
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_runtime::{Delivery, DeliveryToken, JobSource, PartialFrame, SourceError};
    use std::sync::{Arc, Mutex};

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

    fn echo_job(msg: &str) -> Job {
        let mut payload = serde_json::Map::new();
        payload.insert("msg".to_string(), serde_json::json!(msg));
        Job::new("j1", "echo").with_payload(payload)
    }

    #[tokio::test]
    async fn test_streams_each_character() {
        let capture = Arc::new(FrameCapture::default());
        let writer = StreamWriter::new(capture.clone(), "j1");
        let (_tx, shutdown) = watch::channel(false);

        let output = EchoHandler
            .execute(&echo_job("hi"), Some(&writer), shutdown)
            .await
            .unwrap();

        let frames = capture.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "h");
        assert_eq!(frames[1].data, "i");
        assert_eq!(output.response_bytes, Some(2));
    }

    #[tokio::test]
    async fn test_missing_msg_is_terminal() {
        let (_tx, shutdown) = watch::channel(false);
        let err = EchoHandler
            .execute(&Job::new("j1", "echo"), None, shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Terminal(_)));
    }
}
