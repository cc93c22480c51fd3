//! Error types for the worker runtime.
//!
//! Source/transport failures, handler failures (classified for the
//! retry policy), and the fatal errors that stop the runner.

use thiserror::Error;

/// Errors surfaced by a job source or transport backend.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// HTTP error from the bridge.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Bridge returned a non-success status.
    #[error("Bridge returned {status}: {body}")]
    BridgeStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    /// WebSocket channel failure; callers fall back to HTTP.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed inbound envelope. Logged and dropped, never retried.
    #[error("Malformed envelope: {0}")]
    Protocol(String),

    /// Consumer group error.
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Credentials rejected by the control plane. Surfaced, not retried.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Stream writer already closed.
    #[error("Stream writer closed")]
    WriterClosed,

    /// Operation timed out.
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl SourceError {
    /// BLOCK timeout on a stream read. No messages arrived within the
    /// block period; expected behavior, not an error.
    pub fn is_block_timeout(&self) -> bool {
        match self {
            Self::Redis(e) => {
                let err_str = e.to_string().to_lowercase();
                err_str.contains("timed out") && !err_str.contains("connection")
            }
            _ => false,
        }
    }

    /// Connection-level error that is likely to recover with backoff.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis(e) => {
                if self.is_block_timeout() {
                    return false;
                }
                let err_str = e.to_string().to_lowercase();
                err_str.contains("connection")
                    || err_str.contains("disconnected")
                    || err_str.contains("broken pipe")
                    || err_str.contains("reset by peer")
                    || err_str.contains("refused")
                    || err_str.contains("io error")
            }
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            Self::Timeout(_) | Self::WebSocket(_) => true,
            _ => false,
        }
    }

    /// Missing consumer group (NOGROUP); recreate and continue.
    pub fn is_nogroup_error(&self) -> bool {
        match self {
            Self::Redis(e) => e.to_string().contains("NOGROUP"),
            Self::ConsumerGroup(s) => s.contains("NOGROUP"),
            _ => false,
        }
    }

    /// Terminal transport failure (bad credentials, missing resource):
    /// surface and exit rather than retry.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Unauthorized(_) => true,
            Self::BridgeStatus { status, .. } => {
                matches!(status.as_u16(), 401 | 403 | 404)
            }
            _ => false,
        }
    }
}

/// Error returned by a job handler, classified for the retry policy.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Network blip, timeout, 5xx from the model server: eligible for
    /// redelivery while the job has attempts left.
    #[error("transient: {0}")]
    Transient(String),

    /// Bad payload, unknown model, handler assertion: never redeliver.
    #[error("terminal: {0}")]
    Terminal(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify an HTTP error from a local collaborator: client-side
    /// errors are terminal, everything else worth retrying.
    pub fn from_http(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.is_client_error() => Self::Terminal(e.to_string()),
            _ => Self::Transient(e.to_string()),
        }
    }
}

/// Failures that must stop the runner. Everything else is recovered
/// locally inside the task that saw it.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Usage journal failure: {0}")]
    UsageSink(String),

    #[error("Device tracker failure: {0}")]
    Tracker(String),
}

/// Error from recording a usage record into the local journal.
#[derive(Error, Debug)]
#[error("Usage sink error: {0}")]
pub struct UsageSinkError(pub String);
