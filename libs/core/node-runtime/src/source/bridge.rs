//! Bridged source: HTTP long-poll against the control-plane bridge,
//! with a WebSocket fast path for outbound publishes.
//!
//! The bridge keeps the same delivery-token semantics as the direct
//! stream source; tokens are opaque strings minted by the server.
//! While the WebSocket is up, partial frames and pub/sub publishes
//! ride it and inbound pushes (config updates) are routed to
//! subscribers; when it drops, everything falls back to HTTP POST and
//! a background task keeps retrying the upgrade with backoff.

use crate::error::SourceError;
use crate::job::{Delivery, DeliveryToken, Job, PartialFrame};
use crate::source::{JobSource, SourceConfig, Transport};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Extra head-room on top of the long-poll block timeout.
const POLL_TIMEOUT_MARGIN: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Control-plane base URL, e.g. `https://api.citadel-cloud.net`.
    pub base_url: String,
    /// Device API token sent as a bearer credential.
    pub token: String,
    pub source: SourceConfig,
}

pub struct BridgeSource {
    shared: Arc<BridgeShared>,
}

struct BridgeShared {
    http: reqwest::Client,
    base_url: String,
    token: String,
    config: SourceConfig,
    ws: Mutex<Option<WsSink>>,
    subscribers: StdMutex<HashMap<String, mpsc::Sender<Vec<u8>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollResponse {
    job: Job,
    delivery_token: String,
}

#[derive(Debug, Deserialize)]
struct InboundPush {
    channel: String,
    payload: serde_json::Value,
}

impl BridgeSource {
    /// Build the client and start the WebSocket maintenance task.
    pub fn connect(config: BridgeConfig) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let shared = Arc::new(BridgeShared {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
            config: config.source,
            ws: Mutex::new(None),
            subscribers: StdMutex::new(HashMap::new()),
        });

        tokio::spawn(ws_loop(Arc::clone(&shared)));
        Ok(Self { shared })
    }

    pub fn config(&self) -> &SourceConfig {
        &self.shared.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.shared.base_url, path)
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, SourceError> {
        let resp = self
            .shared
            .http
            .post(self.url(path))
            .bearer_auth(&self.shared.token)
            .json(body)
            .send()
            .await?;
        check_status(resp).await
    }

    /// Send a text frame over the WebSocket if it is up; the caller
    /// falls back to HTTP on error.
    async fn ws_send(&self, text: String) -> Result<(), SourceError> {
        let mut guard = self.shared.ws.lock().await;
        match guard.as_mut() {
            Some(sink) => match sink.send(Message::text(text)).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    // Drop the broken sink; the maintenance task will
                    // reconnect.
                    *guard = None;
                    Err(SourceError::WebSocket(e.to_string()))
                }
            },
            None => Err(SourceError::WebSocket("not connected".to_string())),
        }
    }
}

#[async_trait]
impl JobSource for BridgeSource {
    async fn fetch(&self) -> Result<Option<Delivery>, SourceError> {
        let cfg = &self.shared.config;
        let body = json!({
            "queues": cfg.queues,
            "group": cfg.consumer_group,
            "consumer": cfg.consumer_name,
            "blockMs": cfg.block_timeout_ms,
        });

        let resp = self
            .shared
            .http
            .post(self.url("/v1/worker/poll"))
            .bearer_auth(&self.shared.token)
            .timeout(Duration::from_millis(cfg.block_timeout_ms) + POLL_TIMEOUT_MARGIN)
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await?;

        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let poll: PollResponse = resp.json().await?;
        if cfg.debug {
            debug!(job_id = %poll.job.id, "Fetched job from bridge");
        }
        Ok(Some(Delivery {
            job: poll.job,
            token: DeliveryToken(poll.delivery_token),
        }))
    }

    async fn ack(&self, token: &DeliveryToken) -> Result<(), SourceError> {
        self.post("/v1/worker/ack", &json!({ "deliveryToken": token.0 }))
            .await?;
        debug!(token = %token, "Acknowledged delivery");
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, retryable: bool) -> Result<(), SourceError> {
        // The bridge owns the retry/dead-letter routing; attempts let
        // it apply the same bound as the direct source.
        self.post(
            "/v1/worker/nack",
            &json!({
                "deliveryToken": delivery.token.0,
                "retryable": retryable,
                "attempts": delivery.job.attempts,
            }),
        )
        .await?;

        if retryable {
            crate::metrics::record_retry(&delivery.job.job_type);
        }
        Ok(())
    }

    async fn publish_partial(&self, frame: &PartialFrame) -> Result<(), SourceError> {
        let ws_frame = json!({ "kind": "partial", "frame": frame });
        if self.ws_send(ws_frame.to_string()).await.is_ok() {
            return Ok(());
        }

        self.post("/v1/worker/partial", &serde_json::to_value(frame)?)
            .await?;
        Ok(())
    }

    async fn claim_stale(&self) -> Result<Vec<Delivery>, SourceError> {
        let cfg = &self.shared.config;
        let resp = self
            .post(
                "/v1/worker/claim",
                &json!({
                    "group": cfg.consumer_group,
                    "consumer": cfg.consumer_name,
                }),
            )
            .await?;

        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(vec![]);
        }

        let claimed: Vec<PollResponse> = resp.json().await?;
        Ok(claimed
            .into_iter()
            .map(|poll| Delivery {
                job: poll.job,
                token: DeliveryToken(poll.delivery_token),
            })
            .collect())
    }
}

#[async_trait]
impl Transport for BridgeSource {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), SourceError> {
        let payload_str = String::from_utf8_lossy(payload).into_owned();
        let ws_frame = json!({ "kind": "publish", "channel": channel, "payload": payload_str });
        if self.ws_send(ws_frame.to_string()).await.is_ok() {
            return Ok(());
        }

        self.post(
            "/v1/worker/publish",
            &json!({ "channel": channel, "payload": payload_str }),
        )
        .await?;
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &[u8]) -> Result<(), SourceError> {
        // Durable appends always take the HTTP path.
        self.post(
            "/v1/worker/append",
            &json!({
                "stream": stream,
                "payload": String::from_utf8_lossy(payload).into_owned(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>, SourceError> {
        let (tx, rx) = mpsc::channel(64);
        self.shared
            .subscribers
            .lock()
            .expect("subscriber mutex poisoned")
            .insert(channel.to_string(), tx);
        Ok(rx)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(SourceError::Unauthorized(format!("{status}: {body}")))
    } else {
        Err(SourceError::BridgeStatus { status, body })
    }
}

/// Keep the WebSocket up for as long as the process lives, routing
/// inbound pushes to subscribers and re-upgrading with backoff after
/// every loss.
async fn ws_loop(shared: Arc<BridgeShared>) {
    let mut backoff_secs = 1u64;
    loop {
        match open_ws(&shared).await {
            Ok(stream) => {
                backoff_secs = 1;
                info!("Bridge WebSocket connected");
                let (sink, mut read) = stream.split();
                *shared.ws.lock().await = Some(sink);

                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => route_inbound(&shared, text.as_str()),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!(error = %e, "WebSocket read error");
                            break;
                        }
                    }
                }

                *shared.ws.lock().await = None;
                warn!("Bridge WebSocket lost; falling back to HTTP");
            }
            Err(e) => {
                debug!(error = %e, "WebSocket upgrade failed");
            }
        }

        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
        backoff_secs = (backoff_secs * 2).min(30);
    }
}

async fn open_ws(
    shared: &BridgeShared,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, SourceError> {
    let url = ws_url(&shared.base_url);
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| SourceError::WebSocket(e.to_string()))?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", shared.token)
            .parse()
            .map_err(|_| SourceError::WebSocket("invalid bearer token".to_string()))?,
    );

    let (stream, _response) = connect_async(request)
        .await
        .map_err(|e| SourceError::WebSocket(e.to_string()))?;
    Ok(stream)
}

fn route_inbound(shared: &BridgeShared, text: &str) {
    let push: InboundPush = match serde_json::from_str(text) {
        Ok(push) => push,
        Err(e) => {
            warn!(error = %e, "Malformed push from bridge, dropping");
            crate::metrics::record_source_error("protocol");
            return;
        }
    };

    let payload = inbound_payload_bytes(&push.payload);
    let subscribers = shared
        .subscribers
        .lock()
        .expect("subscriber mutex poisoned");
    if let Some(tx) = subscribers.get(&push.channel) {
        if tx.try_send(payload).is_err() {
            warn!(channel = %push.channel, "Subscriber lagging, push dropped");
        }
    } else {
        debug!(channel = %push.channel, "Push for channel without subscriber");
    }
}

fn inbound_payload_bytes(payload: &serde_json::Value) -> Vec<u8> {
    match payload {
        serde_json::Value::String(s) => s.clone().into_bytes(),
        other => serde_json::to_vec(other).unwrap_or_default(),
    }
}

fn ws_url(base: &str) -> String {
    let swapped = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{swapped}/v1/worker/ws")
}
