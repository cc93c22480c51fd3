//! Streaming chat-completion handler.
//!
//! POSTs the job payload to the local model server's
//! `/v1/chat/completions` and relays each SSE delta as one partial
//! frame. Token counters come from the final usage chunk when the
//! server reports one.

use crate::ModelServerConfig;
use async_trait::async_trait;
use futures::StreamExt;
use node_runtime::{HandlerError, HandlerOutput, Job, JobHandler, StreamWriter, shutdown_signalled};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

pub struct ChatCompletionHandler {
    http: reqwest::Client,
    config: ModelServerConfig,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl ChatCompletionHandler {
    pub fn new(config: ModelServerConfig) -> Self {
        // No overall timeout: generations run long. Connects and idle
        // reads are still bounded.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(120))
            .build()
            .expect("reqwest client");
        Self { http, config }
    }

    fn fold_usage(output: &mut HandlerOutput, usage: Option<ApiUsage>) {
        if let Some(usage) = usage {
            output.prompt_tokens = Some(usage.prompt_tokens);
            output.completion_tokens = Some(usage.completion_tokens);
            output.total_tokens = Some(usage.total_tokens);
        }
    }
}

#[async_trait]
impl JobHandler for ChatCompletionHandler {
    async fn execute(
        &self,
        job: &Job,
        writer: Option<&StreamWriter>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<HandlerOutput, HandlerError> {
        let messages = job
            .payload
            .get("messages")
            .cloned()
            .ok_or_else(|| HandlerError::terminal("chat payload missing 'messages'"))?;
        let model = job
            .payload_str("model")
            .unwrap_or(&self.config.default_model)
            .to_string();

        let streaming = writer.is_some();
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": streaming,
        });
        if streaming {
            body["stream_options"] = json!({"include_usage": true});
        }
        let request_bytes = body.to_string().len() as u64;

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .json(&body)
            .send()
            .await
            .map_err(HandlerError::from_http)?;
        let response = check_response(response).await?;

        let mut output = HandlerOutput {
            backend: Some("model-server".to_string()),
            model: Some(model),
            request_bytes: Some(request_bytes),
            ..Default::default()
        };

        match writer {
            Some(writer) => {
                let mut response_bytes = 0u64;
                let mut stream = response.bytes_stream();
                let mut buf = String::new();

                loop {
                    let chunk = tokio::select! {
                        chunk = stream.next() => chunk,
                        _ = shutdown_signalled(shutdown.clone()) => {
                            return Err(HandlerError::transient("cancelled during generation"));
                        }
                    };
                    let Some(chunk) = chunk else { break };
                    let chunk = chunk.map_err(|e| HandlerError::transient(e.to_string()))?;
                    buf.push_str(&String::from_utf8_lossy(&chunk));

                    while let Some(pos) = buf.find('\n') {
                        let line: String = buf.drain(..=pos).collect();
                        let Some(chunk) = parse_sse_line(line.trim()) else {
                            continue;
                        };
                        Self::fold_usage(&mut output, chunk.usage);
                        for choice in &chunk.choices {
                            if let Some(content) = &choice.delta.content {
                                response_bytes += content.len() as u64;
                                writer
                                    .append(content)
                                    .await
                                    .map_err(|e| HandlerError::transient(e.to_string()))?;
                            }
                        }
                    }
                }

                output.response_bytes = Some(response_bytes);
            }
            None => {
                let chat: ChatResponse = response
                    .json()
                    .await
                    .map_err(|e| HandlerError::transient(e.to_string()))?;
                let content = chat
                    .choices
                    .first()
                    .and_then(|c| c.message.content.as_deref())
                    .unwrap_or_default();
                output.response_bytes = Some(content.len() as u64);
                Self::fold_usage(&mut output, chat.usage);
            }
        }

        debug!(
            job_id = %job.id,
            total_tokens = ?output.total_tokens,
            "Chat completion finished"
        );
        Ok(output)
    }

    fn name(&self) -> &'static str {
        "chat.completion"
    }
}

/// One SSE line to a parsed chunk. Comments, blanks, malformed JSON
/// and the `[DONE]` sentinel all yield None.
fn parse_sse_line(line: &str) -> Option<StreamChunk> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    serde_json::from_str(data).ok()
}

pub(crate) async fn check_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, HandlerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() {
        // Bad payload or unknown model: retrying cannot help.
        Err(HandlerError::terminal(format!("{status}: {body}")))
    } else {
        Err(HandlerError::transient(format!("{status}: {body}")))
    }
}
