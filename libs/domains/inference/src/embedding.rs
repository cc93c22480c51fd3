//! Embedding handler: single-shot call against `/v1/embeddings`.
//! No partial output; the runner's terminal frame is the only thing
//! stream consumers see.

use crate::ModelServerConfig;
use crate::chat::check_response;
use async_trait::async_trait;
use node_runtime::{HandlerError, HandlerOutput, Job, JobHandler, StreamWriter};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::watch;

pub struct EmbeddingHandler {
    http: reqwest::Client,
    config: ModelServerConfig,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<serde_json::Value>,
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingUsage {
    prompt_tokens: u64,
    total_tokens: u64,
}

impl EmbeddingHandler {
    pub fn new(config: ModelServerConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .expect("reqwest client");
        Self { http, config }
    }
}

#[async_trait]
impl JobHandler for EmbeddingHandler {
    async fn execute(
        &self,
        job: &Job,
        _writer: Option<&StreamWriter>,
        _shutdown: watch::Receiver<bool>,
    ) -> Result<HandlerOutput, HandlerError> {
        let input = job
            .payload
            .get("input")
            .cloned()
            .ok_or_else(|| HandlerError::terminal("embedding payload missing 'input'"))?;
        let model = job
            .payload_str("model")
            .unwrap_or(&self.config.default_model)
            .to_string();

        let body = json!({ "model": model, "input": input });
        let request_bytes = body.to_string().len() as u64;

        let response = self
            .http
            .post(format!("{}/v1/embeddings", self.config.base_url))
            .json(&body)
            .send()
            .await
            .map_err(HandlerError::from_http)?;
        let response = check_response(response).await?;

        let raw = response
            .bytes()
            .await
            .map_err(|e| HandlerError::transient(e.to_string()))?;
        let parsed: EmbeddingResponse = serde_json::from_slice(&raw)
            .map_err(|e| HandlerError::terminal(format!("bad embeddings response: {e}")))?;

        let mut output = HandlerOutput {
            backend: Some("model-server".to_string()),
            model: Some(model),
            request_bytes: Some(request_bytes),
            response_bytes: Some(raw.len() as u64),
            ..Default::default()
        };
        if let Some(usage) = parsed.usage {
            output.prompt_tokens = Some(usage.prompt_tokens);
            output.total_tokens = Some(usage.total_tokens);
        }
        if parsed.data.is_empty() {
            return Err(HandlerError::terminal("embeddings response has no data"));
        }

        Ok(output)
    }

    fn name(&self) -> &'static str {
        "embedding"
    }
}
