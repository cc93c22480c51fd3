//! Job handlers for the Citadel node agent.
//!
//! Each handler executes one job type against the model-serving
//! process already running on this host (an OpenAI-compatible HTTP
//! server). Handlers classify their failures for the runner: network
//! trouble and 5xx are transient, bad payloads and unknown models are
//! terminal.
//!
//! Job types: `echo` (pipeline smoke test), `chat.completion`
//! (streaming generation), `embedding`.

mod chat;
mod echo;
mod embedding;
mod probe;

pub use chat::ChatCompletionHandler;
pub use echo::EchoHandler;
pub use embedding::EmbeddingHandler;
pub use probe::ModelServerProbe;

use core_config::env_or_default;
use node_runtime::HandlerRegistry;
use std::sync::Arc;

/// Where the local model server listens and which model to use when a
/// job does not name one.
#[derive(Debug, Clone)]
pub struct ModelServerConfig {
    pub base_url: String,
    pub default_model: String,
}

impl ModelServerConfig {
    /// `MODEL_SERVER_URL` / `MODEL_NAME`, with local defaults.
    pub fn from_env() -> Self {
        Self {
            base_url: env_or_default("MODEL_SERVER_URL", "http://127.0.0.1:8080"),
            default_model: env_or_default("MODEL_NAME", "default"),
        }
    }
}

impl Default for ModelServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            default_model: "default".to_string(),
        }
    }
}

/// The fixed registry the agent runs with.
pub fn build_registry(config: &ModelServerConfig) -> HandlerRegistry {
    HandlerRegistry::new()
        .register("echo", Arc::new(EchoHandler))
        .register(
            "chat.completion",
            Arc::new(ChatCompletionHandler::new(config.clone())),
        )
        .register("embedding", Arc::new(EmbeddingHandler::new(config.clone())))
}
