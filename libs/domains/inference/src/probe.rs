//! Health probe for the local model server, injected into the status
//! publisher so the control plane sees collaborator health alongside
//! node load.

use async_trait::async_trait;
use node_runtime::HealthCollector;
use std::collections::BTreeMap;
use std::time::Duration;

pub struct ModelServerProbe {
    http: reqwest::Client,
    base_url: String,
}

impl ModelServerProbe {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl HealthCollector for ModelServerProbe {
    async fn probe(&self) -> BTreeMap<String, String> {
        let state = match self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => "ok".to_string(),
            Ok(response) => format!("status {}", response.status()),
            Err(e) if e.is_timeout() => "timeout".to_string(),
            Err(_) => "unreachable".to_string(),
        };

        BTreeMap::from([("model-server".to_string(), state)])
    }
}
