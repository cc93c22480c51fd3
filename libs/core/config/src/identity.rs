//! Node identity resolution and the persisted identity file.
//!
//! The agent keeps a single YAML identity file under the user config
//! root (`~/.config/citadel/identity.yaml` on Linux). `node_id` is
//! generated once and survives restarts; `worker_id` is fresh per
//! process. Resolution precedence for every field:
//! explicit argument > environment > identity file > built-in default.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Control-plane base URL used when nothing else is configured.
pub const DEFAULT_API_BASE_URL: &str = "https://api.citadel-cloud.net";

/// Name of the identity file inside the state directory.
pub const IDENTITY_FILE_NAME: &str = "identity.yaml";

/// Directory holding all persisted agent state (identity file, usage
/// journal, logs).
pub fn state_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("citadel")
}

/// On-disk identity file. All fields optional so partially enrolled
/// nodes round-trip cleanly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_api_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
}

impl IdentityFile {
    /// Load the identity file. A missing file yields the default
    /// (empty) identity rather than an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };

        serde_yaml::from_str(&raw).map_err(|e| ConfigError::Identity {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Persist the identity file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let raw = serde_yaml::to_string(self).map_err(|e| ConfigError::Identity {
            path: path.display().to_string(),
            source: e,
        })?;
        std::fs::write(path, raw).map_err(io_err)
    }
}

/// Values supplied on the command line, taking precedence over
/// environment and file.
#[derive(Debug, Clone, Default)]
pub struct IdentityOverrides {
    pub api_base_url: Option<String>,
    pub redis_url: Option<String>,
    pub node_name: Option<String>,
}

/// Fully resolved identity handed to the runtime.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    /// Stable across restarts; generated and persisted on first run.
    pub node_id: String,
    pub org_id: String,
    /// Fresh per process; used as the stream consumer name.
    pub worker_id: String,
    pub node_name: String,
    pub api_base_url: String,
    pub device_api_token: Option<String>,
    pub redis_url: Option<String>,
}

impl NodeIdentity {
    /// Resolve the node identity against the identity file at `path`,
    /// persisting newly generated fields (`node_id`, a pushed device
    /// code) back to disk.
    pub fn resolve(path: &Path, overrides: &IdentityOverrides) -> Result<Self, ConfigError> {
        let mut file = IdentityFile::load(path)?;
        let mut dirty = false;

        let node_id = match &file.node_id {
            Some(id) => id.clone(),
            None => {
                let id = Uuid::new_v4().to_string();
                file.node_id = Some(id.clone());
                dirty = true;
                id
            }
        };

        if let Ok(code) = env::var("CITADEL_DEVICE_CODE") {
            if file.device_code.as_deref() != Some(code.as_str()) {
                file.device_code = Some(code);
                dirty = true;
            }
        }

        let device_api_token = env::var("CITADEL_API_KEY")
            .ok()
            .or_else(|| file.device_api_token.clone());

        let api_base_url = overrides
            .api_base_url
            .clone()
            .or_else(|| env::var("CITADEL_API_BASE_URL").ok())
            .or_else(|| file.api_base_url.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

        let node_name = overrides
            .node_name
            .clone()
            .or_else(|| env::var("CITADEL_NODE_NAME").ok())
            .or_else(|| file.node_name.clone())
            .or_else(|| env::var("HOSTNAME").ok())
            .unwrap_or_else(|| format!("node-{}", node_id.get(..8).unwrap_or(&node_id)));

        let redis_url = overrides
            .redis_url
            .clone()
            .or_else(|| env::var("REDIS_URL").ok())
            .or_else(|| env::var("REDIS_HOST").ok())
            .or_else(|| file.redis_url.clone());

        let org_id = env::var("CITADEL_ORG_ID")
            .ok()
            .or_else(|| file.org_id.clone())
            .unwrap_or_else(|| "default".to_string());

        if dirty {
            file.save(path)?;
        }

        Ok(Self {
            node_id,
            org_id,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            node_name,
            api_base_url,
            device_api_token,
            redis_url,
        })
    }
}
