//! Startup wiring: GPU discovery, source selection, concurrency cap.

use core_config::FromEnv;
use core_config::identity::NodeIdentity;
use database::redis::{RedisConfig, connect_with_retry};
use eyre::WrapErr;
use node_runtime::{BridgeConfig, BridgeSource, JobSource, RedisSource, SourceConfig, Transport};
use nvml_wrapper::Nvml;
use std::sync::Arc;
use tracing::{info, warn};

/// Count the accelerators once at startup. Any NVML failure means a
/// CPU-only node, not a startup error.
pub fn detect_gpus() -> usize {
    match Nvml::init() {
        Ok(nvml) => match nvml.device_count() {
            Ok(count) => {
                info!(gpus = count, "Detected accelerators");
                count as usize
            }
            Err(e) => {
                warn!(error = %e, "NVML device enumeration failed, running CPU-only");
                0
            }
        },
        Err(e) => {
            info!(error = %e, "NVML unavailable, running CPU-only");
            0
        }
    }
}

/// Concurrency cap: one job per slot by default; a user cap is
/// honored but never exceeds the slot count on a GPU host.
pub fn concurrency_cap(user: Option<usize>, slots: usize) -> usize {
    match (user, slots) {
        (Some(user), 0) => user.max(1),
        (Some(user), slots) => user.min(slots).max(1),
        (None, 0) => 1,
        (None, slots) => slots,
    }
}

/// One-time source selection: the bridge when the node is enrolled
/// (has a device token) and direct mode is not forced, otherwise the
/// stream database.
pub async fn open_source(
    identity: &NodeIdentity,
    config: SourceConfig,
    direct: bool,
) -> eyre::Result<(Arc<dyn JobSource>, Arc<dyn Transport>, &'static str)> {
    if let (Some(token), false) = (&identity.device_api_token, direct) {
        let bridge = Arc::new(
            BridgeSource::connect(BridgeConfig {
                base_url: identity.api_base_url.clone(),
                token: token.clone(),
                source: config,
            })
            .wrap_err("Failed to set up bridge client")?,
        );
        return Ok((
            Arc::clone(&bridge) as Arc<dyn JobSource>,
            bridge as Arc<dyn Transport>,
            "bridge",
        ));
    }

    let redis_config = match &identity.redis_url {
        Some(url) => RedisConfig {
            url: url.clone(),
            password: std::env::var("REDIS_PASSWORD").ok(),
        },
        None => RedisConfig::from_env()
            .wrap_err("No device token and no Redis URL; set CITADEL_API_KEY or REDIS_URL")?,
    };

    let connection = connect_with_retry(&redis_config.connection_url(), None)
        .await
        .wrap_err("Failed to connect to the stream database")?;
    let source = Arc::new(
        RedisSource::open(connection.client, connection.manager, config)
            .await
            .wrap_err("Failed to open the job stream")?,
    );
    Ok((
        Arc::clone(&source) as Arc<dyn JobSource>,
        source as Arc<dyn Transport>,
        "redis",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_cap_rules() {
        // Default: one per slot, floor of one on CPU-only hosts.
        assert_eq!(concurrency_cap(None, 0), 1);
        assert_eq!(concurrency_cap(None, 4), 4);

        // User cap bounded by the slot count when slots exist.
        assert_eq!(concurrency_cap(Some(2), 4), 2);
        assert_eq!(concurrency_cap(Some(8), 4), 4);

        // No slots: the user cap stands alone.
        assert_eq!(concurrency_cap(Some(8), 0), 8);
        assert_eq!(concurrency_cap(Some(0), 0), 1);
    }
}
