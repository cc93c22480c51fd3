//! Tracing initialization with environment-aware output.
//!
//! - **Production** (`APP_ENV=production`): JSON format for log
//!   aggregation, module targets hidden.
//! - **Development** (default): pretty-printed, targets shown.
//!
//! When a log directory is given, every run also writes a plain-text
//! log file `agent-<timestamp>.log` and repoints a `latest.log`
//! symlink at it. The returned [`LogHandle`] keeps the non-blocking
//! writer alive and allows the level filter to be swapped at runtime
//! (used by the config subscriber for `logLevel` pushes).

use crate::Environment;
use eyre::WrapErr;
use std::path::Path;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Handle to the installed subscriber.
///
/// Dropping this flushes and stops the file writer, so the bootstrap
/// keeps it alive for the whole process.
pub struct LogHandle {
    reload: reload::Handle<EnvFilter, Registry>,
    _guard: Option<WorkerGuard>,
}

impl LogHandle {
    /// Replace the active level filter with new directives
    /// (e.g. `"info"` or `"debug,hyper=warn"`).
    pub fn set_level(&self, directives: &str) -> eyre::Result<()> {
        let filter = EnvFilter::try_new(directives)
            .wrap_err_with(|| format!("Invalid log directives '{directives}'"))?;
        self.reload
            .reload(filter)
            .wrap_err("Failed to swap log filter")?;
        info!(directives = %directives, "Log level updated");
        Ok(())
    }
}

/// Initialize tracing for the process.
///
/// `RUST_LOG` overrides the environment-based default. Calling this
/// twice is harmless (the second call keeps the first subscriber),
/// which keeps tests simple.
pub fn init_logging(environment: &Environment, log_dir: Option<&Path>) -> eyre::Result<LogHandle> {
    let is_production = environment.is_production();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if is_production {
            EnvFilter::new("info")
        } else {
            EnvFilter::new("debug,hyper=info,reqwest=info")
        }
    });
    let (filter, reload_handle) = reload::Layer::new(filter);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let (writer, guard) = open_log_file(dir)?;
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // ErrorLayer captures span traces for color-eyre reports.
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default())
        .with(file_layer);

    let result = if is_production {
        registry
            .with(fmt::layer().json().with_target(false))
            .try_init()
    } else {
        registry.with(fmt::layer().pretty()).try_init()
    };

    match result {
        Ok(_) => info!("Tracing initialized. Environment: {:?}", environment),
        Err(_) => debug!("Tracing already initialized, skipping re-initialization"),
    }

    Ok(LogHandle {
        reload: reload_handle,
        _guard: guard,
    })
}

/// Create the per-run log file and repoint the `latest.log` symlink.
fn open_log_file(
    dir: &Path,
) -> eyre::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)
        .wrap_err_with(|| format!("Failed to create log directory {}", dir.display()))?;

    let file_name = format!("agent-{}.log", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
    let path = dir.join(&file_name);
    let file = std::fs::File::create(&path)
        .wrap_err_with(|| format!("Failed to create log file {}", path.display()))?;

    refresh_latest_symlink(dir, &file_name);

    let (writer, guard) = tracing_appender::non_blocking(file);
    Ok((writer, guard))
}

#[cfg(unix)]
fn refresh_latest_symlink(dir: &Path, file_name: &str) {
    let link = dir.join("latest.log");
    let _ = std::fs::remove_file(&link);
    if let Err(e) = std::os::unix::fs::symlink(file_name, &link) {
        warn!(error = %e, "Failed to update latest.log symlink");
    }
}

#[cfg(not(unix))]
fn refresh_latest_symlink(_dir: &Path, _file_name: &str) {}
