//! Citadel node agent service.
//!
//! A long-running daemon that attaches this (typically GPU-equipped)
//! host to the Citadel control plane and executes inference jobs on
//! demand.
//!
//! ## Architecture
//!
//! ```text
//! control plane / Redis streams
//!   ↓ (job source: bridge or direct)
//! Runner ── GpuTracker ── HandlerRegistry (echo, chat, embedding)
//!   ↓ partial frames              ↓ terminal outcomes
//! stream consumers          usage journal → usage syncer → control plane
//!
//! StatusPublisher / ConfigSubscriber / health server run alongside.
//! ```
//!
//! First termination signal drains in-flight jobs within a grace
//! window and exits 0; a second signal aborts immediately.

mod bootstrap;
mod cli;

use clap::Parser;
use cli::Cli;
use core_config::identity::{IDENTITY_FILE_NAME, IdentityOverrides, NodeIdentity, state_dir};
use core_config::logging::init_logging;
use core_config::{Environment, app_info};
use domain_inference::{ModelServerConfig, ModelServerProbe};
use eyre::{Result, WrapErr};
use node_runtime::{
    ConfigSubscriber, GpuTracker, HealthState, Runner, RunnerConfig, RuntimeKnobs,
    StatusPublisher, health_router, metrics,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use usage::{Journal, JournalSink, UsageSyncer};

/// Run the node agent until a termination signal drains it.
pub async fn run() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let environment = Environment::from_env();
    let state_dir = state_dir();

    let log = Arc::new(init_logging(&environment, Some(&state_dir.join("logs")))?);
    metrics::init_metrics();

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting Citadel node agent");
    info!("Environment: {:?}", environment);

    // Identity: stable node id from the persisted file, fresh worker
    // id per process.
    let overrides = IdentityOverrides {
        api_base_url: cli.api_url.clone(),
        redis_url: cli.redis_url.clone(),
        node_name: cli.node_name.clone(),
    };
    let identity = NodeIdentity::resolve(&state_dir.join(IDENTITY_FILE_NAME), &overrides)
        .wrap_err("Failed to resolve node identity")?;
    info!(
        node_id = %identity.node_id,
        node_name = %identity.node_name,
        org_id = %identity.org_id,
        worker_id = %identity.worker_id,
        "Node identity resolved"
    );

    // Fixed for the process lifetime.
    let slots = bootstrap::detect_gpus();
    let gpus = GpuTracker::new(slots);
    let cap = bootstrap::concurrency_cap(cli.concurrency, slots);

    let source_config = node_runtime::SourceConfig::new(
        cli.queue_names(),
        cli.group.clone(),
        identity.worker_id.clone(),
    )
    .with_debug(cli.verbose);

    let (source, transport, backend) =
        bootstrap::open_source(&identity, source_config.clone(), cli.direct).await?;
    info!(
        backend,
        queues = ?source_config.queues,
        group = %source_config.consumer_group,
        "Job source ready"
    );

    let journal = Arc::new(
        Journal::open(&state_dir.join("usage.db"), identity.node_id.clone())
            .wrap_err("Failed to open usage journal")?,
    );

    let model_config = ModelServerConfig::from_env();
    let registry = domain_inference::build_registry(&model_config);

    let (knobs_tx, knobs_rx) = watch::channel(RuntimeKnobs::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner_config = RunnerConfig::new(identity.worker_id.clone())
        .with_max_concurrency(cap)
        .with_max_attempts(source_config.max_attempts)
        .with_claim_interval(Duration::from_millis(source_config.visibility_timeout_ms * 2));
    let runner = Runner::new(
        source,
        registry,
        gpus.clone(),
        knobs_rx.clone(),
        runner_config,
    )
    .with_usage_sink(Arc::new(JournalSink::new(journal.clone())));
    let stats = runner.stats();
    info!(max_concurrency = cap, device_slots = slots, "Runner configured");

    // Health and metrics endpoints.
    let health_state = HealthState::new(
        app_info.name,
        app_info.version,
        identity.node_id.clone(),
        stats.clone(),
        gpus.clone(),
    );
    let health_port = cli.health_port;
    tokio::spawn(async move {
        if let Err(e) = serve_health(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    // Periodic side-tasks, all under the same shutdown signal. Their
    // failures are recovered locally and never stop the runner.
    let status = StatusPublisher::new(
        transport.clone(),
        identity.node_id.clone(),
        identity.org_id.clone(),
        app_info.version,
        stats.clone(),
        gpus.clone(),
        Arc::new(ModelServerProbe::new(model_config.base_url.clone())),
        knobs_rx,
    );
    let status_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move { status.run(status_shutdown).await });

    let config_sub = ConfigSubscriber::new(transport.clone(), identity.node_id.clone(), knobs_tx)
        .with_log_handle(log.clone());
    let config_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move { config_sub.run(config_shutdown).await });

    let syncer = UsageSyncer::new(journal.clone(), transport.clone());
    let syncer_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move { syncer.run(syncer_shutdown).await });

    // First signal drains, second aborts.
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, draining");
        let _ = shutdown_tx.send(true);

        shutdown_signal().await;
        error!("Second termination signal, aborting");
        std::process::exit(1);
    });

    runner
        .run(shutdown_rx)
        .await
        .map_err(|e| eyre::eyre!("{}", e))?;

    info!("Citadel node agent stopped");
    Ok(())
}

/// Serve liveness/readiness probes and Prometheus metrics.
async fn serve_health(state: HealthState, port: u16) -> Result<()> {
    let app = health_router(state);
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");
    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
