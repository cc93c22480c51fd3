//! The runner: drains the job source, admits work onto device slots,
//! dispatches to handlers, and publishes terminal outcomes.
//!
//! One driver task owns fetch/dispatch; each admitted job runs in its
//! own worker task inside a `JoinSet`. Redeliveries of an id that is
//! already in flight are acked immediately without touching a
//! handler. Terminal publication (ack or nack plus the usage record)
//! happens exactly once per delivery, protected by a per-job latch.

use crate::error::{HandlerError, RunnerError};
use crate::gpu::{GpuLease, GpuTracker};
use crate::job::Delivery;
use crate::registry::{HandlerOutput, HandlerRegistry};
use crate::source::JobSource;
use crate::stream::StreamWriter;
use crate::usage::{JobStatus, UsageRecord, UsageSink};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Resolves when the shutdown flag flips (or its sender disappears,
/// which we treat the same way).
pub async fn shutdown_signalled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Knobs the control plane may replace at runtime via the config
/// subscriber. `None` keeps the startup value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeKnobs {
    pub max_concurrency: Option<usize>,
    pub status_interval: Option<Duration>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Consumer name, for logs.
    pub worker_id: String,
    /// Concurrency cap P; bounded further by the device tracker.
    pub max_concurrency: usize,
    /// Attempts ceiling (0-indexed): a transient failure is nacked
    /// retryable while `attempts < max_attempts`. The source applies
    /// the same bound, so keep both settings aligned.
    pub max_attempts: u32,
    /// How long the drain may take after shutdown before remaining
    /// tasks are abandoned.
    pub drain_grace: Duration,
    /// Wind-down budget a cancelled handler gets.
    pub cancel_budget: Duration,
    /// Deadline for the best-effort nack of a cancelled job.
    pub nack_deadline: Duration,
    /// Cadence of the stale-delivery reclaim pass.
    pub claim_interval: Duration,
    /// Attach a stream writer to every job.
    pub emit_partials: bool,
}

impl RunnerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            max_concurrency: 1,
            max_attempts: 3,
            drain_grace: Duration::from_secs(30),
            cancel_budget: Duration::from_secs(30),
            nack_deadline: Duration::from_secs(5),
            claim_interval: Duration::from_secs(60),
            emit_partials: true,
        }
    }

    pub fn with_max_concurrency(mut self, cap: usize) -> Self {
        self.max_concurrency = cap.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn with_cancel_budget(mut self, budget: Duration) -> Self {
        self.cancel_budget = budget;
        self
    }

    pub fn with_claim_interval(mut self, interval: Duration) -> Self {
        self.claim_interval = interval;
        self
    }

    pub fn with_partials(mut self, emit: bool) -> Self {
        self.emit_partials = emit;
        self
    }
}

/// Shared gauges, read by the status publisher and health endpoints.
#[derive(Debug, Default)]
pub struct RunnerStats {
    pub in_flight: AtomicUsize,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub duplicates: AtomicU64,
}

impl RunnerStats {
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

pub struct Runner {
    source: Arc<dyn JobSource>,
    registry: Arc<HandlerRegistry>,
    gpus: Arc<GpuTracker>,
    usage: Option<Arc<dyn UsageSink>>,
    stats: Arc<RunnerStats>,
    knobs: watch::Receiver<RuntimeKnobs>,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(
        source: Arc<dyn JobSource>,
        registry: HandlerRegistry,
        gpus: Arc<GpuTracker>,
        knobs: watch::Receiver<RuntimeKnobs>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            source,
            registry: Arc::new(registry),
            gpus,
            usage: None,
            stats: Arc::new(RunnerStats::default()),
            knobs,
            config,
        }
    }

    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage = Some(sink);
        self
    }

    pub fn stats(&self) -> Arc<RunnerStats> {
        Arc::clone(&self.stats)
    }

    fn effective_cap(&self) -> usize {
        self.knobs
            .borrow()
            .max_concurrency
            .unwrap_or(self.config.max_concurrency)
            .max(1)
    }

    /// Run until the shutdown flag flips, then drain in-flight work
    /// within the grace window.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RunnerError> {
        info!(
            worker_id = %self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            device_slots = self.gpus.total_slots(),
            handlers = ?self.registry.job_types(),
            "Starting runner"
        );

        let mut join_set: JoinSet<()> = JoinSet::new();
        let in_flight_ids: Arc<Mutex<HashSet<String>>> = Arc::default();
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<RunnerError>(1);
        let mut last_claim = Instant::now();
        let mut consecutive_errors: u32 = 0;
        let mut fatal: Option<RunnerError> = None;
        const MAX_BACKOFF_SECS: u64 = 30;

        loop {
            if *shutdown.borrow() {
                info!("Shutdown signalled, stopping fetch loop");
                break;
            }
            if let Ok(f) = fatal_rx.try_recv() {
                fatal = Some(f);
                break;
            }

            while join_set.try_join_next().is_some() {}

            // At the cap: wait for a slot to open rather than fetch.
            if join_set.len() >= self.effective_cap() {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = join_set.join_next() => {}
                    Some(f) = fatal_rx.recv() => { fatal = Some(f); break; }
                }
                continue;
            }

            // Periodically reclaim deliveries abandoned by dead
            // consumers, and run them through the same admission path.
            if last_claim.elapsed() >= self.config.claim_interval {
                last_claim = Instant::now();
                match self.source.claim_stale().await {
                    Ok(reclaimed) => {
                        for delivery in reclaimed {
                            if join_set.len() >= self.effective_cap() {
                                // Stays in our pending list; a later
                                // claim pass picks it up again.
                                debug!(job_id = %delivery.job.id, "Reclaimed delivery deferred, at cap");
                                continue;
                            }
                            self.admit(delivery, &mut join_set, &in_flight_ids, &fatal_tx, &shutdown)
                                .await;
                        }
                    }
                    Err(e) => debug!(error = %e, "Stale-claim pass failed"),
                }
            }

            let fetched = tokio::select! {
                _ = shutdown.changed() => continue,
                Some(f) = fatal_rx.recv() => { fatal = Some(f); break; }
                result = self.source.fetch() => result,
            };

            match fetched {
                Ok(Some(delivery)) => {
                    consecutive_errors = 0;
                    self.admit(delivery, &mut join_set, &in_flight_ids, &fatal_tx, &shutdown)
                        .await;
                }
                Ok(None) => {
                    consecutive_errors = 0;
                }
                Err(e) if e.is_block_timeout() => continue,
                Err(e) => {
                    consecutive_errors += 1;
                    crate::metrics::record_source_error(if e.is_connection_error() {
                        "connection"
                    } else {
                        "fetch"
                    });

                    if let Err(recover_err) = self.source.recover(&e).await {
                        debug!(error = %recover_err, "Source recovery failed");
                    }

                    let backoff_secs =
                        std::cmp::min(2u64.pow(consecutive_errors.min(5)), MAX_BACKOFF_SECS);
                    warn!(
                        error = %e,
                        consecutive_errors,
                        backoff_secs,
                        "Fetch failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                }
            }
        }

        self.drain(join_set).await;

        match fatal {
            Some(f) => {
                error!(error = %f, "Runner stopping on fatal error");
                Err(f)
            }
            None => {
                info!("Runner stopped");
                Ok(())
            }
        }
    }

    /// Suppress duplicates, lease a device slot, spawn the worker.
    async fn admit(
        &self,
        delivery: Delivery,
        join_set: &mut JoinSet<()>,
        in_flight_ids: &Arc<Mutex<HashSet<String>>>,
        fatal_tx: &mpsc::Sender<RunnerError>,
        shutdown: &watch::Receiver<bool>,
    ) {
        let job_id = delivery.job.id.clone();

        // A redelivery of an id already in flight is the same logical
        // job; ack it so it is not parallelized.
        let inserted = in_flight_ids
            .lock()
            .expect("in-flight mutex poisoned")
            .insert(job_id.clone());
        if !inserted {
            self.stats.duplicates.fetch_add(1, Ordering::SeqCst);
            crate::metrics::record_job_processed(&delivery.job.job_type, "duplicate");
            debug!(job_id = %job_id, "Duplicate delivery for in-flight job, acking");
            if let Err(e) = self.source.ack(&delivery.token).await {
                warn!(job_id = %job_id, error = %e, "Failed to ack duplicate delivery");
            }
            return;
        }

        let lease = tokio::select! {
            _ = shutdown_signalled(shutdown.clone()) => {
                // Shutting down before admission: hand the job back.
                in_flight_ids
                    .lock()
                    .expect("in-flight mutex poisoned")
                    .remove(&job_id);
                let _ = timeout(
                    self.config.nack_deadline,
                    self.source.nack(&delivery, true),
                )
                .await;
                return;
            }
            lease = self.gpus.acquire(&job_id) => match lease {
                Ok(lease) => lease,
                Err(e) => {
                    in_flight_ids
                        .lock()
                        .expect("in-flight mutex poisoned")
                        .remove(&job_id);
                    let _ = fatal_tx.try_send(e);
                    return;
                }
            },
        };

        let in_flight = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::set_in_flight_jobs(in_flight as f64);

        let ctx = WorkerCtx {
            source: Arc::clone(&self.source),
            registry: Arc::clone(&self.registry),
            usage: self.usage.clone(),
            stats: Arc::clone(&self.stats),
            in_flight_ids: Arc::clone(in_flight_ids),
            fatal: fatal_tx.clone(),
            config: self.config.clone(),
        };
        join_set.spawn(run_job(ctx, delivery, lease, shutdown.clone()));
    }

    async fn drain(&self, mut join_set: JoinSet<()>) {
        if join_set.is_empty() {
            return;
        }

        info!(in_flight = join_set.len(), "Draining in-flight jobs");
        let drained = timeout(self.config.drain_grace, async {
            while join_set.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            error!(
                abandoned = join_set.len(),
                "Drain grace expired, abandoning remaining tasks"
            );
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }

        let leaked = self.gpus.leased();
        if leaked > 0 {
            error!(leaked_slots = leaked, "Device slots still leased after drain");
        } else {
            info!("Drain complete, all device slots returned");
        }
    }
}

struct WorkerCtx {
    source: Arc<dyn JobSource>,
    registry: Arc<HandlerRegistry>,
    usage: Option<Arc<dyn UsageSink>>,
    stats: Arc<RunnerStats>,
    in_flight_ids: Arc<Mutex<HashSet<String>>>,
    fatal: mpsc::Sender<RunnerError>,
    config: RunnerConfig,
}

/// Removes the job id from the in-flight set and keeps the gauge
/// honest on every exit path, including panics and aborts.
struct FlightGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    stats: Arc<RunnerStats>,
    job_id: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.remove(&self.job_id);
        }
        let in_flight = self.stats.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        crate::metrics::set_in_flight_jobs(in_flight as f64);
    }
}

enum TerminalAction {
    Ack,
    Nack { retryable: bool },
}

async fn run_job(
    ctx: WorkerCtx,
    delivery: Delivery,
    lease: GpuLease,
    shutdown: watch::Receiver<bool>,
) {
    let _flight = FlightGuard {
        ids: Arc::clone(&ctx.in_flight_ids),
        stats: Arc::clone(&ctx.stats),
        job_id: delivery.job.id.clone(),
    };
    let _lease = lease;
    let job = &delivery.job;
    let started_at = Utc::now();
    let started = Instant::now();
    // Terminal latch: ack/nack and the usage record go out exactly
    // once per delivery, whatever path the worker exits through.
    let mut latch = false;

    let Some(handler) = ctx.registry.resolve(&job.job_type) else {
        warn!(job_id = %job.id, job_type = %job.job_type, "No handler for job type");
        publish_terminal(
            &ctx,
            &delivery,
            &mut latch,
            TerminalAction::Nack { retryable: false },
        )
        .await;
        emit_usage(&ctx, &delivery, JobStatus::Failure, started_at, None).await;
        ctx.stats.failed.fetch_add(1, Ordering::SeqCst);
        crate::metrics::record_job_processed(&job.job_type, "failure");
        return;
    };

    let writer = ctx
        .config
        .emit_partials
        .then(|| StreamWriter::new(Arc::clone(&ctx.source), job.id.clone()));

    debug!(
        job_id = %job.id,
        job_type = %job.job_type,
        handler = handler.name(),
        slot = ?_lease.slot,
        attempts = job.attempts,
        "Job admitted"
    );

    let fut = handler.execute(job, writer.as_ref(), shutdown.clone());
    tokio::pin!(fut);

    let mut interrupted = false;
    let result = tokio::select! {
        result = &mut fut => Some(result),
        _ = shutdown_signalled(shutdown.clone()) => {
            interrupted = true;
            // Bounded wind-down budget after cancellation.
            match timeout(ctx.config.cancel_budget, &mut fut).await {
                Ok(result) => Some(result),
                Err(_) => None,
            }
        }
    };

    let elapsed = started.elapsed();
    match result {
        // Completed (possibly within the cancellation budget).
        Some(Ok(output)) => {
            if let Some(w) = &writer {
                if let Err(e) = w.close(JobStatus::Success).await {
                    warn!(job_id = %job.id, error = %e, "Failed to close output stream");
                }
            }
            publish_terminal(&ctx, &delivery, &mut latch, TerminalAction::Ack).await;
            emit_usage(&ctx, &delivery, JobStatus::Success, started_at, Some(output)).await;
            ctx.stats.completed.fetch_add(1, Ordering::SeqCst);
            crate::metrics::record_job_processed(&job.job_type, "success");
            crate::metrics::record_job_duration(&job.job_type, elapsed);
            debug!(job_id = %job.id, elapsed_ms = elapsed.as_millis() as u64, "Job succeeded");
        }

        // Failed while the node is shutting down: give it back.
        Some(Err(e)) if interrupted => {
            warn!(job_id = %job.id, error = %e, "Job interrupted by shutdown");
            if let Some(w) = &writer {
                let _ = w.close(JobStatus::Cancelled).await;
            }
            publish_cancelled(&ctx, &delivery, &mut latch).await;
            emit_usage(&ctx, &delivery, JobStatus::Cancelled, started_at, None).await;
        }

        Some(Err(HandlerError::Terminal(reason))) => {
            warn!(job_id = %job.id, reason = %reason, "Job failed terminally");
            if let Some(w) = &writer {
                let _ = w.close(JobStatus::Failure).await;
            }
            publish_terminal(
                &ctx,
                &delivery,
                &mut latch,
                TerminalAction::Nack { retryable: false },
            )
            .await;
            emit_usage(&ctx, &delivery, JobStatus::Failure, started_at, None).await;
            ctx.stats.failed.fetch_add(1, Ordering::SeqCst);
            crate::metrics::record_job_processed(&job.job_type, "failure");
        }

        Some(Err(HandlerError::Transient(reason))) => {
            // attempts is 0-indexed: redeliver while attempts < max.
            let final_attempt = job.attempts >= ctx.config.max_attempts;
            warn!(
                job_id = %job.id,
                reason = %reason,
                attempts = job.attempts,
                final_attempt,
                "Job failed, eligible for retry"
            );
            if let Some(w) = &writer {
                let _ = w.close(JobStatus::Failure).await;
            }
            // The dispatcher owns the attempts ceiling; a source must
            // be able to trust the flag verbatim.
            publish_terminal(
                &ctx,
                &delivery,
                &mut latch,
                TerminalAction::Nack {
                    retryable: !final_attempt,
                },
            )
            .await;
            // Usage is recorded once per logical job, at the last attempt.
            if final_attempt {
                emit_usage(&ctx, &delivery, JobStatus::Failure, started_at, None).await;
                ctx.stats.failed.fetch_add(1, Ordering::SeqCst);
                crate::metrics::record_job_processed(&job.job_type, "failure");
            }
        }

        // Cancellation budget exceeded: abandon the handler future.
        None => {
            warn!(job_id = %job.id, "Handler exceeded cancellation budget, abandoning");
            if let Some(w) = &writer {
                let _ = w.close(JobStatus::Cancelled).await;
            }
            publish_cancelled(&ctx, &delivery, &mut latch).await;
            emit_usage(&ctx, &delivery, JobStatus::Cancelled, started_at, None).await;
        }
    }
}

async fn publish_terminal(
    ctx: &WorkerCtx,
    delivery: &Delivery,
    latch: &mut bool,
    action: TerminalAction,
) {
    if std::mem::replace(latch, true) {
        debug!(job_id = %delivery.job.id, "Terminal state already published");
        return;
    }

    let result = match action {
        TerminalAction::Ack => ctx.source.ack(&delivery.token).await,
        TerminalAction::Nack { retryable } => ctx.source.nack(delivery, retryable).await,
    };
    if let Err(e) = result {
        error!(job_id = %delivery.job.id, error = %e, "Failed to publish terminal state");
        crate::metrics::record_source_error("terminal");
    }
}

/// Best-effort nack with a short deadline, used on cancellation.
async fn publish_cancelled(ctx: &WorkerCtx, delivery: &Delivery, latch: &mut bool) {
    if std::mem::replace(latch, true) {
        return;
    }

    match timeout(ctx.config.nack_deadline, ctx.source.nack(delivery, true)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(job_id = %delivery.job.id, error = %e, "Cancel nack failed"),
        Err(_) => warn!(job_id = %delivery.job.id, "Cancel nack timed out"),
    }
    ctx.stats.cancelled.fetch_add(1, Ordering::SeqCst);
    crate::metrics::record_job_processed(&delivery.job.job_type, "cancelled");
}

async fn emit_usage(
    ctx: &WorkerCtx,
    delivery: &Delivery,
    status: JobStatus,
    started_at: chrono::DateTime<Utc>,
    output: Option<HandlerOutput>,
) {
    let Some(sink) = &ctx.usage else {
        return;
    };

    let mut record = UsageRecord::new(&delivery.job, status, started_at, Utc::now());
    if let Some(output) = output {
        record = record.with_output(&output);
    }

    if let Err(e) = sink.record(record).await {
        // Journal failures are fatal: usage accounting must not be
        // silently lost.
        error!(job_id = %delivery.job.id, error = %e, "Usage journal write failed");
        let _ = ctx
            .fatal
            .try_send(RunnerError::UsageSink(e.to_string()));
    }
}
