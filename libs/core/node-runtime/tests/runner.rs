//! End-to-end runner behavior against an in-memory job source:
//! terminal-state publication, retry routing, duplicate suppression,
//! the concurrency cap, and graceful shutdown.

use async_trait::async_trait;
use node_runtime::{
    Delivery, DeliveryToken, GpuTracker, HandlerError, HandlerOutput, HandlerRegistry, Job,
    JobHandler, JobSource, JobStatus, PartialFrame, Runner, RunnerConfig, RuntimeKnobs,
    SourceError, StreamWriter, UsageRecord, UsageSink, UsageSinkError,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// In-memory source with the same ack/nack/re-queue semantics as the
/// real backends.
#[derive(Default)]
struct MockSource {
    queue: Mutex<VecDeque<Delivery>>,
    acked: Mutex<Vec<String>>,
    nacked: Mutex<Vec<(String, bool)>>,
    frames: Mutex<Vec<PartialFrame>>,
    dead_lettered: Mutex<Vec<String>>,
    token_counter: AtomicU64,
    max_attempts: u32,
}

impl MockSource {
    fn new(max_attempts: u32) -> Arc<Self> {
        Arc::new(Self {
            max_attempts,
            ..Default::default()
        })
    }

    fn push(&self, job: Job) {
        let token = DeliveryToken(format!(
            "{}#{}",
            job.id,
            self.token_counter.fetch_add(1, Ordering::SeqCst)
        ));
        self.queue
            .lock()
            .unwrap()
            .push_back(Delivery { job, token });
    }

    fn acked(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }

    fn nacked(&self) -> Vec<(String, bool)> {
        self.nacked.lock().unwrap().clone()
    }

    fn frames(&self) -> Vec<PartialFrame> {
        self.frames.lock().unwrap().clone()
    }

    fn terminal_count(&self) -> usize {
        self.acked.lock().unwrap().len() + self.nacked.lock().unwrap().len()
    }
}

#[async_trait]
impl JobSource for MockSource {
    async fn fetch(&self) -> Result<Option<Delivery>, SourceError> {
        if let Some(delivery) = self.queue.lock().unwrap().pop_front() {
            return Ok(Some(delivery));
        }
        // Simulate the blocking read returning empty.
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(None)
    }

    async fn ack(&self, token: &DeliveryToken) -> Result<(), SourceError> {
        self.acked.lock().unwrap().push(token.0.clone());
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, retryable: bool) -> Result<(), SourceError> {
        self.nacked
            .lock()
            .unwrap()
            .push((delivery.token.0.clone(), retryable));

        if retryable && delivery.job.attempts < self.max_attempts {
            self.push(delivery.job.next_attempt());
        } else {
            self.dead_lettered
                .lock()
                .unwrap()
                .push(delivery.job.id.clone());
        }
        Ok(())
    }

    async fn publish_partial(&self, frame: &PartialFrame) -> Result<(), SourceError> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }

    async fn claim_stale(&self) -> Result<Vec<Delivery>, SourceError> {
        Ok(vec![])
    }
}

#[derive(Default)]
struct MemorySink {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemorySink {
    fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl UsageSink for MemorySink {
    async fn record(&self, record: UsageRecord) -> Result<(), UsageSinkError> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

/// Writes the payload message back one character per frame.
struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn execute(
        &self,
        job: &Job,
        writer: Option<&StreamWriter>,
        _shutdown: watch::Receiver<bool>,
    ) -> Result<HandlerOutput, HandlerError> {
        let msg = job
            .payload_str("msg")
            .ok_or_else(|| HandlerError::terminal("payload missing 'msg'"))?;

        if let Some(writer) = writer {
            for ch in msg.chars() {
                writer
                    .append(ch.to_string())
                    .await
                    .map_err(|e| HandlerError::transient(e.to_string()))?;
            }
        }

        // A job of any substance takes measurable wall-clock time.
        tokio::time::sleep(Duration::from_millis(5)).await;

        Ok(HandlerOutput {
            backend: Some("echo".to_string()),
            response_bytes: Some(msg.len() as u64),
            ..Default::default()
        })
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

/// Fails with a transient error until the delivery count reaches
/// `succeed_at`.
struct FlakyHandler {
    succeed_at: u32,
    invocations: AtomicUsize,
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn execute(
        &self,
        job: &Job,
        _writer: Option<&StreamWriter>,
        _shutdown: watch::Receiver<bool>,
    ) -> Result<HandlerOutput, HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if job.attempts < self.succeed_at {
            Err(HandlerError::transient("upstream connection reset"))
        } else {
            Ok(HandlerOutput::default())
        }
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

/// Sleeps for a fixed duration, tracking peak concurrency, and winds
/// down promptly when cancelled.
struct SlowHandler {
    duration: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
    invocations: AtomicUsize,
}

impl SlowHandler {
    fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            invocations: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl JobHandler for SlowHandler {
    async fn execute(
        &self,
        _job: &Job,
        _writer: Option<&StreamWriter>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<HandlerOutput, HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = tokio::select! {
            _ = tokio::time::sleep(self.duration) => Ok(HandlerOutput::default()),
            _ = node_runtime::shutdown_signalled(shutdown) => {
                Err(HandlerError::transient("cancelled by shutdown"))
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

struct Harness {
    source: Arc<MockSource>,
    sink: Arc<MemorySink>,
    gpus: Arc<GpuTracker>,
    runner: Arc<Runner>,
    shutdown_tx: watch::Sender<bool>,
    _knobs_tx: watch::Sender<RuntimeKnobs>,
}

impl Harness {
    fn new(
        source: Arc<MockSource>,
        registry: HandlerRegistry,
        slots: usize,
        cap: usize,
        max_attempts: u32,
    ) -> Self {
        let gpus = GpuTracker::new(slots);
        let sink = Arc::new(MemorySink::default());
        let (knobs_tx, knobs_rx) = watch::channel(RuntimeKnobs::default());
        let (shutdown_tx, _) = watch::channel(false);

        let config = RunnerConfig::new("worker-test")
            .with_max_concurrency(cap)
            .with_max_attempts(max_attempts)
            .with_drain_grace(Duration::from_secs(5))
            .with_cancel_budget(Duration::from_secs(2));

        let runner = Runner::new(
            source.clone() as Arc<dyn JobSource>,
            registry,
            gpus.clone(),
            knobs_rx,
            config,
        )
        .with_usage_sink(sink.clone() as Arc<dyn UsageSink>);

        Self {
            source,
            sink,
            gpus,
            runner: Arc::new(runner),
            shutdown_tx,
            _knobs_tx: knobs_tx,
        }
    }

    fn spawn(&self) -> tokio::task::JoinHandle<Result<(), node_runtime::RunnerError>> {
        let runner = self.runner.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move { runner.run(shutdown_rx).await })
    }

    async fn wait_until(&self, deadline: Duration, predicate: impl Fn(&Self) -> bool) {
        let start = Instant::now();
        while !predicate(self) {
            assert!(
                start.elapsed() < deadline,
                "condition not reached within {deadline:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_happy_path_streams_then_acks() {
    let source = MockSource::new(3);
    let mut payload = serde_json::Map::new();
    payload.insert("msg".to_string(), serde_json::json!("hi"));
    source.push(Job::new("j1", "echo").with_payload(payload));

    let registry = HandlerRegistry::new().register("echo", Arc::new(EchoHandler));
    let harness = Harness::new(source, registry, 1, 1, 3);
    let handle = harness.spawn();

    harness
        .wait_until(Duration::from_secs(5), |h| h.source.acked().len() == 1)
        .await;
    harness.shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    // Two partial frames then exactly one terminal, seq contiguous from 0.
    let frames = harness.source.frames();
    assert_eq!(frames.len(), 3);
    assert_eq!(
        frames.iter().map(|f| f.seq).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(frames[0].data, "h");
    assert_eq!(frames[1].data, "i");
    assert!(frames[2].is_final);
    assert_eq!(frames.iter().filter(|f| f.is_final).count(), 1);

    // Exactly one terminal publication, no nack.
    assert_eq!(harness.source.acked().len(), 1);
    assert!(harness.source.nacked().is_empty());

    let records = harness.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, JobStatus::Success);
    assert_eq!(records[0].job_id, "j1");
    assert!(records[0].duration_ms > 0);
    assert_eq!(records[0].response_bytes, Some(2));

    assert_eq!(harness.gpus.leased(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn flaky_job_retries_then_succeeds_with_single_usage_record() {
    let source = MockSource::new(3);
    source.push(Job::new("j-flaky", "flaky"));

    let flaky = Arc::new(FlakyHandler {
        succeed_at: 2,
        invocations: AtomicUsize::new(0),
    });
    let registry = HandlerRegistry::new().register("flaky", flaky.clone());
    let harness = Harness::new(source, registry, 1, 1, 3);
    let handle = harness.spawn();

    harness
        .wait_until(Duration::from_secs(5), |h| h.source.acked().len() == 1)
        .await;
    harness.shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    // Three deliveries: two retryable nacks, then one ack.
    assert_eq!(flaky.invocations.load(Ordering::SeqCst), 3);
    assert_eq!(harness.source.nacked().len(), 2);
    assert!(harness.source.nacked().iter().all(|(_, retryable)| *retryable));
    assert_eq!(harness.source.acked().len(), 1);

    // One SUCCESS record for the whole logical job.
    let records = harness.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, JobStatus::Success);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_job_type_is_terminal_without_handler_invocation() {
    let source = MockSource::new(3);
    source.push(Job::new("j-unknown", "UNKNOWN"));

    let slow = SlowHandler::new(Duration::from_millis(50));
    let registry = HandlerRegistry::new().register("slow", slow.clone());
    let harness = Harness::new(source, registry, 1, 1, 3);
    let handle = harness.spawn();

    harness
        .wait_until(Duration::from_secs(5), |h| !h.source.nacked().is_empty())
        .await;
    harness.shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let nacked = harness.source.nacked();
    assert_eq!(nacked.len(), 1);
    assert!(!nacked[0].1, "unknown type must not be retryable");
    assert!(harness.source.acked().is_empty());
    assert_eq!(slow.invocations.load(Ordering::SeqCst), 0);

    let records = harness.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, JobStatus::Failure);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrency_cap_bounds_in_flight_jobs() {
    let source = MockSource::new(3);
    for i in 0..5 {
        source.push(Job::new(format!("j{i}"), "slow"));
    }

    let job_duration = Duration::from_millis(100);
    let slow = SlowHandler::new(job_duration);
    let registry = HandlerRegistry::new().register("slow", slow.clone());
    let harness = Harness::new(source, registry, 2, 2, 3);

    let started = Instant::now();
    let handle = harness.spawn();
    harness
        .wait_until(Duration::from_secs(10), |h| h.source.acked().len() == 5)
        .await;
    let elapsed = started.elapsed();

    harness.shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(slow.peak.load(Ordering::SeqCst), 2, "cap exceeded");
    assert_eq!(harness.source.acked().len(), 5);
    // ceil(5/2) waves of ~100ms each
    assert!(
        elapsed >= Duration::from_millis(250),
        "finished too fast: {elapsed:?}"
    );
    assert_eq!(harness.gpus.leased(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_cancels_running_jobs_within_grace() {
    let source = MockSource::new(3);
    source.push(Job::new("j-a", "slow"));
    source.push(Job::new("j-b", "slow"));

    let slow = SlowHandler::new(Duration::from_secs(30));
    let registry = HandlerRegistry::new().register("slow", slow.clone());
    let harness = Harness::new(source, registry, 2, 2, 3);
    let handle = harness.spawn();

    harness
        .wait_until(Duration::from_secs(5), |_| {
            slow.running.load(Ordering::SeqCst) == 2
        })
        .await;

    let shutdown_at = Instant::now();
    harness.shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    // Both handlers observed the cancel well inside the grace window.
    assert!(shutdown_at.elapsed() < Duration::from_secs(5));
    assert_eq!(slow.running.load(Ordering::SeqCst), 0);

    // Interrupted jobs are handed back retryable and accounted as
    // cancelled.
    let nacked = harness.source.nacked();
    assert_eq!(nacked.len(), 2);
    assert!(nacked.iter().all(|(_, retryable)| *retryable));

    let records = harness.sink.records();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == JobStatus::Cancelled));

    // No leaked slots after drain.
    assert_eq!(harness.gpus.leased(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_delivery_of_in_flight_id_is_acked_without_execution() {
    let source = MockSource::new(3);
    source.push(Job::new("j-dup", "slow"));
    source.push(Job::new("j-dup", "slow"));

    let slow = SlowHandler::new(Duration::from_millis(300));
    let registry = HandlerRegistry::new().register("slow", slow.clone());
    // Two slots so the duplicate could run in parallel if unsuppressed.
    let harness = Harness::new(source, registry, 2, 2, 3);
    let handle = harness.spawn();

    harness
        .wait_until(Duration::from_secs(5), |h| h.source.acked().len() == 2)
        .await;
    harness.shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    // Both deliveries acked, but only one handler run.
    assert_eq!(harness.source.acked().len(), 2);
    assert_eq!(slow.invocations.load(Ordering::SeqCst), 1);
    assert_eq!(harness.sink.records().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn every_delivery_gets_exactly_one_terminal_publication() {
    let source = MockSource::new(3);
    let mut payload = serde_json::Map::new();
    payload.insert("msg".to_string(), serde_json::json!("x"));
    source.push(Job::new("ok-1", "echo").with_payload(payload));
    source.push(Job::new("bad-1", "UNKNOWN"));
    source.push(Job::new("flaky-1", "flaky"));

    let registry = HandlerRegistry::new()
        .register("echo", Arc::new(EchoHandler))
        .register(
            "flaky",
            Arc::new(FlakyHandler {
                succeed_at: 1,
                invocations: AtomicUsize::new(0),
            }),
        );
    let harness = Harness::new(source, registry, 1, 1, 3);
    let handle = harness.spawn();

    // ok-1 acked; bad-1 nacked terminally; flaky-1 nacked once then acked.
    harness
        .wait_until(Duration::from_secs(5), |h| h.source.terminal_count() == 4)
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(harness.source.acked().len(), 2);
    assert_eq!(harness.source.nacked().len(), 2);

    // No delivery token appears in both lists or twice in either.
    let mut all: Vec<String> = harness.source.acked();
    all.extend(harness.source.nacked().into_iter().map(|(token, _)| token));
    let mut deduped = all.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(all.len(), deduped.len());
}
