//! Integration tests for the stream-database source against a real
//! Redis container. Requires Docker; run with `cargo test -- --ignored`.

use node_runtime::source::redis::RedisSource;
use node_runtime::{JobSource, SourceConfig, Transport};
use redis::aio::ConnectionManager;
use test_utils::TestRedis;

async fn open_source(redis: &TestRedis, queues: Vec<String>) -> RedisSource {
    let client = redis::Client::open(redis.connection_string.clone()).unwrap();
    let manager = ConnectionManager::new(client.clone()).await.unwrap();

    let config = SourceConfig::new(queues, "node_workers", "worker-test")
        .with_block_timeout_ms(200)
        .with_max_attempts(3);
    RedisSource::open(client, manager, config).await.unwrap()
}

async fn enqueue(redis: &TestRedis, queue: &str, id: &str, job_type: &str, attempts: u32) {
    let mut conn = redis.connection();
    let envelope = serde_json::json!({
        "id": id,
        "type": job_type,
        "payload": {},
        "attempts": attempts,
    });
    let _: String = redis::cmd("XADD")
        .arg(queue)
        .arg("*")
        .arg("job")
        .arg(envelope.to_string())
        .query_async(&mut conn)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn fetch_then_ack_clears_pending() {
    let redis = TestRedis::new().await;
    let source = open_source(&redis, vec!["itest:jobs".to_string()]).await;

    enqueue(&redis, "itest:jobs", "j1", "echo", 0).await;

    let delivery = source.fetch().await.unwrap().expect("job available");
    assert_eq!(delivery.job.id, "j1");

    source.ack(&delivery.token).await.unwrap();

    // Nothing left to fetch and nothing pending to reclaim.
    assert!(source.fetch().await.unwrap().is_none());
    assert!(source.claim_stale().await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn retryable_nack_requeues_with_bumped_attempts() {
    let redis = TestRedis::new().await;
    let source = open_source(&redis, vec!["itest:retry".to_string()]).await;

    enqueue(&redis, "itest:retry", "j1", "echo", 0).await;
    let first = source.fetch().await.unwrap().unwrap();
    source.nack(&first, true).await.unwrap();

    let second = source.fetch().await.unwrap().expect("redelivery");
    assert_eq!(second.job.id, "j1");
    assert_eq!(second.job.attempts, 1);
    assert_ne!(second.token, first.token);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn exhausted_job_lands_in_dlq() {
    let redis = TestRedis::new().await;
    let source = open_source(&redis, vec!["itest:dlq".to_string()]).await;

    // attempts = 3 with max_attempts = 3: the bound is exhausted, so
    // the next failure is final.
    enqueue(&redis, "itest:dlq", "j1", "echo", 3).await;
    let delivery = source.fetch().await.unwrap().unwrap();
    source.nack(&delivery, true).await.unwrap();

    assert!(source.fetch().await.unwrap().is_none());

    let mut conn = redis.connection();
    let dlq_len: usize = redis::cmd("XLEN")
        .arg("itest:dlq:dlq")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(dlq_len, 1);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn multiplexed_queues_drain_fairly() {
    let redis = TestRedis::new().await;
    let queues = vec!["itest:q1".to_string(), "itest:q2".to_string()];
    let source = open_source(&redis, queues).await;

    for i in 0..20 {
        enqueue(&redis, "itest:q1", &format!("a{i}"), "echo", 0).await;
        enqueue(&redis, "itest:q2", &format!("b{i}"), "echo", 0).await;
    }

    // Drain the first half of the backlog and count per-queue pulls.
    let mut from_q1 = 0usize;
    let mut from_q2 = 0usize;
    for _ in 0..20 {
        let delivery = source.fetch().await.unwrap().expect("backlog remains");
        source.ack(&delivery.token).await.unwrap();
        if delivery.job.id.starts_with('a') {
            from_q1 += 1;
        } else {
            from_q2 += 1;
        }
    }

    // Round-robin rotation keeps both queues served.
    assert!(from_q1 >= 8 && from_q2 >= 8, "unfair: {from_q1} vs {from_q2}");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn transport_append_lands_on_stream() {
    let redis = TestRedis::new().await;
    let source = open_source(&redis, vec!["itest:t".to_string()]).await;

    source
        .append("itest:usage", br#"{"version":"1.0"}"#)
        .await
        .unwrap();

    let mut conn = redis.connection();
    let len: usize = redis::cmd("XLEN")
        .arg("itest:usage")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(len, 1);
}
