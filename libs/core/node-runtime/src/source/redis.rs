//! Stream-database source: consumer-group streams over Redis.
//!
//! Each configured queue is a stream consumed through one consumer
//! group. The delivery token encodes the stream entry id plus the
//! queue it came from; ack removes the entry from the group's
//! pending-entries list. Stale entries from dead consumers are
//! reclaimed with XAUTOCLAIM. When several queues are configured the
//! fetch path rotates their order so no queue starves.

use crate::error::SourceError;
use crate::job::{Delivery, DeliveryToken, Job, PartialFrame};
use crate::source::{JobSource, SourceConfig, Transport, output_channel};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Rows kept in each dead-letter stream.
const DLQ_MAX_LENGTH: i64 = 10_000;

pub struct RedisSource {
    /// Kept for pub/sub subscriptions, which need dedicated connections.
    client: Client,
    redis: ConnectionManager,
    config: SourceConfig,
    /// Entries read beyond the one returned by `fetch`. Everything in
    /// here is already in our pending-entries list, so a crash
    /// surfaces them again via the stale-claim path.
    buffer: Mutex<VecDeque<Delivery>>,
    cursor: AtomicUsize,
}

impl RedisSource {
    /// Open the source and make sure every queue's consumer group
    /// exists (streams are created on the fly with MKSTREAM).
    pub async fn open(
        client: Client,
        redis: ConnectionManager,
        config: SourceConfig,
    ) -> Result<Self, SourceError> {
        let source = Self {
            client,
            redis,
            config,
            buffer: Mutex::new(VecDeque::new()),
            cursor: AtomicUsize::new(0),
        };
        source.ensure_consumer_groups().await?;
        Ok(source)
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub async fn ensure_consumer_groups(&self) -> Result<(), SourceError> {
        for queue in &self.config.queues {
            let mut conn = self.redis.clone();
            let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(queue)
                .arg(&self.config.consumer_group)
                .arg("$")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match result {
                Ok(_) => {
                    info!(
                        queue = %queue,
                        group = %self.config.consumer_group,
                        "Created consumer group"
                    );
                }
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!(queue = %queue, "Consumer group already exists");
                }
                Err(e) => return Err(SourceError::ConsumerGroup(e.to_string())),
            }
        }
        Ok(())
    }

    /// Queue names starting at the rotation cursor; advancing the
    /// cursor per fetch is what gives multiplexed queues their
    /// round-robin fairness.
    fn rotated_queues(&self) -> Vec<String> {
        let len = self.config.queues.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len.max(1);
        (0..len)
            .map(|i| self.config.queues[(start + i) % len].clone())
            .collect()
    }

    async fn read_queues(
        &self,
        queues: &[&str],
        block_ms: Option<u64>,
    ) -> Result<Vec<Delivery>, SourceError> {
        let mut conn = self.redis.clone();

        let mut opts = StreamReadOptions::default()
            .group(&self.config.consumer_group, &self.config.consumer_name)
            .count(self.config.batch_size);
        if let Some(ms) = block_ms {
            opts = opts.block(ms as usize);
        }

        let ids = vec![">"; queues.len()];
        let result: Result<StreamReadReply, _> = conn.xread_options(queues, &ids, &opts).await;

        match result {
            Ok(reply) => self.collect_deliveries(reply).await,
            // BLOCK timeout surfaces as an error in some connection
            // layers; treat every timeout shape as "nothing ready".
            Err(e) => {
                let err_str = e.to_string().to_lowercase();
                if err_str.contains("timeout")
                    || err_str.contains("timed out")
                    || err_str.contains("nil")
                {
                    Ok(vec![])
                } else {
                    Err(SourceError::Redis(e))
                }
            }
        }
    }

    /// Turn a read reply into deliveries. Malformed envelopes are
    /// dead-lettered and acked so they never wedge the queue.
    async fn collect_deliveries(
        &self,
        reply: StreamReadReply,
    ) -> Result<Vec<Delivery>, SourceError> {
        let mut deliveries = Vec::new();

        for stream_key in reply.keys {
            let queue = stream_key.key;
            for message in stream_key.ids {
                let raw = message
                    .map
                    .get("job")
                    .and_then(value_to_string)
                    .unwrap_or_default();

                match serde_json::from_str::<Job>(&raw) {
                    Ok(job) => {
                        if self.config.debug {
                            debug!(queue = %queue, job_id = %job.id, entry = %message.id, "Fetched job");
                        }
                        deliveries.push(Delivery {
                            job,
                            token: encode_token(&message.id, &queue),
                        });
                    }
                    Err(e) => {
                        warn!(
                            queue = %queue,
                            entry = %message.id,
                            error = %e,
                            "Malformed job envelope, moving to DLQ"
                        );
                        crate::metrics::record_source_error("protocol");
                        self.dead_letter_raw(&queue, &message.id, &raw).await;
                    }
                }
            }
        }

        Ok(deliveries)
    }

    fn pop_buffered(&self) -> Option<Delivery> {
        self.buffer.lock().expect("buffer mutex poisoned").pop_front()
    }

    fn take_first(&self, mut batch: Vec<Delivery>) -> Option<Delivery> {
        if batch.is_empty() {
            return None;
        }
        let first = batch.remove(0);
        if !batch.is_empty() {
            self.buffer
                .lock()
                .expect("buffer mutex poisoned")
                .extend(batch);
        }
        Some(first)
    }

    async fn dead_letter_job(&self, queue: &str, job: &Job) -> Result<(), SourceError> {
        let mut conn = self.redis.clone();
        let entry = serde_json::json!({
            "job": job,
            "failedAt": chrono::Utc::now().to_rfc3339(),
        });

        let _: String = redis::cmd("XADD")
            .arg(self.config.dlq_stream(queue))
            .arg("MAXLEN")
            .arg("~")
            .arg(DLQ_MAX_LENGTH)
            .arg("*")
            .arg("data")
            .arg(entry.to_string())
            .query_async(&mut conn)
            .await?;

        warn!(
            queue = %queue,
            job_id = %job.id,
            attempts = job.attempts,
            "Job moved to DLQ"
        );
        Ok(())
    }

    /// Dead-letter an unparseable entry and ack it; best effort.
    async fn dead_letter_raw(&self, queue: &str, entry_id: &str, raw: &str) {
        let mut conn = self.redis.clone();
        let entry = serde_json::json!({
            "rawMessage": raw,
            "originalId": entry_id,
            "failedAt": chrono::Utc::now().to_rfc3339(),
        });

        let result: Result<String, _> = redis::cmd("XADD")
            .arg(self.config.dlq_stream(queue))
            .arg("MAXLEN")
            .arg("~")
            .arg(DLQ_MAX_LENGTH)
            .arg("*")
            .arg("data")
            .arg(entry.to_string())
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to dead-letter raw entry");
        }

        let ack: Result<(), _> = conn
            .xack(queue, &self.config.consumer_group, &[entry_id])
            .await;
        if let Err(e) = ack {
            warn!(error = %e, entry = %entry_id, "Failed to ack raw entry");
        }
    }
}

#[async_trait]
impl JobSource for RedisSource {
    async fn fetch(&self) -> Result<Option<Delivery>, SourceError> {
        if let Some(delivery) = self.pop_buffered() {
            return Ok(Some(delivery));
        }

        let queues = self.rotated_queues();

        // Non-blocking sweep in rotated order keeps multiplexed
        // queues within round-robin fairness.
        if queues.len() > 1 {
            for queue in &queues {
                let batch = self.read_queues(&[queue.as_str()], None).await?;
                if let Some(delivery) = self.take_first(batch) {
                    return Ok(Some(delivery));
                }
            }
        }

        // Nothing ready: one blocking read across every queue.
        let refs: Vec<&str> = queues.iter().map(String::as_str).collect();
        let batch = self
            .read_queues(&refs, Some(self.config.block_timeout_ms))
            .await?;
        Ok(self.take_first(batch))
    }

    async fn ack(&self, token: &DeliveryToken) -> Result<(), SourceError> {
        let (entry_id, queue) = decode_token(token)?;
        let mut conn = self.redis.clone();

        let _: () = conn
            .xack(queue, &self.config.consumer_group, &[entry_id])
            .await?;

        debug!(entry = %entry_id, queue = %queue, "Acknowledged delivery");
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, retryable: bool) -> Result<(), SourceError> {
        let (entry_id, queue) = decode_token(&delivery.token)?;
        let job = &delivery.job;

        if retryable && job.attempts < self.config.max_attempts {
            // Re-queue with the delivery count bumped. The entry id
            // changes but the job id stays, so an in-flight duplicate
            // is still suppressed by the runner.
            let mut conn = self.redis.clone();
            let payload = serde_json::to_string(&job.next_attempt())?;
            let _: String = redis::cmd("XADD")
                .arg(queue)
                .arg("*")
                .arg("job")
                .arg(&payload)
                .query_async(&mut conn)
                .await?;

            crate::metrics::record_retry(&job.job_type);
            debug!(job_id = %job.id, attempts = job.attempts + 1, "Re-queued job for retry");
        } else {
            self.dead_letter_job(queue, job).await?;
        }

        let mut conn = self.redis.clone();
        let _: () = conn
            .xack(queue, &self.config.consumer_group, &[entry_id])
            .await?;
        Ok(())
    }

    async fn publish_partial(&self, frame: &PartialFrame) -> Result<(), SourceError> {
        let mut conn = self.redis.clone();
        let payload = serde_json::to_string(frame)?;
        let _: () = conn.publish(output_channel(&frame.job_id), payload).await?;
        Ok(())
    }

    async fn claim_stale(&self) -> Result<Vec<Delivery>, SourceError> {
        let mut claimed = Vec::new();

        for queue in &self.config.queues {
            let mut conn = self.redis.clone();
            let result: redis::Value = redis::cmd("XAUTOCLAIM")
                .arg(queue)
                .arg(&self.config.consumer_group)
                .arg(&self.config.consumer_name)
                .arg(self.config.visibility_timeout_ms)
                .arg("0-0")
                .arg("COUNT")
                .arg(self.config.batch_size)
                .query_async(&mut conn)
                .await
                .unwrap_or(redis::Value::Nil);

            for (entry_id, fields) in parse_autoclaim(&result) {
                let raw = fields.get("job").cloned().unwrap_or_default();
                match serde_json::from_str::<Job>(&raw) {
                    Ok(job) => claimed.push(Delivery {
                        job,
                        token: encode_token(&entry_id, queue),
                    }),
                    Err(e) => {
                        warn!(entry = %entry_id, error = %e, "Reclaimed entry is malformed");
                        self.dead_letter_raw(queue, &entry_id, &raw).await;
                    }
                }
            }
        }

        if !claimed.is_empty() {
            info!(
                count = claimed.len(),
                consumer = %self.config.consumer_name,
                "Reclaimed stale deliveries"
            );
        }
        Ok(claimed)
    }

    async fn recover(&self, error: &SourceError) -> Result<(), SourceError> {
        if error.is_nogroup_error() {
            warn!("Consumer group missing, recreating");
            self.ensure_consumer_groups().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for RedisSource {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), SourceError> {
        let mut conn = self.redis.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &[u8]) -> Result<(), SourceError> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg("data")
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>, SourceError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(64);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                if tx.send(msg.get_payload_bytes().to_vec()).await.is_err() {
                    break;
                }
            }
            debug!(channel = %channel, "Pub/sub subscription ended");
        });
        Ok(rx)
    }
}

/// The token is `{entry_id}@{queue}`; entry ids never contain '@'.
fn encode_token(entry_id: &str, queue: &str) -> DeliveryToken {
    DeliveryToken(format!("{entry_id}@{queue}"))
}

fn decode_token(token: &DeliveryToken) -> Result<(&str, &str), SourceError> {
    token
        .0
        .split_once('@')
        .ok_or_else(|| SourceError::Protocol(format!("bad delivery token '{}'", token.0)))
}

fn value_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse an XAUTOCLAIM reply:
/// `[next-cursor, [[entry-id, [field, value, ...]], ...], [deleted]]`.
fn parse_autoclaim(value: &redis::Value) -> Vec<(String, std::collections::HashMap<String, String>)> {
    let mut entries = Vec::new();

    let redis::Value::Array(reply) = value else {
        return entries;
    };
    let Some(redis::Value::Array(messages)) = reply.get(1) else {
        return entries;
    };

    for message in messages {
        let redis::Value::Array(parts) = message else {
            continue;
        };
        let (Some(id_value), Some(redis::Value::Array(kvs))) = (parts.first(), parts.get(1)) else {
            continue;
        };
        let Some(entry_id) = value_to_string(id_value) else {
            continue;
        };

        let mut fields = std::collections::HashMap::new();
        for pair in kvs.chunks(2) {
            if let [k, v] = pair {
                if let (Some(key), Some(val)) = (value_to_string(k), value_to_string(v)) {
                    fields.insert(key, val);
                }
            }
        }
        entries.push((entry_id, fields));
    }

    entries
}
