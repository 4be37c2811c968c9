//! NATS JetStream backed partitioned log.
//!
//! Layout for a topic `t` with `N` partitions:
//! - one stream `T` capturing subjects `t.*`
//! - partition `p` is the subject `t.{p}`
//! - the partition key travels in the `Log-Key` header
//! - consumer group `g` owns one durable pull consumer `g-p{p}` per partition
//!   with explicit ack; committing a record acks it
//!
//! `max_ack_pending = 1` keeps a partition strictly ordered: the next record
//! is not handed out before the previous one is acked.

use crate::partitioner::partition_for_key;
use crate::{EventLog, PartitionClaim, Record};
use anyhow::{anyhow, Result};
use async_nats::jetstream::{self, consumer, stream::Stream};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Header carrying the partition key.
pub const KEY_HEADER: &str = "Log-Key";

/// Default retention period for event streams (1 hour).
pub const DEFAULT_RETENTION_SECS: u64 = 3600;

/// Default max bytes per stream (1GB).
pub const DEFAULT_MAX_BYTES: i64 = 1_073_741_824;

/// Default idle time after which the server deletes a group's consumers.
pub const DEFAULT_INACTIVE_THRESHOLD: Duration = Duration::from_secs(300);

/// Configuration for the JetStream log.
#[derive(Debug, Clone)]
pub struct NatsLogConfig {
    /// Number of partitions per topic.
    pub partitions: u32,
    /// Retention period in seconds.
    pub max_age_secs: u64,
    /// Maximum bytes per stream.
    pub max_bytes: i64,
    /// How long an unacked record stays invisible before redelivery.
    pub ack_wait: Duration,
    /// Idle time after which the server removes a group's consumers, so
    /// groups of instances that never come back do not pile up.
    pub inactive_threshold: Duration,
}

impl Default for NatsLogConfig {
    fn default() -> Self {
        Self {
            partitions: crate::DEFAULT_PARTITIONS,
            max_age_secs: DEFAULT_RETENTION_SECS,
            max_bytes: DEFAULT_MAX_BYTES,
            ack_wait: Duration::from_secs(30),
            inactive_threshold: DEFAULT_INACTIVE_THRESHOLD,
        }
    }
}

impl NatsLogConfig {
    /// Set the partition count.
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    /// Set retention period in seconds.
    pub fn with_retention(mut self, secs: u64) -> Self {
        self.max_age_secs = secs;
        self
    }

    /// Set how long an abandoned group's consumers survive.
    pub fn with_inactive_threshold(mut self, threshold: Duration) -> Self {
        self.inactive_threshold = threshold;
        self
    }

    /// Durable pull consumer for one partition of `topic` in `group`.
    pub fn consumer_config(&self, group: &str, topic: &str, partition: u32) -> consumer::pull::Config {
        consumer::pull::Config {
            durable_name: Some(durable_name(group, partition)),
            filter_subject: partition_subject(topic, partition),
            ack_policy: consumer::AckPolicy::Explicit,
            deliver_policy: consumer::DeliverPolicy::New,
            max_ack_pending: 1,
            ack_wait: self.ack_wait,
            inactive_threshold: self.inactive_threshold,
            ..Default::default()
        }
    }
}

/// Stream name for a topic, e.g. `im_events` → `IM_EVENTS`.
pub fn stream_name(topic: &str) -> String {
    topic.to_uppercase().replace(['.', '*', '>', ' '], "_")
}

/// Subject of one partition of a topic.
pub fn partition_subject(topic: &str, partition: u32) -> String {
    format!("{}.{}", topic, partition)
}

fn durable_name(group: &str, partition: u32) -> String {
    format!("{}-p{}", group.replace(['.', '*', '>', ' '], "_"), partition)
}

/// Partitioned log on top of NATS JetStream.
pub struct NatsLog {
    jetstream: jetstream::Context,
    config: NatsLogConfig,
    streams: DashMap<String, Stream>,
}

impl NatsLog {
    /// Connect to a NATS server and create a JetStream context.
    pub async fn connect(url: &str, config: NatsLogConfig) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url).await?;
        let jetstream = jetstream::new(client);

        Ok(Self {
            jetstream,
            config,
            streams: DashMap::new(),
        })
    }

    /// Create or get the stream backing `topic`.
    pub async fn ensure_topic(&self, topic: &str) -> Result<Stream> {
        if let Some(stream) = self.streams.get(topic) {
            return Ok(stream.clone());
        }

        let name = stream_name(topic);
        info!(
            "Ensuring stream '{}' exists (subjects: {}.*, retention: {}s)",
            name, topic, self.config.max_age_secs
        );

        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: name.clone(),
                subjects: vec![format!("{}.*", topic)],
                retention: jetstream::stream::RetentionPolicy::Limits,
                max_bytes: self.config.max_bytes,
                max_age: Duration::from_secs(self.config.max_age_secs),
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await?;

        info!("Stream '{}' ready", name);
        self.streams.insert(topic.to_string(), stream.clone());
        Ok(stream)
    }
}

#[async_trait]
impl EventLog for NatsLog {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        self.ensure_topic(topic).await?;

        let partition = partition_for_key(key.as_bytes(), self.config.partitions);
        let mut headers = HeaderMap::new();
        headers.insert(KEY_HEADER, key);

        self.jetstream
            .publish_with_headers(partition_subject(topic, partition), headers, payload)
            .await?
            .await?;

        debug!("Published to {}.{} (key {})", topic, partition, key);
        Ok(())
    }

    async fn subscribe(&self, group: &str, topic: &str) -> Result<Vec<Box<dyn PartitionClaim>>> {
        let stream = self.ensure_topic(topic).await?;
        let mut claims: Vec<Box<dyn PartitionClaim>> =
            Vec::with_capacity(self.config.partitions as usize);

        for partition in 0..self.config.partitions {
            let durable = durable_name(group, partition);
            let consumer: consumer::PullConsumer = stream
                .get_or_create_consumer(
                    &durable,
                    self.config.consumer_config(group, topic, partition),
                )
                .await?;

            let messages = consumer
                .messages()
                .await?
                .map(|item| item.map_err(anyhow::Error::from))
                .boxed();

            claims.push(Box::new(NatsClaim {
                topic: topic.to_string(),
                partition,
                messages,
                pending: None,
            }));
        }

        info!(
            "Group '{}' joined topic '{}' ({} partitions)",
            group, topic, self.config.partitions
        );
        Ok(claims)
    }
}

struct NatsClaim {
    topic: String,
    partition: u32,
    messages: BoxStream<'static, Result<jetstream::Message>>,
    /// Delivered but not yet acked.
    pending: Option<(u64, jetstream::Message)>,
}

#[async_trait]
impl PartitionClaim for NatsClaim {
    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next(&mut self) -> Option<Result<Record>> {
        let message = match self.messages.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(e)),
        };

        let offset = match message.info() {
            Ok(info) => info.stream_sequence,
            Err(e) => return Some(Err(anyhow!("missing JetStream metadata: {}", e))),
        };
        let key = message
            .headers
            .as_ref()
            .and_then(|h| h.get(KEY_HEADER))
            .map(|v| v.as_str().to_string());

        let record = Record {
            topic: self.topic.clone(),
            partition: self.partition,
            offset,
            key,
            payload: message.payload.clone(),
        };

        if let Some((stale, _)) = self.pending.replace((offset, message)) {
            warn!(
                "Record {}/{}@{} was never committed",
                self.topic, self.partition, stale
            );
        }
        Some(Ok(record))
    }

    async fn commit(&mut self, record: &Record) -> Result<()> {
        match self.pending.take() {
            Some((offset, message)) if offset == record.offset => {
                message.ack().await.map_err(|e| anyhow!("ack failed: {}", e))
            }
            Some(other) => {
                let offset = other.0;
                self.pending = Some(other);
                Err(anyhow!(
                    "commit for {}/{}@{} but {} is pending",
                    self.topic,
                    self.partition,
                    record.offset,
                    offset
                ))
            }
            None => Ok(()),
        }
    }
}
