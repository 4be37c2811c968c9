//! Partitioned append-only log used as the transport between gateway instances.
//!
//! The log supports two operations:
//! - keyed publish: records with the same key always land in the same partition
//! - consumer-group subscribe: every group gets its own cursor per partition and
//!   commits offsets explicitly after handling a record
//!
//! ## Backends
//!
//! ```text
//! MemoryLog   in-process, for single-instance runs and tests
//! NatsLog     JetStream stream, subject per partition, durable consumer
//!             per (group, partition)
//! ```

pub mod memory;
pub mod nats;
pub mod partitioner;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub use memory::{MemoryLog, DEFAULT_PARTITIONS};
pub use nats::{NatsLog, NatsLogConfig};
pub use partitioner::{murmur2, partition_for_key};

/// A record handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Topic the record was published to.
    pub topic: String,
    /// Partition within the topic.
    pub partition: u32,
    /// Position within the partition.
    pub offset: u64,
    /// Partition key, when the backend preserves it.
    pub key: Option<String>,
    /// Raw payload.
    pub payload: Bytes,
}

/// A keyed, partitioned log shared by all gateway instances.
#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    /// Append `payload` to `topic`, routed to a partition by `key`.
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()>;

    /// Join consumer group `group` on `topic`.
    ///
    /// Returns one claim per partition. Each claim is meant to be driven by a
    /// single task so records of a partition are handled in order.
    async fn subscribe(&self, group: &str, topic: &str) -> Result<Vec<Box<dyn PartitionClaim>>>;
}

/// An ordered stream of records from one partition for one consumer group.
#[async_trait]
pub trait PartitionClaim: Send + 'static {
    /// Partition this claim reads from.
    fn partition(&self) -> u32;

    /// Wait for the next record. `None` means the claim has ended.
    async fn next(&mut self) -> Option<Result<Record>>;

    /// Mark `record` as handled so the group does not see it again.
    async fn commit(&mut self, record: &Record) -> Result<()>;
}
