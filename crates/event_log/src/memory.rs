//! In-process partitioned log.
//!
//! Every topic is split into a fixed number of partitions. Consumer groups
//! keep a committed offset per (group, topic, partition). A group that has
//! never committed starts at the end of the partition, so it only sees
//! records published after it joined. Records handed out but not committed
//! are redelivered to the next claim of the same group.

use crate::partitioner::partition_for_key;
use crate::{EventLog, PartitionClaim, Record};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Default number of partitions per topic.
pub const DEFAULT_PARTITIONS: u32 = 8;

#[derive(Default)]
struct Partition {
    records: Mutex<Vec<Record>>,
    appended: Notify,
}

impl Partition {
    fn lock(&self) -> Result<MutexGuard<'_, Vec<Record>>> {
        self.records
            .lock()
            .map_err(|_| anyhow!("partition lock poisoned"))
    }

    fn len(&self) -> Result<u64> {
        Ok(self.lock()?.len() as u64)
    }

    fn get(&self, offset: u64) -> Result<Option<Record>> {
        Ok(self.lock()?.get(offset as usize).cloned())
    }
}

struct Topic {
    partitions: Vec<Arc<Partition>>,
}

impl Topic {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1))
                .map(|_| Arc::new(Partition::default()))
                .collect(),
        }
    }
}

type OffsetKey = (String, String, u32);

struct Inner {
    partitions: u32,
    topics: DashMap<String, Arc<Topic>>,
    /// (group, topic, partition) → next offset to consume.
    committed: DashMap<OffsetKey, u64>,
}

/// In-process partitioned log. Cloning shares the same log.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<Inner>,
}

impl MemoryLog {
    /// Create a log whose topics have `partitions` partitions.
    pub fn new(partitions: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                topics: DashMap::new(),
                committed: DashMap::new(),
            }),
        }
    }

    /// Number of partitions per topic.
    pub fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        self.inner
            .topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(self.inner.partitions)))
            .clone()
    }

    /// All records of a topic, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        let topic = self.topic(topic);
        topic
            .partitions
            .iter()
            .flat_map(|p| p.records.lock().map(|r| r.clone()).unwrap_or_default())
            .collect()
    }

    /// Committed offset of a group on one partition, if the group joined it.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.inner
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|o| *o)
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        let t = self.topic(topic);
        let partition = partition_for_key(key.as_bytes(), self.inner.partitions);
        let slot = &t.partitions[partition as usize];

        let offset = {
            let mut records = slot.lock()?;
            let offset = records.len() as u64;
            records.push(Record {
                topic: topic.to_string(),
                partition,
                offset,
                key: Some(key.to_string()),
                payload,
            });
            offset
        };
        slot.appended.notify_waiters();

        debug!(
            "Appended record to {}/{} at offset {} (key {})",
            topic, partition, offset, key
        );
        Ok(())
    }

    async fn subscribe(&self, group: &str, topic: &str) -> Result<Vec<Box<dyn PartitionClaim>>> {
        let t = self.topic(topic);
        let mut claims: Vec<Box<dyn PartitionClaim>> = Vec::with_capacity(t.partitions.len());

        for (index, partition) in t.partitions.iter().enumerate() {
            let index = index as u32;
            let key = (group.to_string(), topic.to_string(), index);
            let committed = self.inner.committed.get(&key).map(|o| *o);
            let start = match committed {
                Some(offset) => offset,
                None => {
                    let latest = partition.len()?;
                    *self.inner.committed.entry(key.clone()).or_insert(latest)
                }
            };

            claims.push(Box::new(MemoryClaim {
                inner: self.inner.clone(),
                partition: partition.clone(),
                index,
                offset_key: key,
                cursor: start,
            }));
        }

        info!(
            "Group '{}' joined topic '{}' ({} partitions)",
            group,
            topic,
            claims.len()
        );
        Ok(claims)
    }
}

struct MemoryClaim {
    inner: Arc<Inner>,
    partition: Arc<Partition>,
    index: u32,
    offset_key: OffsetKey,
    cursor: u64,
}

#[async_trait]
impl PartitionClaim for MemoryClaim {
    fn partition(&self) -> u32 {
        self.index
    }

    async fn next(&mut self) -> Option<Result<Record>> {
        loop {
            // Register interest before checking so an append between the
            // check and the await is not missed.
            let notified = self.partition.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.partition.get(self.cursor) {
                Ok(Some(record)) => {
                    self.cursor += 1;
                    return Some(Ok(record));
                }
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }
            notified.await;
        }
    }

    async fn commit(&mut self, record: &Record) -> Result<()> {
        let mut entry = self.inner.committed.entry(self.offset_key.clone()).or_insert(0);
        if *entry < record.offset + 1 {
            *entry = record.offset + 1;
        }
        Ok(())
    }
}
