//! Group consumer: log events → local socket writes.
//!
//! Every instance joins the event topic under its own consumer group, so it
//! sees the full stream and delivers the events whose recipient is attached
//! locally. Events for recipients elsewhere are committed and skipped.
//!
//! ```text
//! partition claim (one task each)
//!         ↓
//! RetryHandler<Event>  decode + up to N delivery attempts
//!         ↓
//! ConnectionRegistry lookup → Connection::send
//!         ↓
//! commit (always, after the handler)
//! ```

use crate::error::{GatewayError, Result};
use crate::protocol::Event;
use crate::registry::ConnectionRegistry;
use event_log::{EventLog, PartitionClaim, Record};
use metrics::counter;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Default delivery attempts per event.
pub const DEFAULT_DELIVERY_ATTEMPTS: u32 = 3;

/// Pause after a failed fetch before polling the partition again.
const FETCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Result of handling one record.
#[derive(Debug)]
pub enum Outcome {
    /// The handler succeeded on attempt `attempts`.
    Handled { attempts: u32 },
    /// Every attempt failed; `error` is the last failure.
    Exhausted { attempts: u32, error: GatewayError },
    /// The payload could not be decoded; never retried.
    Undecodable(serde_json::Error),
}

/// Decodes a record into `T` and runs `handler` with a bounded retry budget.
///
/// No backoff between attempts; the first success stops retrying.
pub struct RetryHandler<T, F> {
    attempts: u32,
    handler: F,
    _event: PhantomData<fn() -> T>,
}

impl<T, F> RetryHandler<T, F>
where
    T: DeserializeOwned,
    F: Fn(&T) -> Result<()>,
{
    /// Create a handler allowing `attempts` tries per record (at least one).
    pub fn new(attempts: u32, handler: F) -> Self {
        Self {
            attempts: attempts.max(1),
            handler,
            _event: PhantomData,
        }
    }

    /// Decode `record` and dispatch it.
    pub fn handle(&self, record: &Record) -> Outcome {
        match serde_json::from_slice::<T>(&record.payload) {
            Ok(event) => self.dispatch(&event),
            Err(e) => Outcome::Undecodable(e),
        }
    }

    /// Run the handler until it succeeds or the budget is spent.
    pub fn dispatch(&self, event: &T) -> Outcome {
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match (self.handler)(event) {
                Ok(()) => return Outcome::Handled { attempts: attempt },
                Err(e) => {
                    debug!("Attempt {}/{} failed: {}", attempt, self.attempts, e);
                    last_error = Some(e);
                }
            }
        }
        Outcome::Exhausted {
            attempts: self.attempts,
            error: last_error
                .unwrap_or_else(|| GatewayError::Internal("no attempt made".to_string())),
        }
    }
}

/// What a delivery attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the recipient's local connection.
    Written,
    /// The recipient is not attached to this instance.
    NotLocal,
}

/// Configuration for the group consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Topic to consume.
    pub topic: String,
    /// Consumer group; the instance id.
    pub group: String,
    /// Delivery attempts per event.
    pub delivery_attempts: u32,
    /// Where exhausted events go, if anywhere.
    pub dead_letter_topic: Option<String>,
}

impl ConsumerConfig {
    /// Config for `group` on `topic` with default attempts and no dead-letter topic.
    pub fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            delivery_attempts: DEFAULT_DELIVERY_ATTEMPTS,
            dead_letter_topic: None,
        }
    }
}

/// Consumes fan-out events and delivers them to local connections.
pub struct GroupConsumer {
    registry: Arc<ConnectionRegistry>,
    log: Arc<dyn EventLog>,
    config: ConsumerConfig,
}

impl GroupConsumer {
    /// Create a new consumer.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        log: Arc<dyn EventLog>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            registry,
            log,
            config,
        }
    }

    /// One delivery attempt.
    ///
    /// A recipient without a local connection is not an error.
    pub fn deliver(&self, event: &Event) -> Result<Delivery> {
        let Some(conn) = self.registry.get(event.receiver) else {
            debug!("Recipient {} not attached here, skipping", event.receiver);
            counter!("gateway_events_not_local_total").increment(1);
            return Ok(Delivery::NotLocal);
        };

        conn.send(&event.msg)?;
        counter!("gateway_events_delivered_total").increment(1);
        Ok(Delivery::Written)
    }

    /// Handle one record. Never fails: whatever happens, the caller commits.
    pub async fn handle_record(&self, record: &Record) -> Outcome {
        let handler = RetryHandler::new(self.config.delivery_attempts, |event: &Event| {
            self.deliver(event).map(|_| ())
        });
        let outcome = handler.handle(record);

        match &outcome {
            Outcome::Handled { .. } => {}
            Outcome::Undecodable(e) => {
                warn!(
                    "Skipping undecodable record {}/{}@{}: {}",
                    record.topic, record.partition, record.offset, e
                );
                counter!("gateway_decode_errors_total").increment(1);
            }
            Outcome::Exhausted { attempts, error } => {
                warn!(
                    "Dropping record {}/{}@{} after {} attempts: {}",
                    record.topic, record.partition, record.offset, attempts, error
                );
                counter!("gateway_delivery_exhausted_total").increment(1);
                self.evict_failed_recipient(record);
                self.dead_letter(record).await;
            }
        }
        outcome
    }

    /// Drop the registry entry of a recipient whose writes kept failing, so
    /// later events are not retried against a dead connection.
    fn evict_failed_recipient(&self, record: &Record) {
        let Some(receiver) = record.key.as_deref().and_then(|k| k.parse().ok()) else {
            return;
        };
        if let Some(conn) = self.registry.remove_closed(receiver) {
            warn!("Evicted connection {} for {} after failed delivery", conn.id, receiver);
        }
    }

    async fn dead_letter(&self, record: &Record) {
        let Some(topic) = &self.config.dead_letter_topic else {
            return;
        };
        let key = record.key.clone().unwrap_or_default();
        match self.log.publish(topic, &key, record.payload.clone()).await {
            Ok(()) => {
                counter!("gateway_dead_letters_total").increment(1);
                debug!("Dead-lettered record {}/{}@{}", record.topic, record.partition, record.offset);
            }
            Err(e) => {
                error!(
                    "Failed to dead-letter record {}/{}@{}: {:?}",
                    record.topic, record.partition, record.offset, e
                );
            }
        }
    }

    /// Join the consumer group, then spawn the consume loop.
    ///
    /// Returns once the group has joined, so events published afterwards are
    /// guaranteed to be seen.
    pub async fn spawn(self: Arc<Self>, shutdown_rx: mpsc::Receiver<()>) -> Result<JoinHandle<()>> {
        let claims = self.subscribe().await?;
        Ok(tokio::spawn(self.serve(claims, shutdown_rx)))
    }

    async fn subscribe(&self) -> Result<Vec<Box<dyn PartitionClaim>>> {
        info!(
            "Starting GroupConsumer, group '{}' on topic '{}'",
            self.config.group, self.config.topic
        );
        Ok(self
            .log
            .subscribe(&self.config.group, &self.config.topic)
            .await?)
    }

    async fn serve(
        self: Arc<Self>,
        claims: Vec<Box<dyn PartitionClaim>>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        for claim in claims {
            tasks.spawn(self.clone().consume_partition(claim, stop_rx.clone()));
        }

        info!("GroupConsumer running ({} partitions)", tasks.len());

        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("GroupConsumer received shutdown signal");
            }
            _ = async { while tasks.join_next().await.is_some() {} } => {
                warn!("All partition consumers ended");
            }
        }

        let _ = stop_tx.send(true);
        while tasks.join_next().await.is_some() {}
        info!("GroupConsumer stopped");
    }

    async fn consume_partition(
        self: Arc<Self>,
        mut claim: Box<dyn PartitionClaim>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let partition = claim.partition();
        debug!("Consuming partition {}", partition);

        loop {
            let next = tokio::select! {
                biased;

                _ = stop_rx.changed() => break,
                next = claim.next() => next,
            };

            match next {
                Some(Ok(record)) => {
                    counter!("gateway_events_consumed_total").increment(1);
                    self.handle_record(&record).await;
                    if let Err(e) = claim.commit(&record).await {
                        warn!(
                            "Failed to commit {}/{}@{}: {:?}",
                            record.topic, record.partition, record.offset, e
                        );
                    }
                }
                Some(Err(e)) => {
                    warn!("Failed to fetch from partition {}: {:?}", partition, e);
                    tokio::time::sleep(FETCH_RETRY_DELAY).await;
                }
                None => {
                    warn!("Partition {} claim ended", partition);
                    break;
                }
            }
        }

        debug!("Partition {} consumer stopped", partition);
    }
}
