//! Fan-out publisher: one inbound message → one log event per recipient.
//!
//! Events are keyed by recipient id, so every event for a recipient lands in
//! the same partition and is consumed in publish order.

use crate::error::{GatewayError, Result};
use crate::membership::MembershipResolver;
use crate::protocol::{Event, Message, RecipientId};
use bytes::Bytes;
use event_log::EventLog;
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for the fan-out publisher.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Topic events are published to.
    pub topic: String,
    /// Deadline for one `receive` call, resolution and all publishes included.
    pub receive_timeout: Duration,
    /// Publish attempts per recipient (1 = no retry).
    pub publish_attempts: u32,
    /// Delay before the first publish retry; doubles on each further retry.
    pub publish_backoff: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topic: "im_events".to_string(),
            receive_timeout: Duration::from_secs(1),
            publish_attempts: 1,
            publish_backoff: Duration::from_millis(20),
        }
    }
}

/// Outcome of one `receive` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Recipients after excluding the sender.
    pub recipients: usize,
    /// Events accepted by the log.
    pub published: usize,
    /// Events dropped after publish failures.
    pub failed: usize,
}

/// Publishes fan-out events for inbound messages.
pub struct FanoutPublisher {
    log: Arc<dyn EventLog>,
    members: Arc<dyn MembershipResolver>,
    config: PublisherConfig,
}

impl FanoutPublisher {
    /// Create a new publisher.
    pub fn new(
        log: Arc<dyn EventLog>,
        members: Arc<dyn MembershipResolver>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            log,
            members,
            config,
        }
    }

    /// Publish `msg` from `sender` to every other member of its channel.
    ///
    /// Succeeds once recipients are resolved, even if individual publishes
    /// fail; those are logged and counted in the report. Fails if resolution
    /// fails or the deadline expires, in which case remaining publishes are
    /// abandoned.
    pub async fn receive(&self, sender: RecipientId, msg: &Message) -> Result<FanoutReport> {
        let deadline = self.config.receive_timeout;
        tokio::time::timeout(deadline, self.fan_out(sender, msg))
            .await
            .map_err(|_| {
                warn!(
                    "Receive for seq '{}' from {} exceeded {:?}",
                    msg.seq, sender, deadline
                );
                GatewayError::Timeout(deadline)
            })?
    }

    async fn fan_out(&self, sender: RecipientId, msg: &Message) -> Result<FanoutReport> {
        let members = self.members.resolve_recipients(msg.cid).await?;
        let recipients = recipients_excluding(sender, members);

        let mut report = FanoutReport {
            recipients: recipients.len(),
            ..Default::default()
        };

        for receiver in recipients {
            let event = Event {
                receiver,
                msg: msg.clone(),
            };
            let key = event.key();
            let payload = Bytes::from(serde_json::to_vec(&event)?);

            match self.publish_with_retry(&key, payload).await {
                Ok(()) => {
                    report.published += 1;
                    counter!("gateway_events_published_total").increment(1);
                }
                Err(e) => {
                    warn!(
                        "Dropping event for {} (seq '{}', cid {}): {:?}",
                        receiver, msg.seq, msg.cid, e
                    );
                    report.failed += 1;
                    counter!("gateway_publish_errors_total").increment(1);
                }
            }
        }

        debug!(
            "Fan-out of seq '{}' from {}: {} published, {} failed",
            msg.seq, sender, report.published, report.failed
        );
        Ok(report)
    }

    async fn publish_with_retry(&self, key: &str, payload: Bytes) -> anyhow::Result<()> {
        let attempts = self.config.publish_attempts.max(1);
        let mut delay = self.config.publish_backoff;
        let mut attempt = 1;

        loop {
            match self.log.publish(&self.config.topic, key, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!(
                        "Publish for key {} failed (attempt {}/{}): {:?}, retrying in {:?}",
                        key, attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }
}

/// Members minus the sender, duplicates removed, order kept.
pub fn recipients_excluding(sender: RecipientId, members: Vec<RecipientId>) -> Vec<RecipientId> {
    let mut seen = HashSet::new();
    members
        .into_iter()
        .filter(|id| *id != sender && seen.insert(*id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::StaticMembership;
    use async_trait::async_trait;
    use event_log::{MemoryLog, PartitionClaim};
    use std::sync::atomic::{AtomicU32, Ordering};

    const TOPIC: &str = "im_events";

    /// Fails every publish for one key, delegates the rest.
    struct FailingKey {
        inner: MemoryLog,
        key: &'static str,
    }

    #[async_trait]
    impl EventLog for FailingKey {
        async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> anyhow::Result<()> {
            if key == self.key {
                anyhow::bail!("broker unavailable");
            }
            self.inner.publish(topic, key, payload).await
        }

        async fn subscribe(
            &self,
            group: &str,
            topic: &str,
        ) -> anyhow::Result<Vec<Box<dyn PartitionClaim>>> {
            self.inner.subscribe(group, topic).await
        }
    }

    /// Fails the first `failures` publishes.
    struct Flaky {
        inner: MemoryLog,
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventLog for Flaky {
        async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> anyhow::Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                anyhow::bail!("transient");
            }
            self.inner.publish(topic, key, payload).await
        }

        async fn subscribe(
            &self,
            group: &str,
            topic: &str,
        ) -> anyhow::Result<Vec<Box<dyn PartitionClaim>>> {
            self.inner.subscribe(group, topic).await
        }
    }

    struct SlowMembership(Duration);

    #[async_trait]
    impl MembershipResolver for SlowMembership {
        async fn resolve_recipients(&self, _channel_id: i64) -> Result<Vec<RecipientId>> {
            tokio::time::sleep(self.0).await;
            Ok(vec![1, 2])
        }
    }

    struct BrokenMembership;

    #[async_trait]
    impl MembershipResolver for BrokenMembership {
        async fn resolve_recipients(&self, _channel_id: i64) -> Result<Vec<RecipientId>> {
            Err(GatewayError::Membership("roster down".to_string()))
        }
    }

    fn hello() -> Message {
        Message {
            seq: "s1".to_string(),
            kind: "text".to_string(),
            content: "hi".to_string(),
            cid: 42,
            ..Default::default()
        }
    }

    fn decode(log: &MemoryLog) -> Vec<(Option<String>, Event)> {
        log.records(TOPIC)
            .into_iter()
            .map(|r| (r.key, serde_json::from_slice(&r.payload).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn test_one_event_per_recipient() {
        let log = MemoryLog::new(4);
        let members = StaticMembership::default().with_channel(42, vec![1, 2, 3]);
        let publisher = FanoutPublisher::new(
            Arc::new(log.clone()),
            Arc::new(members),
            PublisherConfig::default(),
        );

        let report = publisher.receive(1, &hello()).await.unwrap();
        assert_eq!(
            report,
            FanoutReport {
                recipients: 2,
                published: 2,
                failed: 0
            }
        );

        let mut events = decode(&log);
        events.sort_by_key(|(_, e)| e.receiver);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0.as_deref(), Some("2"));
        assert_eq!(events[1].0.as_deref(), Some("3"));
        for (_, event) in &events {
            assert_eq!(event.msg, hello());
        }
    }

    #[tokio::test]
    async fn test_sender_never_receives_own_event() {
        let log = MemoryLog::new(4);
        let members = StaticMembership::new(vec![5, 1, 5, 6, 1]);
        let publisher = FanoutPublisher::new(
            Arc::new(log.clone()),
            Arc::new(members),
            PublisherConfig::default(),
        );

        publisher.receive(5, &hello()).await.unwrap();
        let receivers: Vec<RecipientId> = decode(&log).into_iter().map(|(_, e)| e.receiver).collect();
        assert!(!receivers.contains(&5));
        assert_eq!(receivers.len(), 2);
    }

    #[tokio::test]
    async fn test_publish_failure_is_skipped() {
        let log = MemoryLog::new(4);
        let failing = FailingKey {
            inner: log.clone(),
            key: "7",
        };
        let members = StaticMembership::new(vec![1, 2, 7]);
        let publisher =
            FanoutPublisher::new(Arc::new(failing), Arc::new(members), PublisherConfig::default());

        let report = publisher.receive(1, &hello()).await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(report.failed, 1);

        let receivers: Vec<RecipientId> = decode(&log).into_iter().map(|(_, e)| e.receiver).collect();
        assert_eq!(receivers, vec![2]);
    }

    #[tokio::test]
    async fn test_publish_retry_recovers_transient_failure() {
        let log = MemoryLog::new(1);
        let flaky = Flaky {
            inner: log.clone(),
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let config = PublisherConfig {
            publish_attempts: 3,
            publish_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let publisher =
            FanoutPublisher::new(Arc::new(flaky), Arc::new(StaticMembership::new(vec![1, 2])), config);

        let report = publisher.receive(1, &hello()).await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(log.records(TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_deadline_aborts_receive() {
        let config = PublisherConfig {
            receive_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let publisher = FanoutPublisher::new(
            Arc::new(MemoryLog::new(1)),
            Arc::new(SlowMembership(Duration::from_millis(500))),
            config,
        );

        let err = publisher.receive(1, &hello()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_resolution_failure_propagates() {
        let log = MemoryLog::new(1);
        let publisher = FanoutPublisher::new(
            Arc::new(log.clone()),
            Arc::new(BrokenMembership),
            PublisherConfig::default(),
        );

        assert!(matches!(
            publisher.receive(1, &hello()).await,
            Err(GatewayError::Membership(_))
        ));
        assert!(log.records(TOPIC).is_empty());
    }

    #[test]
    fn test_recipients_excluding() {
        assert_eq!(recipients_excluding(1, vec![1, 2, 3, 2]), vec![2, 3]);
        assert!(recipients_excluding(1, vec![1]).is_empty());
    }
}
