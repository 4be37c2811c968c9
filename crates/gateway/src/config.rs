//! Process configuration from environment variables.

use crate::consumer::{ConsumerConfig, DEFAULT_DELIVERY_ATTEMPTS};
use crate::error::{GatewayError, Result};
use crate::protocol::RecipientId;
use crate::publisher::PublisherConfig;
use crate::ws_server::EndpointConfig;
use event_log::NatsLogConfig;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Which log transport to run on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogBackend {
    /// NATS JetStream, shared by all instances.
    Nats,
    /// In-process log; only meaningful for a single instance.
    Memory,
}

impl FromStr for LogBackend {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nats" => Ok(LogBackend::Nats),
            "memory" => Ok(LogBackend::Memory),
            other => Err(GatewayError::Config(format!("unknown LOG_BACKEND '{}'", other))),
        }
    }
}

/// Gateway process configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub metrics_port: u16,
    /// Consumer group id; unique per process.
    pub instance_id: String,
    pub log_backend: LogBackend,
    pub nats_url: String,
    pub event_topic: String,
    pub log_partitions: u32,
    pub receive_timeout: Duration,
    pub publish_attempts: u32,
    pub publish_backoff: Duration,
    pub delivery_attempts: u32,
    pub dead_letter_topic: Option<String>,
    pub inbound_queue: usize,
    pub outbound_queue: usize,
    pub ping_interval: Duration,
    pub stale_after: Duration,
    /// Base URL of the membership service; static membership when unset.
    pub members_url: Option<String>,
    pub static_members: Vec<RecipientId>,
}

impl GatewayConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup` (key → value).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            http_port: parse_or(&get, "HTTP_PORT", 8081)?,
            metrics_port: parse_or(&get, "METRICS_PORT", 9091)?,
            instance_id: get("INSTANCE_ID")
                .unwrap_or_else(|| format!("gateway-{}", Uuid::new_v4())),
            log_backend: parse_or(&get, "LOG_BACKEND", LogBackend::Nats)?,
            nats_url: get("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string()),
            event_topic: get("EVENT_TOPIC").unwrap_or_else(|| "im_events".to_string()),
            log_partitions: parse_or(&get, "LOG_PARTITIONS", event_log::DEFAULT_PARTITIONS)?,
            receive_timeout: Duration::from_millis(parse_or(&get, "RECEIVE_TIMEOUT_MS", 1000)?),
            publish_attempts: parse_or(&get, "PUBLISH_ATTEMPTS", 1)?,
            publish_backoff: Duration::from_millis(parse_or(&get, "PUBLISH_BACKOFF_MS", 20)?),
            delivery_attempts: parse_or(&get, "DELIVERY_ATTEMPTS", DEFAULT_DELIVERY_ATTEMPTS)?,
            dead_letter_topic: get("DEAD_LETTER_TOPIC"),
            inbound_queue: parse_or(&get, "INBOUND_QUEUE", 64)?,
            outbound_queue: parse_or(&get, "OUTBOUND_QUEUE", 1000)?,
            ping_interval: Duration::from_secs(parse_or(&get, "PING_INTERVAL_SECS", 30)?),
            stale_after: Duration::from_secs(parse_or(&get, "STALE_AFTER_SECS", 90)?),
            members_url: get("MEMBERS_URL"),
            static_members: match get("STATIC_MEMBERS") {
                Some(raw) => parse_members(&raw)?,
                None => vec![1, 2, 3, 4],
            },
        })
    }

    /// Log the effective configuration.
    pub fn log_summary(&self) {
        info!("Configuration:");
        info!("  INSTANCE_ID: {}", self.instance_id);
        info!("  HTTP_PORT: {}", self.http_port);
        info!("  METRICS_PORT: {}", self.metrics_port);
        info!("  LOG_BACKEND: {:?}", self.log_backend);
        info!("  NATS_URL: {}", self.nats_url);
        info!("  EVENT_TOPIC: {} ({} partitions)", self.event_topic, self.log_partitions);
        info!("  RECEIVE_TIMEOUT: {:?}", self.receive_timeout);
        info!("  DELIVERY_ATTEMPTS: {}", self.delivery_attempts);
        info!("  DEAD_LETTER_TOPIC: {:?}", self.dead_letter_topic);
        info!("  MEMBERS_URL: {:?}", self.members_url);
    }

    pub fn publisher(&self) -> PublisherConfig {
        PublisherConfig {
            topic: self.event_topic.clone(),
            receive_timeout: self.receive_timeout,
            publish_attempts: self.publish_attempts.max(1),
            publish_backoff: self.publish_backoff,
        }
    }

    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            topic: self.event_topic.clone(),
            group: self.instance_id.clone(),
            delivery_attempts: self.delivery_attempts.max(1),
            dead_letter_topic: self.dead_letter_topic.clone(),
        }
    }

    pub fn endpoint(&self) -> EndpointConfig {
        EndpointConfig {
            inbound_queue: self.inbound_queue.max(1),
            outbound_queue: self.outbound_queue.max(1),
            ping_interval: self.ping_interval,
        }
    }

    pub fn nats_log(&self) -> NatsLogConfig {
        NatsLogConfig::default().with_partitions(self.log_partitions)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| GatewayError::Config(format!("{} must be valid: {}", key, e))),
        None => Ok(default),
    }
}

fn parse_members(raw: &str) -> Result<Vec<RecipientId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| GatewayError::Config(format!("invalid member id '{}'", s)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<GatewayConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.http_port, 8081);
        assert_eq!(config.log_backend, LogBackend::Nats);
        assert_eq!(config.event_topic, "im_events");
        assert_eq!(config.receive_timeout, Duration::from_secs(1));
        assert_eq!(config.delivery_attempts, 3);
        assert_eq!(config.publish_attempts, 1);
        assert_eq!(config.static_members, vec![1, 2, 3, 4]);
        assert!(config.instance_id.starts_with("gateway-"));
        assert!(config.dead_letter_topic.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("INSTANCE_ID", "gateway_8082"),
            ("LOG_BACKEND", "memory"),
            ("RECEIVE_TIMEOUT_MS", "250"),
            ("DEAD_LETTER_TOPIC", "im_events_dlq"),
            ("STATIC_MEMBERS", "7, 8,9"),
        ])
        .unwrap();
        assert_eq!(config.instance_id, "gateway_8082");
        assert_eq!(config.log_backend, LogBackend::Memory);
        assert_eq!(config.receive_timeout, Duration::from_millis(250));
        assert_eq!(config.static_members, vec![7, 8, 9]);

        let consumer = config.consumer();
        assert_eq!(consumer.group, "gateway_8082");
        assert_eq!(consumer.dead_letter_topic.as_deref(), Some("im_events_dlq"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            config(&[("HTTP_PORT", "eighty")]),
            Err(GatewayError::Config(_))
        ));
        assert!(matches!(
            config(&[("LOG_BACKEND", "kafka")]),
            Err(GatewayError::Config(_))
        ));
        assert!(matches!(
            config(&[("STATIC_MEMBERS", "1,x")]),
            Err(GatewayError::Config(_))
        ));
    }
}
