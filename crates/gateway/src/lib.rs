//! Multi-instance WebSocket messaging gateway.
//!
//! This service:
//! - Accepts WebSocket connections and registers them by user id
//! - Fans each inbound message out to the channel's other members as one
//!   log event per recipient, keyed by recipient
//! - Consumes the full event stream under its own consumer group and writes
//!   events to recipients attached to this instance
//!
//! ## Architecture
//!
//! ```text
//! client ─ws─▶ ws_server ─▶ FanoutPublisher ─▶ EventLog (partitioned)
//!                                                  │
//!                          every instance, own consumer group
//!                                                  ▼
//! client ◀─ws─ Connection ◀─ ConnectionRegistry ◀─ GroupConsumer
//! ```
//!
//! ## Delivery guarantees
//!
//! - Per-recipient order: one partition per recipient key, one task per
//!   partition
//! - Delivery writes are retried a bounded number of times, then the offset
//!   is committed anyway so a dead recipient never stalls its partition
//! - Senders learn about failed publishes through a `Result`/`Failed` NACK

pub mod config;
pub mod consumer;
pub mod error;
pub mod identity;
pub mod membership;
pub mod protocol;
pub mod publisher;
pub mod registry;
pub mod ws_server;

pub use config::{GatewayConfig, LogBackend};
pub use consumer::{ConsumerConfig, Delivery, GroupConsumer, Outcome, RetryHandler};
pub use error::{GatewayError, Result};
pub use membership::{HttpMembership, MembershipResolver, StaticMembership};
pub use protocol::{Event, Message, RecipientId};
pub use publisher::{FanoutPublisher, FanoutReport, PublisherConfig};
pub use registry::{Connection, ConnectionId, ConnectionRegistry};
pub use ws_server::{create_router, AppState, EndpointConfig};
