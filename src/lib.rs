//! A single-process broadcast dispatch engine.
//!
//! This crate pushes per-recipient messages through a **durable,
//! broker-backed work queue** and drains it with a batched, rate-limit-aware
//! consumer. Callers are shielded from broker volatility (automatic
//! reconnection with exponential backoff) and from provider rate limits
//! (paced batch flushes plus requeue-on-429).
//!
//! ## Guarantees
//! - At-least-once delivery under a healthy connection
//! - Bounded in-flight work (prefetch = batch size)
//! - Explicit, paced batch completion
//! - Automatic recovery up to a reconnect ceiling
//!
//! ## Non-Guarantees
//! - Exactly-once delivery (a crash between delivery and acknowledgement
//!   means a duplicate)
//! - Cross-broker portability
//! - Broadcast history across restarts
//!
//! The broker, the downstream provider, the audience lookup and the remote
//! configuration endpoint are all injected capabilities, so the engine runs
//! unchanged against the bundled [`InMemoryBroker`] in tests.

mod client;
mod config;
mod connection;
mod consumer;
mod error;
mod events;
mod monitor;
mod producer;
mod queue;
mod transport;
mod types;

pub use client::{DispatchClient, DispatchClientBuilder};
pub use config::{ConfigSource, RemoteConfig};
pub use connection::{ConnectSettings, ConnectionManager, ReconnectPolicy};
pub use consumer::{AudienceSource, BatchConsumer, ConsumerSettings, DeliverySink};
pub use error::{
    classify_delivery_error, AudienceError, BrokerError, ConfigError, DeliveryError,
    DispatchError, FailureKind,
};
pub use events::{ClientEvent, EventBus};
pub use monitor::QueueMonitor;
pub use producer::{BroadcastProducer, BroadcastRegistry};
pub use queue::JobQueue;
pub use transport::{Broker, BrokerChannel, BrokerStats, Delivery, InMemoryBroker};
pub use types::{
    BroadcastRecord, BroadcastRequest, BroadcastStatus, ClientConfig, ConnectionState,
    DispatchJob, MessagePayload, RecipientSelector, ALL_RECIPIENTS, DEFAULT_BROKER_URL,
    QUEUE_PREFIX,
};

#[cfg(feature = "http")]
pub use config::HttpConfigSource;
