use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Marker recipient id for a job that targets the full audience.
///
/// A job carrying this id is expanded into per-recipient jobs by the
/// consumer and is never handed to the delivery sink itself.
pub const ALL_RECIPIENTS: &str = "__all__";

/// Broker address used when remote configuration is unavailable.
pub const DEFAULT_BROKER_URL: &str = "amqp://127.0.0.1:5672";

/// Queue name prefix; the tenant API key is appended.
pub const QUEUE_PREFIX: &str = "dispatch.";

/// Provider-agnostic message description. Mapping to a concrete provider
/// payload happens in the delivery sink, outside this crate.
pub type MessagePayload = serde_json::Value;

/// One queued unit of work: a single message for a single recipient, or the
/// deferred fan-out marker.
///
/// Serialized as JSON onto the queue with camelCase field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchJob {
    pub recipient_id: String,
    pub payload: MessagePayload,
    pub enqueued_at: u64,
}

impl DispatchJob {
    pub fn new(recipient_id: impl Into<String>, payload: MessagePayload) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            payload,
            enqueued_at: now_ms(),
        }
    }

    /// Create the deferred fan-out job for a full-audience broadcast.
    pub fn fan_out(payload: MessagePayload) -> Self {
        Self::new(ALL_RECIPIENTS, payload)
    }

    pub fn is_fan_out(&self) -> bool {
        self.recipient_id == ALL_RECIPIENTS
    }
}

/// Target selection for a broadcast request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientSelector {
    /// Every recipient the audience hook currently resolves.
    All,
    /// An explicit list of recipient identifiers.
    List(Vec<String>),
}

/// A broadcast request as accepted by the producer.
#[derive(Debug, Clone)]
pub struct BroadcastRequest {
    pub recipients: RecipientSelector,
    pub payload: MessagePayload,
}

impl BroadcastRequest {
    pub fn to_all(payload: MessagePayload) -> Self {
        Self {
            recipients: RecipientSelector::All,
            payload,
        }
    }

    pub fn to_recipients(recipients: Vec<String>, payload: MessagePayload) -> Self {
        Self {
            recipients: RecipientSelector::List(recipients),
            payload,
        }
    }
}

/// Process-local record of an accepted broadcast.
///
/// Held only to correlate lifecycle events; lost on restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastRecord {
    pub id: String,
    pub created_at_ms: u64,
}

/// Completion report carried by the `EndBroadcast` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastStatus {
    pub id: String,
    pub created_at_ms: u64,
    pub completed_at_ms: u64,
}

/// Connectivity of the broker link. Owned exclusively by the connection
/// manager; everything else reads it to gate operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Client tuning knobs.
///
/// Defaults:
/// - batch size: 20 (doubles as the broker prefetch / concurrency cap)
/// - batch interval: 1s, flush tick: 500ms
/// - reconnect: 1s base, 30s cap, 10 attempts
/// - queue monitor: every 60s
/// - remote config: 3 attempts, 5s apart
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Tenant API key; also selects the queue name.
    pub api_key: String,

    /// Maximum in-flight deliveries per batch window, and the broker
    /// prefetch count.
    pub batch_size: usize,

    /// Minimum spacing between batch flush starts.
    pub batch_interval: Duration,

    /// How often a partially-filled window is flushed.
    pub flush_tick: Duration,

    /// First reconnect delay; doubles per attempt.
    pub reconnect_base: Duration,

    /// Upper bound on the reconnect delay.
    pub reconnect_cap: Duration,

    /// Reconnect attempts before giving up for good.
    pub max_reconnect_attempts: u32,

    /// Queue depth polling interval.
    pub monitor_interval: Duration,

    /// Remote config fetch attempts before falling back to the default
    /// broker address.
    pub config_attempts: u32,

    /// Fixed spacing between remote config fetch attempts.
    pub config_retry_delay: Duration,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            batch_size: 20,
            batch_interval: Duration::from_millis(1000),
            flush_tick: Duration::from_millis(500),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            monitor_interval: Duration::from_secs(60),
            config_attempts: 3,
            config_retry_delay: Duration::from_secs(5),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }

    pub fn with_flush_tick(mut self, tick: Duration) -> Self {
        self.flush_tick = tick;
        self
    }

    pub fn with_reconnect_policy(mut self, base: Duration, cap: Duration, max_attempts: u32) -> Self {
        self.reconnect_base = base;
        self.reconnect_cap = cap;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_config_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.config_attempts = attempts.max(1);
        self.config_retry_delay = delay;
        self
    }

    /// Durable queue name for this tenant.
    pub fn queue_name(&self) -> String {
        format!("{}{}", QUEUE_PREFIX, self.api_key)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
