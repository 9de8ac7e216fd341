use std::fmt;

/// Errors returned to callers *before* any delivery work happens.
///
/// Consumer-side outcomes are never surfaced through this type; they are
/// reported asynchronously as [`crate::ClientEvent`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No live broker channel.
    /// Operations requiring the broker fail fast rather than queueing silently.
    Connectivity,

    /// A required hook or option is missing.
    Configuration(String),

    /// The broker rejected an operation.
    Broker(BrokerError),

    /// A queued job could not be encoded.
    Codec(String),

    /// Reconnect attempts exhausted the ceiling; the client will not
    /// recover on its own.
    Fatal(String),

    /// The client has been closed.
    Shutdown,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Connectivity =>
                write!(f, "no live broker channel"),
            DispatchError::Configuration(what) =>
                write!(f, "missing configuration: {}", what),
            DispatchError::Broker(err) =>
                write!(f, "broker error: {}", err),
            DispatchError::Codec(err) =>
                write!(f, "job encoding failed: {}", err),
            DispatchError::Fatal(err) =>
                write!(f, "fatal: {}", err),
            DispatchError::Shutdown =>
                write!(f, "client is shut down"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<BrokerError> for DispatchError {
    fn from(err: BrokerError) -> Self {
        DispatchError::Broker(err)
    }
}

/// Broker-level failures. Recoverable through the reconnect state machine
/// up to the attempt ceiling, after which they surface once as
/// [`DispatchError::Fatal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connection establishment failed.
    ConnectFailed(String),

    /// The channel was closed underneath the operation.
    ChannelClosed,

    /// The target queue has not been declared on this channel.
    UnknownQueue(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::ConnectFailed(reason) =>
                write!(f, "connect failed: {}", reason),
            BrokerError::ChannelClosed =>
                write!(f, "channel closed"),
            BrokerError::UnknownQueue(queue) =>
                write!(f, "queue not declared: {}", queue),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Error produced by a [`crate::DeliverySink`].
///
/// The message is expected to be a JSON-encoded object carrying at least
/// an `error_code` field; anything else is treated as a permanent failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryError(pub String);

impl DeliveryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DeliveryError {}

/// Error produced by a [`crate::AudienceSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudienceError(pub String);

impl fmt::Display for AudienceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "audience resolution failed: {}", self.0)
    }
}

impl std::error::Error for AudienceError {}

/// Error produced by a [`crate::ConfigSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config fetch failed: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Classification of a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The provider signalled "too many requests"; the job is requeued
    /// verbatim and retried on a later batch.
    RateLimited,

    /// Anything else; the job is dropped after this one attempt.
    Permanent,
}

/// Classify a delivery error by parsing its message as JSON and looking for
/// `error_code == 429`. Any other shape is a permanent failure.
pub fn classify_delivery_error(err: &DeliveryError) -> FailureKind {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&err.0) else {
        return FailureKind::Permanent;
    };

    let rate_limited = match value.get("error_code") {
        Some(code) => code.as_u64() == Some(429) || code.as_str() == Some("429"),
        None => false,
    };

    if rate_limited {
        FailureKind::RateLimited
    } else {
        FailureKind::Permanent
    }
}
