//! Lifecycle event bus.
//!
//! Consumer-side outcomes are only observable here; producer calls return
//! as soon as jobs are queued. Uses a single `tokio::sync::broadcast`
//! channel; emitting with no subscribers is fine, and slow subscribers that
//! fall behind skip events (`RecvError::Lagged`).

use tokio::sync::broadcast;

use crate::types::BroadcastStatus;

const EVENT_CAPACITY: usize = 1024;

/// Everything the engine reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Broker link established, queue declared.
    Connected,

    /// Broker link lost; reconnection is underway unless the attempt
    /// ceiling was already reached.
    Disconnected,

    /// An operational failure that was absorbed rather than propagated.
    Error(String),

    /// Outcome of a single delivery attempt. Rate-limited attempts emit
    /// [`ClientEvent::RateLimited`] instead.
    MessageSent { recipient_id: String, success: bool },

    /// All jobs for a broadcast have drained from the queue.
    EndBroadcast(BroadcastStatus),

    /// A full-audience job was expanded into `size` per-recipient jobs.
    FanOutExpanded { size: usize },

    /// The monitor found pending work with no active consumer and
    /// restarted consumption.
    ConsumerRestarted { depth: usize },

    /// The provider rejected a delivery with a rate-limit signal; the job
    /// was requeued.
    RateLimited { recipient_id: String },

    /// Remote configuration could not be fetched; the default broker
    /// address is in use.
    ConfigFallback { reason: String },
}

/// Cloneable handle to the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        // send() errors when there are no receivers — not a failure.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
