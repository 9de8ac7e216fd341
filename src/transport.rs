//! Broker transport boundary.
//!
//! The engine talks to its message broker through the [`Broker`] and
//! [`BrokerChannel`] traits so the wire protocol stays swappable and tests
//! run without a broker process. [`InMemoryBroker`] implements the same
//! contract a durable AMQP-style queue provides: declared queues survive
//! channel loss, deliveries are capped by the consumer prefetch, and
//! unacknowledged messages are requeued when the channel dies.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::error::BrokerError;

/// A message handed to a consumer. `tag` identifies the delivery for
/// acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
}

/// Connection factory for a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a connection and a single channel on it.
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// One live channel on a broker connection.
///
/// The connection manager owns the handle exclusively; producer, consumer
/// and monitor borrow it as a capability and never replace it.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare `queue` as durable. Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Publish a persistent message to `queue`.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError>;

    /// Cap the number of unacknowledged deliveries per consumer.
    /// Zero means unlimited.
    async fn set_prefetch(&self, count: usize) -> Result<(), BrokerError>;

    /// Register a consumer on `queue`; deliveries arrive on the returned
    /// stream until the consumer is cancelled or the channel closes.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError>;

    /// Acknowledge a delivery. Unknown tags are ignored.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Tear down a consumer registration.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Number of messages not yet acknowledged: ready plus delivered.
    async fn queue_depth(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Close the channel gracefully. Unacknowledged deliveries return to
    /// the queue.
    async fn close(&self) -> Result<(), BrokerError>;

    /// Completes with a reason when the broker drops this channel.
    fn on_close(&self) -> broadcast::Receiver<String>;
}

/// Counters kept by [`InMemoryBroker`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connect_attempts: u64,
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub duplicate_acks: u64,
    pub redelivered: u64,
}

struct PendingAck {
    queue: String,
    body: Vec<u8>,
}

struct ConsumerReg {
    tag: String,
    prefetch: usize,
    sender: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Vec<u8>>,
    unacked_count: usize,
    consumer: Option<ConsumerReg>,
}

#[derive(Default)]
struct SharedState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, PendingAck>,
    next_tag: u64,
    stats: BrokerStats,
    last_url: Option<String>,
}

/// Broker that lives entirely in process memory.
///
/// Queues are broker-level state, so messages survive channel loss and
/// reconnection the way a durable queue would. Connect failures and
/// broker-initiated channel drops can be injected for recovery testing.
pub struct InMemoryBroker {
    state: Arc<Mutex<SharedState>>,
    fail_connects: AtomicU32,
    current: Mutex<Option<Arc<InMemoryChannel>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SharedState::default())),
            fail_connects: AtomicU32::new(0),
            current: Mutex::new(None),
        }
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Simulate a broker-initiated close of the live channel.
    pub async fn drop_channel(&self, reason: &str) {
        let channel = self.current.lock().await.take();
        if let Some(channel) = channel {
            channel.shut(Some(reason.to_string())).await;
        }
    }

    pub async fn stats(&self) -> BrokerStats {
        self.state.lock().await.stats.clone()
    }

    /// URL of the most recent successful connect.
    pub async fn last_url(&self) -> Option<String> {
        self.state.lock().await.last_url.clone()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        {
            let mut state = self.state.lock().await;
            state.stats.connect_attempts += 1;
        }

        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::ConnectFailed(format!(
                "injected failure ({} left)",
                remaining - 1
            )));
        }

        let (close_tx, _) = broadcast::channel(4);
        let channel = Arc::new(InMemoryChannel {
            state: self.state.clone(),
            open: AtomicBool::new(true),
            prefetch: AtomicUsize::new(0),
            close_tx,
        });

        self.state.lock().await.last_url = Some(url.to_string());
        *self.current.lock().await = Some(channel.clone());
        Ok(channel)
    }
}

pub struct InMemoryChannel {
    state: Arc<Mutex<SharedState>>,
    open: AtomicBool,
    prefetch: AtomicUsize,
    close_tx: broadcast::Sender<String>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    /// Close the channel; a `Some` reason means broker-initiated and is
    /// reported through `on_close`.
    async fn shut(&self, reason: Option<String>) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut state = self.state.lock().await;
        requeue_all_unacked(&mut state);
        for queue in state.queues.values_mut() {
            queue.consumer = None;
        }
        drop(state);

        if let Some(reason) = reason {
            let _ = self.close_tx.send(reason);
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }

        state
            .queues
            .get_mut(queue)
            .map(|q| q.ready.push_back(body.to_vec()));
        state.stats.published += 1;
        pump(&mut state, queue);
        Ok(())
    }

    async fn set_prefetch(&self, count: usize) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        self.ensure_open()?;
        let prefetch = self.prefetch.load(Ordering::SeqCst);
        let capacity = if prefetch == 0 { 1024 } else { prefetch };
        let (sender, receiver) = mpsc::channel(capacity);

        let mut state = self.state.lock().await;
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        };
        q.consumer = Some(ConsumerReg {
            tag: consumer_tag.to_string(),
            prefetch,
            sender,
        });
        pump(&mut state, queue);
        Ok(receiver)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        match state.unacked.remove(&delivery_tag) {
            Some(pending) => {
                if let Some(q) = state.queues.get_mut(&pending.queue) {
                    q.unacked_count = q.unacked_count.saturating_sub(1);
                }
                state.stats.acked += 1;
                pump(&mut state, &pending.queue);
            }
            None => {
                state.stats.duplicate_acks += 1;
            }
        }
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        for queue in state.queues.values_mut() {
            if queue
                .consumer
                .as_ref()
                .is_some_and(|reg| reg.tag == consumer_tag)
            {
                queue.consumer = None;
            }
        }
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize, BrokerError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        match state.queues.get(queue) {
            Some(q) => Ok(q.ready.len() + q.unacked_count),
            None => Err(BrokerError::UnknownQueue(queue.to_string())),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shut(None).await;
        Ok(())
    }

    fn on_close(&self) -> broadcast::Receiver<String> {
        self.close_tx.subscribe()
    }
}

/// Move ready messages to the consumer while the prefetch window allows.
fn pump(state: &mut SharedState, queue: &str) {
    loop {
        let tag = state.next_tag + 1;

        let sent_body = {
            let Some(q) = state.queues.get_mut(queue) else {
                return;
            };
            let Some(reg) = q.consumer.as_ref() else {
                return;
            };
            if reg.prefetch > 0 && q.unacked_count >= reg.prefetch {
                return;
            }
            let Some(body) = q.ready.pop_front() else {
                return;
            };

            match reg.sender.try_send(Delivery {
                tag,
                body: body.clone(),
            }) {
                Ok(()) => {
                    q.unacked_count += 1;
                    Some(body)
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    q.ready.push_front(body);
                    None
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    q.ready.push_front(body);
                    q.consumer = None;
                    None
                }
            }
        };

        match sent_body {
            Some(body) => {
                state.next_tag = tag;
                state.unacked.insert(
                    tag,
                    PendingAck {
                        queue: queue.to_string(),
                        body,
                    },
                );
                state.stats.delivered += 1;
            }
            None => return,
        }
    }
}

/// Return every unacknowledged delivery to the front of its queue.
fn requeue_all_unacked(state: &mut SharedState) {
    let mut pending: Vec<(u64, PendingAck)> = state.unacked.drain().collect();
    // oldest tag first so redelivery keeps rough order
    pending.sort_by_key(|(tag, _)| *tag);

    for (_, entry) in pending.into_iter().rev() {
        if let Some(q) = state.queues.get_mut(&entry.queue) {
            q.ready.push_front(entry.body);
            q.unacked_count = q.unacked_count.saturating_sub(1);
            state.stats.redelivered += 1;
        }
    }
}
