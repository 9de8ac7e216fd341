//! Queue self-healing and broadcast completion.
//!
//! A fixed-interval poll that only acts while connected: it restarts a
//! stopped consumer when messages are pending, and reports broadcasts as
//! complete once the queue has fully drained. Reconnection itself already
//! restarts the consumer, so nothing happens while disconnected.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::connection::ConnectionManager;
use crate::consumer::BatchConsumer;
use crate::events::{ClientEvent, EventBus};
use crate::producer::BroadcastRegistry;
use crate::queue::JobQueue;
use crate::types::{now_ms, BroadcastStatus, ConnectionState};

pub struct QueueMonitor {
    connection: ConnectionManager,
    queue: Arc<JobQueue>,
    consumer: Arc<BatchConsumer>,
    registry: BroadcastRegistry,
    events: EventBus,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QueueMonitor {
    pub fn new(
        connection: ConnectionManager,
        queue: Arc<JobQueue>,
        consumer: Arc<BatchConsumer>,
        registry: BroadcastRegistry,
        events: EventBus,
        interval: Duration,
    ) -> Self {
        Self {
            connection,
            queue,
            consumer,
            registry,
            events,
            interval,
            task: Mutex::new(None),
        }
    }

    /// Spawn the polling task. No-op when already running.
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock().await;
        if slot.is_some() {
            return;
        }

        let monitor = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first interval tick completes immediately; skip it so the
            // initial poll happens one full period after start
            tick.tick().await;

            loop {
                tick.tick().await;
                monitor.poll_once().await;
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }

    async fn poll_once(&self) {
        if self.connection.state() != ConnectionState::Connected {
            return;
        }

        let depth = match self.queue.depth().await {
            Ok(depth) => depth,
            Err(err) => {
                self.events.emit(ClientEvent::Error(format!(
                    "queue depth check failed: {}",
                    err
                )));
                return;
            }
        };

        if !self.consumer.is_active() && depth > 0 {
            self.events.emit(ClientEvent::ConsumerRestarted { depth });
            self.consumer.stop().await;
            if let Err(err) = self.consumer.start().await {
                self.events.emit(ClientEvent::Error(format!(
                    "consumer restart failed: {}",
                    err
                )));
            }
            return;
        }

        if depth == 0 {
            self.complete_broadcasts().await;
        }
    }

    /// With the queue drained, every registered broadcast has been worked
    /// off; report and forget them.
    async fn complete_broadcasts(&self) {
        let completed: Vec<_> = self.registry.lock().await.drain().collect();
        for (_, record) in completed {
            self.events.emit(ClientEvent::EndBroadcast(BroadcastStatus {
                id: record.id,
                created_at_ms: record.created_at_ms,
                completed_at_ms: now_ms(),
            }));
        }
    }
}
