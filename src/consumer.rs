//! Batched queue consumer.
//!
//! Drains the tenant queue under the prefetch cap, groups in-flight
//! delivery tasks into a time-boxed batch window, and applies the per-job
//! retry policy: rate-limited jobs are requeued verbatim, anything else is
//! dropped after its single attempt. A full-audience sentinel job is
//! expanded inline, off the delivery-retry path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};

use crate::error::{
    classify_delivery_error, AudienceError, DeliveryError, DispatchError, FailureKind,
};
use crate::events::{ClientEvent, EventBus};
use crate::queue::JobQueue;
use crate::transport::Delivery;
use crate::types::{DispatchJob, MessagePayload};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "tracing")]
fn trace_event(message: &'static str) {
    tracing::info!(message);
}

#[cfg(not(feature = "tracing"))]
fn trace_event(_message: &'static str) {}

/// Hands a message to the downstream provider.
///
/// A rejection whose message is a JSON object with `error_code == 429` is
/// treated as a rate-limit signal; everything else is permanent.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(
        &self,
        recipient_id: &str,
        payload: &MessagePayload,
    ) -> Result<(), DeliveryError>;
}

/// Resolves the full current recipient set for full-audience broadcasts.
#[async_trait]
pub trait AudienceSource: Send + Sync {
    async fn resolve(&self) -> Result<Vec<String>, AudienceError>;
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Batch window capacity; also the broker prefetch count.
    pub batch_size: usize,
    /// Minimum spacing between flush starts.
    pub batch_interval: Duration,
    /// Cadence at which a partially-filled window is flushed.
    pub flush_tick: Duration,
}

/// In-flight delivery tasks awaiting the next synchronized flush.
///
/// Flushes are serialized: a flush never starts sooner than `interval`
/// after the previous one began, which caps the completed-delivery rate
/// independent of broker throughput.
struct BatchWindow {
    tasks: Vec<JoinHandle<()>>,
    capacity: usize,
    interval: Duration,
    last_flush: Option<Instant>,
}

impl BatchWindow {
    fn new(capacity: usize, interval: Duration) -> Self {
        Self {
            tasks: Vec::with_capacity(capacity),
            capacity,
            interval,
            last_flush: None,
        }
    }

    fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn is_full(&self) -> bool {
        self.tasks.len() >= self.capacity
    }

    /// Wait out the pacing gate, then await every task in the window.
    async fn flush(&mut self) {
        if let Some(previous) = self.last_flush {
            sleep_until(previous + self.interval).await;
        }
        self.last_flush = Some(Instant::now());

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    /// Await outstanding tasks without the pacing gate. Shutdown path.
    async fn drain(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

struct ConsumerContext {
    queue: Arc<JobQueue>,
    sink: Arc<dyn DeliverySink>,
    audience: Option<Arc<dyn AudienceSource>>,
    events: EventBus,
}

/// Pulls jobs from the queue and delivers them in paced batches.
pub struct BatchConsumer {
    ctx: Arc<ConsumerContext>,
    settings: ConsumerSettings,
    active: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    consumer_seq: AtomicU64,
}

impl BatchConsumer {
    pub fn new(
        queue: Arc<JobQueue>,
        sink: Arc<dyn DeliverySink>,
        audience: Option<Arc<dyn AudienceSource>>,
        events: EventBus,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            ctx: Arc::new(ConsumerContext {
                queue,
                sink,
                audience,
                events,
            }),
            settings,
            active: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            stop_tx: Mutex::new(None),
            consumer_seq: AtomicU64::new(0),
        }
    }

    /// Register on the queue and start draining. No-op when already
    /// consuming.
    pub async fn start(&self) -> Result<(), DispatchError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let seq = self.consumer_seq.fetch_add(1, Ordering::SeqCst);
        let consumer_tag = format!("batch-consumer-{}", seq);

        let receiver = match self
            .ctx
            .queue
            .consume(self.settings.batch_size, &consumer_tag)
            .await
        {
            Ok(receiver) => receiver,
            Err(err) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock().await = Some(stop_tx);

        let ctx = self.ctx.clone();
        let settings = self.settings.clone();
        let active = self.active.clone();
        let handle = tokio::spawn(async move {
            run_loop(ctx, settings, receiver, stop_rx, consumer_tag).await;
            active.store(false, Ordering::SeqCst);
        });
        *self.task.lock().await = Some(handle);

        trace_event("dispatch.consumer.started");
        Ok(())
    }

    /// Stop consuming: the current batch window drains before the consumer
    /// registration is torn down.
    pub async fn stop(&self) {
        if let Some(stop) = self.stop_tx.lock().await.take() {
            let _ = stop.send(true);
        }

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

async fn run_loop(
    ctx: Arc<ConsumerContext>,
    settings: ConsumerSettings,
    mut receiver: tokio::sync::mpsc::Receiver<Delivery>,
    mut stop_rx: watch::Receiver<bool>,
    consumer_tag: String,
) {
    let mut window = BatchWindow::new(settings.batch_size, settings.batch_interval);
    let mut flush_tick = tokio::time::interval(settings.flush_tick);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,

            _ = flush_tick.tick() => {
                if !window.is_empty() {
                    window.flush().await;
                }
            }

            delivery = receiver.recv() => {
                // a closed stream means the channel died; reconnection
                // starts a fresh consumer
                let Some(delivery) = delivery else { break };
                handle_delivery(&ctx, delivery, &mut window).await;
                if window.is_full() {
                    window.flush().await;
                }
            }
        }
    }

    // drain outstanding tasks first so their acks are not dropped
    window.drain().await;
    let _ = ctx.queue.cancel(&consumer_tag).await;
    trace_event("dispatch.consumer.stopped");
}

async fn handle_delivery(
    ctx: &Arc<ConsumerContext>,
    delivery: Delivery,
    window: &mut BatchWindow,
) {
    let job: DispatchJob = match serde_json::from_slice(&delivery.body) {
        Ok(job) => job,
        Err(err) => {
            ctx.events.emit(ClientEvent::Error(format!(
                "dropping undecodable job: {}",
                err
            )));
            ack_or_report(ctx, delivery.tag).await;
            return;
        }
    };

    if job.is_fan_out() {
        expand_fan_out(ctx, job, delivery.tag).await;
        return;
    }

    let task_ctx = ctx.clone();
    window.push(tokio::spawn(async move {
        deliver_one(&task_ctx, job, delivery).await;
    }));
}

/// Replace a full-audience sentinel with one concrete job per recipient.
///
/// The sentinel is acknowledged as soon as the audience is known; it is
/// replaced, never retried, which keeps resolution off the delivery-retry
/// path.
async fn expand_fan_out(ctx: &ConsumerContext, job: DispatchJob, delivery_tag: u64) {
    let Some(audience) = ctx.audience.as_ref() else {
        // producer validates this; a queued sentinel from an older process
        // configuration can still get here
        ctx.events.emit(ClientEvent::Error(
            "full-audience job but no audience source configured".to_string(),
        ));
        ack_or_report(ctx, delivery_tag).await;
        return;
    };

    let recipients = match audience.resolve().await {
        Ok(recipients) => recipients,
        Err(err) => {
            ctx.events.emit(ClientEvent::Error(err.to_string()));
            ack_or_report(ctx, delivery_tag).await;
            return;
        }
    };

    ack_or_report(ctx, delivery_tag).await;

    let size = recipients.len();
    for recipient_id in recipients {
        let child = DispatchJob::new(recipient_id, job.payload.clone());
        if let Err(err) = ctx.queue.enqueue(&child).await {
            ctx.events.emit(ClientEvent::Error(format!(
                "fan-out enqueue failed: {}",
                err
            )));
        }
    }

    ctx.events.emit(ClientEvent::FanOutExpanded { size });
    metric_inc("dispatch.fan_out.expanded");
}

/// One delivery attempt for a concrete job.
async fn deliver_one(ctx: &ConsumerContext, job: DispatchJob, delivery: Delivery) {
    match ctx.sink.deliver(&job.recipient_id, &job.payload).await {
        Ok(()) => {
            ack_or_report(ctx, delivery.tag).await;
            ctx.events.emit(ClientEvent::MessageSent {
                recipient_id: job.recipient_id,
                success: true,
            });
            metric_inc("dispatch.delivery.ok");
        }

        Err(err) => match classify_delivery_error(&err) {
            FailureKind::RateLimited => {
                // explicit requeue of the identical bytes, then ack the
                // original delivery; broker-level redelivery never kicks in
                match ctx.queue.enqueue_raw(&delivery.body).await {
                    Ok(()) => {
                        ack_or_report(ctx, delivery.tag).await;
                        ctx.events.emit(ClientEvent::RateLimited {
                            recipient_id: job.recipient_id,
                        });
                        metric_inc("dispatch.delivery.rate_limited");
                    }
                    Err(requeue_err) => {
                        // left unacknowledged; the broker redelivers once
                        // the channel recovers
                        ctx.events.emit(ClientEvent::Error(format!(
                            "requeue after rate limit failed: {}",
                            requeue_err
                        )));
                    }
                }
            }

            FailureKind::Permanent => {
                ack_or_report(ctx, delivery.tag).await;
                ctx.events.emit(ClientEvent::MessageSent {
                    recipient_id: job.recipient_id.clone(),
                    success: false,
                });
                ctx.events.emit(ClientEvent::Error(format!(
                    "delivery to {} failed: {}",
                    job.recipient_id, err
                )));
                metric_inc("dispatch.delivery.failed");
            }
        },
    }
}

async fn ack_or_report(ctx: &ConsumerContext, delivery_tag: u64) {
    if let Err(err) = ctx.queue.ack(delivery_tag).await {
        ctx.events
            .emit(ClientEvent::Error(format!("ack failed: {}", err)));
    }
}
