//! Client facade.
//!
//! Wires the connection manager, queue, consumer, producer and monitor
//! together and owns the cross-cutting tasks: the state watcher that
//! restarts consumption after a reconnect, and ordered teardown on close.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::config::ConfigSource;
use crate::connection::{ConnectSettings, ConnectionManager, ReconnectPolicy};
use crate::consumer::{AudienceSource, BatchConsumer, ConsumerSettings, DeliverySink};
use crate::error::DispatchError;
use crate::events::{ClientEvent, EventBus};
use crate::monitor::QueueMonitor;
use crate::producer::{BroadcastProducer, BroadcastRegistry};
use crate::queue::JobQueue;
use crate::transport::Broker;
use crate::types::{BroadcastRecord, BroadcastRequest, ClientConfig, ConnectionState};

/// Assembles a [`DispatchClient`] from its injected capabilities.
pub struct DispatchClientBuilder {
    config: ClientConfig,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn DeliverySink>,
    audience: Option<Arc<dyn AudienceSource>>,
    config_source: Option<Arc<dyn ConfigSource>>,
}

impl DispatchClientBuilder {
    pub fn new(
        config: ClientConfig,
        broker: Arc<dyn Broker>,
        sink: Arc<dyn DeliverySink>,
    ) -> Self {
        Self {
            config,
            broker,
            sink,
            audience: None,
            config_source: None,
        }
    }

    /// Required for full-audience broadcasts.
    pub fn with_audience_source(mut self, audience: Arc<dyn AudienceSource>) -> Self {
        self.audience = Some(audience);
        self
    }

    /// Remote endpoint serving the broker address. Without one the default
    /// local address is used directly.
    pub fn with_config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = Some(source);
        self
    }

    pub fn build(self) -> DispatchClient {
        let events = EventBus::new();
        let queue_name = self.config.queue_name();

        let connection = ConnectionManager::new(
            self.broker,
            self.config_source,
            ConnectSettings {
                queue_name: queue_name.clone(),
                policy: ReconnectPolicy {
                    base: self.config.reconnect_base,
                    cap: self.config.reconnect_cap,
                    max_attempts: self.config.max_reconnect_attempts,
                },
                config_attempts: self.config.config_attempts,
                config_retry_delay: self.config.config_retry_delay,
            },
            events.clone(),
        );

        let queue = Arc::new(JobQueue::new(queue_name, connection.clone()));
        let registry: BroadcastRegistry = Arc::new(Mutex::new(HashMap::new()));

        let consumer = Arc::new(BatchConsumer::new(
            queue.clone(),
            self.sink,
            self.audience.clone(),
            events.clone(),
            ConsumerSettings {
                batch_size: self.config.batch_size,
                batch_interval: self.config.batch_interval,
                flush_tick: self.config.flush_tick,
            },
        ));

        let producer = BroadcastProducer::new(
            queue.clone(),
            self.audience.is_some(),
            registry.clone(),
        );

        let monitor = Arc::new(QueueMonitor::new(
            connection.clone(),
            queue.clone(),
            consumer.clone(),
            registry,
            events.clone(),
            self.config.monitor_interval,
        ));

        DispatchClient {
            events,
            connection,
            consumer,
            producer,
            monitor,
            state_watcher: Mutex::new(None),
        }
    }
}

/// Broadcast dispatch client.
///
/// Producer calls return as soon as jobs are queued; everything that
/// happens afterwards is reported through [`DispatchClient::subscribe`].
pub struct DispatchClient {
    events: EventBus,
    connection: ConnectionManager,
    consumer: Arc<BatchConsumer>,
    producer: BroadcastProducer,
    monitor: Arc<QueueMonitor>,
    state_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchClient {
    pub fn builder(
        config: ClientConfig,
        broker: Arc<dyn Broker>,
        sink: Arc<dyn DeliverySink>,
    ) -> DispatchClientBuilder {
        DispatchClientBuilder::new(config, broker, sink)
    }

    /// Connect and begin consuming.
    ///
    /// A broker that is down at start is not an error: the reconnect
    /// machine keeps trying and consumption starts on the first successful
    /// connect.
    pub async fn start(&self) -> Result<(), DispatchError> {
        self.connection.start().await?;

        if self.connection.state() == ConnectionState::Connected {
            if let Err(err) = self.consumer.start().await {
                self.events.emit(ClientEvent::Error(format!(
                    "initial consumer start failed: {}",
                    err
                )));
            }
        }

        self.monitor.start().await;
        self.spawn_state_watcher().await;
        Ok(())
    }

    /// Restart consumption every time the connection comes back.
    async fn spawn_state_watcher(&self) {
        let mut slot = self.state_watcher.lock().await;
        if slot.is_some() {
            return;
        }

        let mut state_rx = self.connection.watch_state();
        let consumer = self.consumer.clone();
        let events = self.events.clone();
        *slot = Some(tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                if *state_rx.borrow() != ConnectionState::Connected {
                    continue;
                }
                consumer.stop().await;
                if let Err(err) = consumer.start().await {
                    events.emit(ClientEvent::Error(format!(
                        "consumer restart after reconnect failed: {}",
                        err
                    )));
                }
            }
        }));
    }

    /// Queue a broadcast; see [`BroadcastProducer::broadcast`].
    pub async fn broadcast(&self, request: BroadcastRequest) -> Result<String, DispatchError> {
        self.producer.broadcast(request).await
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Broadcasts accepted by this process that have not completed yet.
    pub async fn active_broadcasts(&self) -> Vec<BroadcastRecord> {
        self.producer.active_broadcasts().await
    }

    /// Orderly shutdown: stop the timers, drain the current batch, cancel
    /// the consumer registration, then close the channel.
    pub async fn close(&self) {
        if let Some(watcher) = self.state_watcher.lock().await.take() {
            watcher.abort();
        }
        self.monitor.stop().await;
        self.consumer.stop().await;
        self.connection.shutdown().await;
    }
}
