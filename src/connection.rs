//! Broker connection lifecycle.
//!
//! Exactly one live connection+channel per client. Failures move through a
//! small state machine:
//!
//! ```text
//! Disconnected --start--> Connecting --ok--> Connected
//!      ^                      |                 |
//!      +----- retry timer ----+<-- close/error--+
//!      |
//!      +-- attempts exceed ceiling --> Failed (terminal)
//! ```
//!
//! Reconnect delays follow `min(base * 2^(n-1), cap)`. A pending retry
//! timer is always aborted before a new one is scheduled, and an
//! `connecting` guard keeps connect attempts non-reentrant.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::{resolve_broker_url, ConfigSource};
use crate::error::DispatchError;
use crate::events::{ClientEvent, EventBus};
use crate::transport::{Broker, BrokerChannel};
use crate::types::ConnectionState;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Exponential backoff schedule for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-indexed): `min(base * 2^(n-1), cap)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;
        let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(base_ms.saturating_mul(pow).min(cap_ms))
    }
}

/// Connection-level settings derived from the client config.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub queue_name: String,
    pub policy: ReconnectPolicy,
    pub config_attempts: u32,
    pub config_retry_delay: Duration,
}

struct ConnSlot {
    channel: Option<Arc<dyn BrokerChannel>>,
    broker_url: Option<String>,
    attempts: u32,
    connecting: bool,
    reconnect_timer: Option<JoinHandle<()>>,
    close_watcher: Option<JoinHandle<()>>,
    shutdown: bool,
}

struct Inner {
    broker: Arc<dyn Broker>,
    config_source: Option<Arc<dyn ConfigSource>>,
    settings: ConnectSettings,
    events: EventBus,
    state_tx: watch::Sender<ConnectionState>,
    conn: Mutex<ConnSlot>,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        // send_replace never fails; we hold a receiver alongside the sender
        self.state_tx.send_replace(state);
    }
}

/// Owns the broker connection and drives recovery.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        config_source: Option<Arc<dyn ConfigSource>>,
        settings: ConnectSettings,
        events: EventBus,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                broker,
                config_source,
                settings,
                events,
                state_tx,
                conn: Mutex::new(ConnSlot {
                    channel: None,
                    broker_url: None,
                    attempts: 0,
                    connecting: false,
                    reconnect_timer: None,
                    close_watcher: None,
                    shutdown: false,
                }),
            }),
            state_rx,
        }
    }

    /// Resolve the broker URL (remote config with fallback) and run the
    /// first connect attempt. A failed first attempt schedules recovery
    /// rather than erroring.
    pub async fn start(&self) -> Result<(), DispatchError> {
        let needs_url = {
            let slot = self.inner.conn.lock().await;
            if slot.shutdown {
                return Err(DispatchError::Shutdown);
            }
            slot.broker_url.is_none()
        };

        if needs_url {
            let url = resolve_broker_url(
                self.inner.config_source.as_ref(),
                self.inner.settings.config_attempts,
                self.inner.settings.config_retry_delay,
                &self.inner.events,
            )
            .await;
            self.inner.conn.lock().await.broker_url = Some(url);
        }

        connect(&self.inner).await;
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connectivity transitions, e.g. to restart consumption after a
    /// reconnect.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The live channel, if any. Borrowers must treat it as a capability
    /// handle and re-fetch it per operation.
    pub async fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.inner.conn.lock().await.channel.clone()
    }

    pub async fn is_shut_down(&self) -> bool {
        self.inner.conn.lock().await.shutdown
    }

    /// Cancel timers and watchers, then close the channel. Terminal.
    pub async fn shutdown(&self) {
        let channel = {
            let mut slot = self.inner.conn.lock().await;
            slot.shutdown = true;
            if let Some(timer) = slot.reconnect_timer.take() {
                timer.abort();
            }
            if let Some(watcher) = slot.close_watcher.take() {
                watcher.abort();
            }
            slot.channel.take()
        };

        if let Some(channel) = channel {
            let _ = channel.close().await;
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

/// One connect attempt. Non-reentrant; concurrent calls return immediately.
fn connect<'a>(inner: &'a Arc<Inner>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
    Box::pin(connect_inner(inner))
}

async fn connect_inner(inner: &Arc<Inner>) {
    let url = {
        let mut slot = inner.conn.lock().await;
        if slot.shutdown || slot.connecting || slot.channel.is_some() {
            return;
        }
        slot.connecting = true;
        slot.broker_url
            .clone()
            .unwrap_or_else(|| crate::types::DEFAULT_BROKER_URL.to_string())
    };

    inner.set_state(ConnectionState::Connecting);
    metric_inc("dispatch.connect.attempt");

    let result = match inner.broker.connect(&url).await {
        Ok(channel) => match channel.declare_queue(&inner.settings.queue_name).await {
            Ok(()) => Ok(channel),
            Err(err) => Err(err),
        },
        Err(err) => Err(err),
    };

    match result {
        Ok(channel) => {
            let close_rx = channel.on_close();
            {
                let mut slot = inner.conn.lock().await;
                slot.connecting = false;
                if slot.shutdown {
                    return;
                }
                slot.attempts = 0;
                slot.channel = Some(channel);
                if let Some(watcher) = slot.close_watcher.take() {
                    watcher.abort();
                }
                let watcher_inner = inner.clone();
                slot.close_watcher = Some(tokio::spawn(async move {
                    watch_close(watcher_inner, close_rx).await;
                }));
            }
            inner.set_state(ConnectionState::Connected);
            inner.events.emit(ClientEvent::Connected);
            metric_inc("dispatch.connect.ok");
        }
        Err(err) => {
            {
                let mut slot = inner.conn.lock().await;
                slot.connecting = false;
                slot.channel = None;
                if slot.shutdown {
                    return;
                }
            }
            inner.set_state(ConnectionState::Disconnected);
            inner.events.emit(ClientEvent::Error(err.to_string()));
            metric_inc("dispatch.connect.failed");
            schedule_reconnect(inner).await;
        }
    }
}

/// Turn a broker-initiated channel close into the Disconnected transition.
async fn watch_close(
    inner: Arc<Inner>,
    mut close_rx: tokio::sync::broadcast::Receiver<String>,
) {
    let Ok(_reason) = close_rx.recv().await else {
        return;
    };

    {
        let mut slot = inner.conn.lock().await;
        if slot.shutdown {
            return;
        }
        slot.channel = None;
    }

    inner.set_state(ConnectionState::Disconnected);
    inner.events.emit(ClientEvent::Disconnected);
    schedule_reconnect(&inner).await;
}

/// Arm the retry timer for the next attempt, or give up past the ceiling.
async fn schedule_reconnect(inner: &Arc<Inner>) {
    let mut slot = inner.conn.lock().await;
    if slot.shutdown {
        return;
    }
    if let Some(timer) = slot.reconnect_timer.take() {
        timer.abort();
    }

    slot.attempts += 1;
    if slot.attempts > inner.settings.policy.max_attempts {
        drop(slot);
        inner.set_state(ConnectionState::Failed);
        inner.events.emit(ClientEvent::Error(format!(
            "giving up after {} reconnect attempts",
            inner.settings.policy.max_attempts
        )));
        metric_inc("dispatch.connect.exhausted");
        return;
    }

    let delay = inner.settings.policy.delay_for_attempt(slot.attempts);
    let timer_inner = inner.clone();
    slot.reconnect_timer = Some(tokio::spawn(async move {
        sleep(delay).await;
        // deregister before connecting so a failed attempt never aborts
        // its own task when arming the next timer
        timer_inner.conn.lock().await.reconnect_timer = None;
        connect(&timer_inner).await;
    }));
}
