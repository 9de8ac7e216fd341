use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};

use broadcast_dispatcher::{
    AudienceError, AudienceSource, BatchConsumer, BroadcastRequest, ClientConfig, ClientEvent,
    ConnectSettings, ConnectionManager, ConsumerSettings, DeliveryError, DeliverySink,
    DispatchClient, DispatchError, DispatchJob, EventBus, InMemoryBroker, JobQueue,
    MessagePayload, QueueMonitor, ReconnectPolicy, DEFAULT_BROKER_URL,
};

#[derive(Debug, Clone)]
struct SinkCall {
    recipient: String,
    payload: serde_json::Value,
    at: Instant,
}

/// Delivery sink that records every call and can be primed with failures
/// per recipient.
struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    failures: Mutex<HashMap<String, Vec<DeliveryError>>>,
    delay: Duration,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            delay,
        })
    }

    async fn fail_next(&self, recipient: &str, error: DeliveryError) {
        self.failures
            .lock()
            .await
            .entry(recipient.to_string())
            .or_default()
            .push(error);
    }

    async fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().await.clone()
    }

    async fn calls_for(&self, recipient: &str) -> Vec<SinkCall> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.recipient == recipient)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn deliver(
        &self,
        recipient_id: &str,
        payload: &MessagePayload,
    ) -> Result<(), DeliveryError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        self.calls.lock().await.push(SinkCall {
            recipient: recipient_id.to_string(),
            payload: payload.clone(),
            at: Instant::now(),
        });

        let mut failures = self.failures.lock().await;
        if let Some(queued) = failures.get_mut(recipient_id) {
            if !queued.is_empty() {
                return Err(queued.remove(0));
            }
        }
        Ok(())
    }
}

struct StaticAudience(Vec<String>);

#[async_trait]
impl AudienceSource for StaticAudience {
    async fn resolve(&self) -> Result<Vec<String>, AudienceError> {
        Ok(self.0.clone())
    }
}

/// Wait for the first event matching `pred`, collecting everything seen on
/// the way there.
async fn wait_for<F>(
    rx: &mut tokio::sync::broadcast::Receiver<ClientEvent>,
    pred: F,
) -> (ClientEvent, Vec<ClientEvent>)
where
    F: Fn(&ClientEvent) -> bool,
{
    timeout(Duration::from_secs(120), async {
        let mut seen = Vec::new();
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return (event, seen),
                Ok(event) => seen.push(event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_sends(
    rx: &mut tokio::sync::broadcast::Receiver<ClientEvent>,
    count: usize,
) -> Vec<(String, bool)> {
    timeout(Duration::from_secs(120), async {
        let mut sends = Vec::new();
        while sends.len() < count {
            match rx.recv().await {
                Ok(ClientEvent::MessageSent {
                    recipient_id,
                    success,
                }) => sends.push((recipient_id, success)),
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
        sends
    })
    .await
    .expect("timed out waiting for message-sent events")
}

fn payload() -> serde_json::Value {
    serde_json::json!({"type": "message", "text": "hello"})
}

fn recipients(count: usize) -> Vec<String> {
    (0..count).map(|n| format!("r{:02}", n)).collect()
}

#[tokio::test(start_paused = true)]
async fn delivers_to_explicit_recipients() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = RecordingSink::new();
    let client = DispatchClient::builder(
        ClientConfig::new("tenant-a"),
        broker.clone(),
        sink.clone(),
    )
    .build();

    client.start().await.unwrap();
    let mut events = client.subscribe();

    let id = client
        .broadcast(BroadcastRequest::to_recipients(
            vec!["u1".into(), "u2".into(), "u3".into()],
            payload(),
        ))
        .await
        .unwrap();
    assert!(!id.is_empty());

    let sends = wait_for_sends(&mut events, 3).await;
    assert!(sends.iter().all(|(_, success)| *success));

    let delivered: Vec<_> = sink.calls().await.iter().map(|c| c.recipient.clone()).collect();
    assert_eq!(delivered.len(), 3);
    for expected in ["u1", "u2", "u3"] {
        assert!(delivered.iter().any(|r| r == expected));
    }

    // each job acknowledged exactly once
    let stats = broker.stats().await;
    assert_eq!(stats.acked, 3);
    assert_eq!(stats.duplicate_acks, 0);

    client.close().await;
}

// 25 jobs against a window of 20: the first window fills and flushes, the
// tail is picked up by the periodic flush timer.
#[tokio::test(start_paused = true)]
async fn batch_window_splits_over_capacity() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = RecordingSink::new();
    let client = DispatchClient::builder(
        ClientConfig::new("tenant-a").with_batch_size(20),
        broker.clone(),
        sink.clone(),
    )
    .build();

    client.start().await.unwrap();
    let mut events = client.subscribe();

    client
        .broadcast(BroadcastRequest::to_recipients(recipients(25), payload()))
        .await
        .unwrap();

    let sends = wait_for_sends(&mut events, 25).await;
    assert_eq!(sends.len(), 25);
    assert!(sends.iter().all(|(_, success)| *success));

    let stats = broker.stats().await;
    assert_eq!(stats.published, 25);
    assert_eq!(stats.acked, 25);
    assert_eq!(stats.duplicate_acks, 0);

    client.close().await;
}

// Once the first window has flushed, a full follow-up window is gated to
// at least `batch_interval` later, which holds back everything queued
// behind it.
#[tokio::test(start_paused = true)]
async fn flush_gate_paces_later_windows() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = RecordingSink::new();
    let interval = Duration::from_millis(1000);
    let client = DispatchClient::builder(
        ClientConfig::new("tenant-a")
            .with_batch_size(20)
            .with_batch_interval(interval),
        broker.clone(),
        sink.clone(),
    )
    .build();

    client.start().await.unwrap();
    let mut events = client.subscribe();
    let started = Instant::now();

    client
        .broadcast(BroadcastRequest::to_recipients(recipients(45), payload()))
        .await
        .unwrap();

    wait_for_sends(&mut events, 45).await;

    let calls = sink.calls().await;
    let early: Vec<_> = calls
        .iter()
        .filter(|c| c.at < started + Duration::from_millis(500))
        .collect();
    let late: Vec<_> = calls
        .iter()
        .filter(|c| c.at >= started + interval)
        .collect();

    // windows one and two run immediately; the tail waits for the gated
    // second flush
    assert_eq!(early.len(), 40);
    assert_eq!(late.len(), 5);
    for call in late {
        assert!(call.recipient.as_str() >= "r40");
    }

    client.close().await;
}

// A 429 from the provider requeues the identical job and emits a warning,
// not a MessageSent; the retried copy then goes through.
#[tokio::test(start_paused = true)]
async fn rate_limited_delivery_is_requeued_verbatim() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = RecordingSink::new();
    sink.fail_next("u1", DeliveryError::new(r#"{"error_code":429}"#))
        .await;

    let client = DispatchClient::builder(
        ClientConfig::new("tenant-a"),
        broker.clone(),
        sink.clone(),
    )
    .build();
    client.start().await.unwrap();
    let mut events = client.subscribe();

    client
        .broadcast(BroadcastRequest::to_recipients(
            vec!["u1".into()],
            payload(),
        ))
        .await
        .unwrap();

    let (_, before) = wait_for(&mut events, |event| {
        matches!(event, ClientEvent::MessageSent { recipient_id, success: true } if recipient_id == "u1")
    })
    .await;

    // the rate-limited attempt warned and did not count as a send
    assert!(before
        .iter()
        .any(|event| matches!(event, ClientEvent::RateLimited { recipient_id } if recipient_id == "u1")));
    assert!(!before
        .iter()
        .any(|event| matches!(event, ClientEvent::MessageSent { .. })));

    // delivered twice with the identical payload
    let attempts = sink.calls_for("u1").await;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].payload, attempts[1].payload);

    client.close().await;
}

// Anything that is not a rate-limit signal is dropped after exactly one
// attempt.
#[tokio::test(start_paused = true)]
async fn permanent_failure_drops_after_one_attempt() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = RecordingSink::new();
    sink.fail_next("u1", DeliveryError::new(r#"{"error_code":500}"#))
        .await;

    let client = DispatchClient::builder(
        ClientConfig::new("tenant-a"),
        broker.clone(),
        sink.clone(),
    )
    .build();
    client.start().await.unwrap();
    let mut events = client.subscribe();

    client
        .broadcast(BroadcastRequest::to_recipients(
            vec!["u1".into(), "u2".into()],
            payload(),
        ))
        .await
        .unwrap();

    let sends = wait_for_sends(&mut events, 2).await;
    let u1_sends: Vec<_> = sends.iter().filter(|(r, _)| r == "u1").collect();
    assert_eq!(u1_sends.len(), 1);
    assert!(!u1_sends[0].1);
    assert!(sends.iter().any(|(r, success)| r == "u2" && *success));

    // no requeue happened
    assert_eq!(sink.calls_for("u1").await.len(), 1);
    assert_eq!(broker.stats().await.published, 2);

    client.close().await;
}

#[tokio::test]
async fn full_audience_without_hook_is_a_configuration_error() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = RecordingSink::new();
    let client =
        DispatchClient::builder(ClientConfig::new("tenant-a"), broker.clone(), sink).build();
    client.start().await.unwrap();

    let result = client.broadcast(BroadcastRequest::to_all(payload())).await;
    assert!(matches!(result, Err(DispatchError::Configuration(_))));

    // nothing was enqueued
    assert_eq!(broker.stats().await.published, 0);

    client.close().await;
}

// Full-audience broadcasts defer expansion: the queue carries a single
// sentinel which the consumer replaces with per-recipient jobs.
#[tokio::test(start_paused = true)]
async fn full_audience_fans_out_at_drain_time() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = RecordingSink::new();
    let audience = Arc::new(StaticAudience(vec![
        "a1".into(),
        "a2".into(),
        "a3".into(),
    ]));

    let client = DispatchClient::builder(
        ClientConfig::new("tenant-a"),
        broker.clone(),
        sink.clone(),
    )
    .with_audience_source(audience)
    .build();
    client.start().await.unwrap();
    let mut events = client.subscribe();

    client
        .broadcast(BroadcastRequest::to_all(payload()))
        .await
        .unwrap();

    let (expanded, _) = wait_for(&mut events, |event| {
        matches!(event, ClientEvent::FanOutExpanded { .. })
    })
    .await;
    assert_eq!(expanded, ClientEvent::FanOutExpanded { size: 3 });

    let sends = wait_for_sends(&mut events, 3).await;
    assert!(sends.iter().all(|(_, success)| *success));

    // the sentinel itself is never delivered
    assert!(sink
        .calls()
        .await
        .iter()
        .all(|call| call.recipient != broadcast_dispatcher::ALL_RECIPIENTS));

    // sentinel + three children, each acked once
    let stats = broker.stats().await;
    assert_eq!(stats.published, 4);
    assert_eq!(stats.acked, 4);

    client.close().await;
}

// An unexpected channel drop disconnects, reconnects after the base backoff
// delay, and the engine keeps working.
#[tokio::test(start_paused = true)]
async fn reconnects_after_channel_drop() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = RecordingSink::new();
    let client = DispatchClient::builder(
        ClientConfig::new("tenant-a"),
        broker.clone(),
        sink.clone(),
    )
    .build();
    client.start().await.unwrap();
    let mut events = client.subscribe();

    let dropped_at = Instant::now();
    broker.drop_channel("simulated broker restart").await;

    wait_for(&mut events, |event| {
        matches!(event, ClientEvent::Disconnected)
    })
    .await;

    wait_for(&mut events, |event| matches!(event, ClientEvent::Connected)).await;
    let reconnect_delay = Instant::now() - dropped_at;
    assert!(reconnect_delay >= Duration::from_secs(1));
    assert!(reconnect_delay < Duration::from_secs(2));

    // two successful connects, one drop in between
    assert_eq!(broker.stats().await.connect_attempts, 2);

    client
        .broadcast(BroadcastRequest::to_recipients(
            vec!["u1".into()],
            payload(),
        ))
        .await
        .unwrap();
    let sends = wait_for_sends(&mut events, 1).await;
    assert_eq!(sends[0], ("u1".to_string(), true));

    client.close().await;
}

// Producer calls fail fast while the link is down.
#[tokio::test(start_paused = true)]
async fn broadcast_fails_fast_while_disconnected() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = RecordingSink::new();
    // keep the first reconnect far away so the test observes the gap
    let client = DispatchClient::builder(
        ClientConfig::new("tenant-a").with_reconnect_policy(
            Duration::from_secs(600),
            Duration::from_secs(600),
            3,
        ),
        broker.clone(),
        sink.clone(),
    )
    .build();
    client.start().await.unwrap();
    let mut events = client.subscribe();

    broker.drop_channel("simulated outage").await;
    wait_for(&mut events, |event| {
        matches!(event, ClientEvent::Disconnected)
    })
    .await;

    let result = client
        .broadcast(BroadcastRequest::to_recipients(
            vec!["u1".into()],
            payload(),
        ))
        .await;
    assert_eq!(result, Err(DispatchError::Connectivity));

    client.close().await;
}

// Past the attempt ceiling the state machine parks in Failed and stops
// scheduling connects.
#[tokio::test(start_paused = true)]
async fn reconnect_attempts_stop_at_the_ceiling() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.fail_next_connects(10);
    let sink = RecordingSink::new();
    let client = DispatchClient::builder(
        ClientConfig::new("tenant-a").with_reconnect_policy(
            Duration::from_secs(1),
            Duration::from_secs(30),
            2,
        ),
        broker.clone(),
        sink,
    )
    .build();
    let mut events = client.subscribe();
    client.start().await.unwrap();

    wait_for(&mut events, |event| {
        matches!(event, ClientEvent::Error(message) if message.contains("giving up"))
    })
    .await;
    assert_eq!(
        client.state(),
        broadcast_dispatcher::ConnectionState::Failed
    );

    // initial attempt plus two retries, then silence
    assert_eq!(broker.stats().await.connect_attempts, 3);
    sleep(Duration::from_secs(300)).await;
    assert_eq!(broker.stats().await.connect_attempts, 3);

    client.close().await;
}

// Scenario: messages pending, consumer not running. The monitor notices and
// restarts consumption.
#[tokio::test(start_paused = true)]
async fn monitor_restarts_a_stopped_consumer() {
    let broker: Arc<InMemoryBroker> = Arc::new(InMemoryBroker::new());
    let events = EventBus::new();
    let mut event_rx = events.subscribe();

    let connection = ConnectionManager::new(
        broker.clone(),
        None,
        ConnectSettings {
            queue_name: "dispatch.tenant-a".to_string(),
            policy: ReconnectPolicy::default(),
            config_attempts: 1,
            config_retry_delay: Duration::ZERO,
        },
        events.clone(),
    );
    connection.start().await.unwrap();

    let queue = Arc::new(JobQueue::new("dispatch.tenant-a", connection.clone()));
    for n in 0..5 {
        queue
            .enqueue(&DispatchJob::new(format!("u{}", n), payload()))
            .await
            .unwrap();
    }

    let sink = RecordingSink::new();
    let consumer = Arc::new(BatchConsumer::new(
        queue.clone(),
        sink.clone(),
        None,
        events.clone(),
        ConsumerSettings {
            batch_size: 20,
            batch_interval: Duration::from_millis(1000),
            flush_tick: Duration::from_millis(500),
        },
    ));

    let monitor = Arc::new(QueueMonitor::new(
        connection.clone(),
        queue.clone(),
        consumer.clone(),
        Arc::new(Mutex::new(HashMap::new())),
        events.clone(),
        Duration::from_secs(60),
    ));
    monitor.start().await;

    let (restarted, _) = wait_for(&mut event_rx, |event| {
        matches!(event, ClientEvent::ConsumerRestarted { .. })
    })
    .await;
    assert_eq!(restarted, ClientEvent::ConsumerRestarted { depth: 5 });

    let sends = wait_for_sends(&mut event_rx, 5).await;
    assert!(sends.iter().all(|(_, success)| *success));
    assert!(consumer.is_active());

    monitor.stop().await;
    consumer.stop().await;
    connection.shutdown().await;
}

// Once the queue drains, registered broadcasts complete and are forgotten.
#[tokio::test(start_paused = true)]
async fn end_broadcast_reported_after_queue_drains() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = RecordingSink::new();
    let client = DispatchClient::builder(
        ClientConfig::new("tenant-a").with_monitor_interval(Duration::from_secs(1)),
        broker.clone(),
        sink.clone(),
    )
    .build();
    client.start().await.unwrap();
    let mut events = client.subscribe();

    let id = client
        .broadcast(BroadcastRequest::to_recipients(
            vec!["u1".into()],
            payload(),
        ))
        .await
        .unwrap();
    assert_eq!(client.active_broadcasts().await.len(), 1);

    let (completed, _) = wait_for(&mut events, |event| {
        matches!(event, ClientEvent::EndBroadcast(_))
    })
    .await;
    match completed {
        ClientEvent::EndBroadcast(status) => assert_eq!(status.id, id),
        other => panic!("unexpected event: {:?}", other),
    }

    assert!(client.active_broadcasts().await.is_empty());
    client.close().await;
}

// Closing the client drains the in-flight window before tearing down the
// consumer, so no acknowledgements are lost.
#[tokio::test(start_paused = true)]
async fn close_drains_the_current_window() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = RecordingSink::with_delay(Duration::from_millis(100));
    let client = DispatchClient::builder(
        ClientConfig::new("tenant-a"),
        broker.clone(),
        sink.clone(),
    )
    .build();
    client.start().await.unwrap();

    client
        .broadcast(BroadcastRequest::to_recipients(recipients(3), payload()))
        .await
        .unwrap();

    // let the consumer pick the jobs up, then close while the delivery
    // tasks are still sleeping
    sleep(Duration::from_millis(10)).await;
    client.close().await;

    assert_eq!(sink.calls().await.len(), 3);
    let stats = broker.stats().await;
    assert_eq!(stats.acked, 3);

    // nothing left behind
    assert!(client.state() == broadcast_dispatcher::ConnectionState::Disconnected);
}

// Remote configuration failures fall back to the default broker address
// after the fixed retry schedule instead of failing startup.
#[tokio::test(start_paused = true)]
async fn config_fetch_falls_back_to_default_url() {
    struct DownSource;

    #[async_trait]
    impl broadcast_dispatcher::ConfigSource for DownSource {
        async fn fetch(
            &self,
        ) -> Result<broadcast_dispatcher::RemoteConfig, broadcast_dispatcher::ConfigError> {
            Err(broadcast_dispatcher::ConfigError("503".to_string()))
        }
    }

    let broker = Arc::new(InMemoryBroker::new());
    let sink = RecordingSink::new();
    let client = DispatchClient::builder(
        ClientConfig::new("tenant-a"),
        broker.clone(),
        sink,
    )
    .with_config_source(Arc::new(DownSource))
    .build();

    let started = Instant::now();
    let mut events = client.subscribe();
    client.start().await.unwrap();

    // three attempts with two 5s gaps between them
    assert!(Instant::now() - started >= Duration::from_secs(10));
    let (event, _) = wait_for(&mut events, |event| {
        matches!(event, ClientEvent::ConfigFallback { .. })
    })
    .await;
    assert!(matches!(event, ClientEvent::ConfigFallback { .. }));

    assert_eq!(
        broker.last_url().await.as_deref(),
        Some(DEFAULT_BROKER_URL)
    );
    assert_eq!(
        client.state(),
        broadcast_dispatcher::ConnectionState::Connected
    );

    client.close().await;
}

// A remote configuration that names a broker URL wins over the default.
#[tokio::test]
async fn remote_broker_url_is_used_when_served() {
    struct ServedSource;

    #[async_trait]
    impl broadcast_dispatcher::ConfigSource for ServedSource {
        async fn fetch(
            &self,
        ) -> Result<broadcast_dispatcher::RemoteConfig, broadcast_dispatcher::ConfigError> {
            Ok(broadcast_dispatcher::RemoteConfig {
                broker_url: Some("amqp://broker.internal:5672".to_string()),
            })
        }
    }

    let broker = Arc::new(InMemoryBroker::new());
    let sink = RecordingSink::new();
    let client = DispatchClient::builder(
        ClientConfig::new("tenant-a"),
        broker.clone(),
        sink,
    )
    .with_config_source(Arc::new(ServedSource))
    .build();
    client.start().await.unwrap();

    assert_eq!(
        broker.last_url().await.as_deref(),
        Some("amqp://broker.internal:5672")
    );

    client.close().await;
}
