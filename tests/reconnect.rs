// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use async_trait::async_trait;
use common::{connected, eventually, within, Recorder};
use rabbitmq_adapter::{
    errors::AmqpError,
    handler_fn,
    transport::{memory::MemoryBroker, AmqpConnection, Connector},
    AdapterConfig, AdapterEvent, AmqpAdapter, ConnectionState, ConsumeOptions, EventKind,
    HandlerResult, PublishOptions, QueueDefinition, RetryPolicy,
};
use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// Connects through the memory broker after waiting `delay_ms`.
struct SlowConnector {
    inner: Arc<dyn Connector>,
    delay_ms: Arc<AtomicU64>,
}

#[async_trait]
impl Connector for SlowConnector {
    async fn connect(&self, connection_name: &str) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let delay = Duration::from_millis(self.delay_ms.load(Ordering::SeqCst));
        tokio::time::sleep(delay).await;
        self.inner.connect(connection_name).await
    }
}

fn slow_adapter(broker: &MemoryBroker, delay_ms: &Arc<AtomicU64>) -> AmqpAdapter {
    common::init_tracing();
    AmqpAdapter::builder(AdapterConfig::default())
        .connector(Arc::new(SlowConnector {
            inner: broker.connector(),
            delay_ms: Arc::clone(delay_ms),
        }))
        .retry_policy(RetryPolicy::fixed(Duration::from_millis(20)))
        .build()
}

#[tokio::test]
async fn consumers_resume_after_connection_loss() {
    let broker = MemoryBroker::new();
    let adapter = connected(&broker).await;
    let recorder = Recorder::attach(&adapter);
    adapter
        .create_queue(QueueDefinition::new("calls").durable())
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);
    let tag = adapter
        .consume(
            "calls",
            handler_fn(move |delivery| {
                let recorded = Arc::clone(&recorded);
                async move {
                    recorded.lock().unwrap().push(delivery.envelope::<u32>()?.payload);
                    HandlerResult::Ok(())
                }
            }),
            ConsumeOptions::new(),
        )
        .await
        .unwrap();

    adapter
        .send_to_queue("calls", &1u32, PublishOptions::new())
        .await
        .unwrap();
    eventually("the first delivery", || seen.lock().unwrap().len() == 1).await;

    broker.sever_connections("broker restart");
    eventually("the reconnect", || {
        recorder
            .of_kind(EventKind::Connected)
            .contains(&AdapterEvent::Connected { reconnected: true })
    })
    .await;

    adapter
        .send_to_queue("calls", &2u32, PublishOptions::new())
        .await
        .unwrap();
    eventually("the second delivery", || seen.lock().unwrap().len() == 2).await;

    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    assert_eq!(recorder.count(EventKind::Disconnected), 1);
    // once by consume(), once by the re-subscription
    assert_eq!(recorder.count(EventKind::ConsumerStarted), 2);
    assert_eq!(broker.connections_opened(), 2);
    assert_eq!(broker.open_connections(), 1);

    let stats = adapter.get_queue_stats("calls").await.unwrap();
    assert_eq!(stats.consumer_count, 1);
    adapter.cancel(&tag).await.unwrap();
}

#[tokio::test]
async fn publish_during_an_outage_completes_after_reconnect() {
    let broker = MemoryBroker::new();
    let adapter = connected(&broker).await;
    adapter
        .create_queue(QueueDefinition::new("calls").durable())
        .await
        .unwrap();

    broker.set_available(false);
    broker.sever_connections("outage");
    eventually("the outage", || !adapter.is_connected()).await;

    let pending = tokio::spawn({
        let adapter = adapter.clone();
        async move {
            adapter
                .send_to_queue("calls", &"late", PublishOptions::new().message_id("late-1"))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!pending.is_finished());
    assert!(!adapter.is_connected());

    broker.set_available(true);
    assert_eq!(within(pending).await.unwrap(), Ok("late-1".to_owned()));
    assert_eq!(broker.queue_depth("calls"), Some(1));
}

#[tokio::test]
async fn unacked_deliveries_are_redelivered_after_reconnect() {
    let broker = MemoryBroker::new();
    let adapter = connected(&broker).await;
    adapter
        .create_queue(QueueDefinition::new("calls").durable())
        .await
        .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let redelivered = Arc::new(AtomicUsize::new(0));
    let (count, again) = (Arc::clone(&attempts), Arc::clone(&redelivered));
    let broker_handle = broker.clone();
    adapter
        .consume(
            "calls",
            handler_fn(move |delivery| {
                let (count, again) = (Arc::clone(&count), Arc::clone(&again));
                let broker = broker_handle.clone();
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) == 0 {
                        broker.sever_connections("lost mid-flight");
                        return HandlerResult::Ok(());
                    }
                    if delivery.redelivered() {
                        again.fetch_add(1, Ordering::SeqCst);
                    }
                    HandlerResult::Ok(())
                }
            }),
            ConsumeOptions::new(),
        )
        .await
        .unwrap();

    adapter
        .send_to_queue("calls", &"work", PublishOptions::new())
        .await
        .unwrap();

    eventually("the redelivery", || redelivered.load(Ordering::SeqCst) == 1).await;
    eventually("the queue to drain", || broker.queue_depth("calls") == Some(0)).await;
}

#[tokio::test]
async fn close_suppresses_reconnection() {
    let broker = MemoryBroker::new();
    let adapter = connected(&broker).await;
    let recorder = Recorder::attach(&adapter);

    adapter.close().await.unwrap();
    broker.sever_connections("after close");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(adapter.state(), ConnectionState::Disconnected);
    assert_eq!(broker.connections_opened(), 1);
    assert_eq!(recorder.count(EventKind::Connected), 0);
    assert_eq!(
        adapter.create_queue(QueueDefinition::new("q")).await,
        Err(AmqpError::Closed)
    );
}

#[tokio::test]
async fn bounded_policy_gives_up_and_reports_not_connected() {
    let broker = MemoryBroker::new();
    let adapter = AmqpAdapter::builder(AdapterConfig::default())
        .connector(broker.connector())
        .retry_policy(RetryPolicy::fixed(Duration::from_millis(10)).max_attempts(3))
        .build();
    let recorder = Recorder::attach(&adapter);
    adapter.connect().await.unwrap();

    broker.set_available(false);
    broker.sever_connections("gone");

    eventually("the give-up", || {
        recorder
            .of_kind(EventKind::Error)
            .iter()
            .any(|event| matches!(event, AdapterEvent::Error { context, .. } if context == "reconnect"))
    })
    .await;

    assert_eq!(adapter.state(), ConnectionState::Disconnected);
    assert_eq!(
        adapter
            .send_to_queue("q", &1, PublishOptions::new())
            .await,
        Err(AmqpError::NotConnected)
    );

    broker.set_available(true);
    adapter.connect().await.unwrap();
    assert!(adapter.is_connected());
    assert!(recorder
        .of_kind(EventKind::Connected)
        .contains(&AdapterEvent::Connected { reconnected: true }));
}

#[tokio::test]
async fn dropping_the_last_handle_stops_the_supervisor() {
    let broker = MemoryBroker::new();
    let adapter = connected(&broker).await;
    drop(adapter);

    broker.sever_connections("nobody left");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(broker.connections_opened(), 1);
}

#[tokio::test]
async fn concurrent_connects_share_one_connection() {
    let broker = MemoryBroker::new();
    let adapter = common::adapter(&broker);

    let (a, b) = tokio::join!(adapter.connect(), adapter.connect());
    a.unwrap();
    b.unwrap();

    assert_eq!(broker.connections_opened(), 1);
    assert_eq!(adapter.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn close_during_connect_wins() {
    let broker = MemoryBroker::new();
    let delay_ms = Arc::new(AtomicU64::new(100));
    let adapter = slow_adapter(&broker, &delay_ms);
    let recorder = Recorder::attach(&adapter);

    let connecting = tokio::spawn({
        let adapter = adapter.clone();
        async move { adapter.connect().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    adapter.close().await.unwrap();

    assert_eq!(within(connecting).await.unwrap(), Err(AmqpError::Closed));
    assert_eq!(adapter.state(), ConnectionState::Disconnected);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(recorder.count(EventKind::Connected), 0);
    assert_eq!(
        adapter
            .send_to_queue("q", &1, PublishOptions::new())
            .await,
        Err(AmqpError::Closed)
    );
}

#[tokio::test]
async fn close_during_reconnect_wins() {
    let broker = MemoryBroker::new();
    let delay_ms = Arc::new(AtomicU64::new(0));
    let adapter = slow_adapter(&broker, &delay_ms);
    adapter.connect().await.unwrap();
    let recorder = Recorder::attach(&adapter);

    delay_ms.store(100, Ordering::SeqCst);
    broker.sever_connections("restart");
    eventually("the reconnect attempt", || {
        adapter.state() == ConnectionState::Connecting
    })
    .await;
    adapter.close().await.unwrap();

    assert_eq!(adapter.state(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(adapter.state(), ConnectionState::Disconnected);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(recorder.count(EventKind::Connected), 0);
}
