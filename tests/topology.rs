// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{adapter, connected, eventually, Recorder};
use rabbitmq_adapter::{
    errors::AmqpError, handler_fn, transport::memory::MemoryBroker, AdapterConfig, AmqpAdapter,
    ConsumeOptions, EventKind, ExchangeDefinition, HandlerResult, PublishOptions, QueueDefinition,
    TopologyDescriptor,
};

#[tokio::test]
async fn identical_redeclare_is_a_no_op() {
    let broker = MemoryBroker::new();
    let adapter = connected(&broker).await;
    let exchange = ExchangeDefinition::new("events").topic().durable();
    let queue = QueueDefinition::new("calls").durable().with_dlq().ttl(60_000);

    for _ in 0..3 {
        adapter.create_exchange(exchange.clone()).await.unwrap();
        adapter.create_queue(queue.clone()).await.unwrap();
        adapter.bind_queue("calls", "events", "call.#").await.unwrap();
    }

    adapter
        .publish("events", "call.started", &1, PublishOptions::new())
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("calls"), Some(1));
    assert_eq!(broker.queue_depth("calls-dlq"), Some(0));
}

#[tokio::test]
async fn conflicting_redeclare_fails_and_the_adapter_keeps_working() {
    let broker = MemoryBroker::new();
    let adapter = connected(&broker).await;
    adapter
        .create_exchange(ExchangeDefinition::new("events").topic())
        .await
        .unwrap();
    adapter
        .create_queue(QueueDefinition::new("calls").durable())
        .await
        .unwrap();

    assert!(matches!(
        adapter
            .create_exchange(ExchangeDefinition::new("events").fanout())
            .await,
        Err(AmqpError::PreconditionFailed(_))
    ));
    assert!(matches!(
        adapter.create_queue(QueueDefinition::new("calls")).await,
        Err(AmqpError::PreconditionFailed(_))
    ));

    adapter
        .send_to_queue("calls", &"still here", PublishOptions::new())
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("calls"), Some(1));
    assert_eq!(broker.connections_opened(), 1);
}

#[tokio::test]
async fn invalid_definitions_never_reach_the_broker() {
    let broker = MemoryBroker::new();
    let adapter = connected(&broker).await;

    let invalid = [
        adapter.create_queue(QueueDefinition::new("")).await,
        adapter
            .create_queue(QueueDefinition::new("calls").dead_letter_routing_key("dead"))
            .await,
        adapter.create_exchange(ExchangeDefinition::new("")).await,
        adapter.bind_queue("", "events", "#").await,
    ];

    for result in invalid {
        assert!(
            matches!(result, Err(AmqpError::InvalidConfiguration(_))),
            "{result:?}"
        );
    }
    assert_eq!(broker.queue_depth("calls"), None);
}

#[tokio::test]
async fn invalid_descriptor_declares_nothing() {
    let broker = MemoryBroker::new();
    let adapter = connected(&broker).await;
    let descriptor = TopologyDescriptor::new()
        .queue(QueueDefinition::new("first"))
        .queue(QueueDefinition::new(""));

    assert!(matches!(
        adapter.declare(&descriptor).await,
        Err(AmqpError::InvalidConfiguration(_))
    ));
    assert_eq!(broker.queue_depth("first"), None);
}

#[tokio::test]
async fn descriptor_loaded_from_json_is_declared_on_connect() {
    let descriptor: TopologyDescriptor = serde_json::from_value(serde_json::json!({
        "exchanges": [{ "name": "events", "kind": "topic", "durable": true }],
        "queues": [{ "name": "calls", "durable": true, "with_dlq": true, "max_priority": 10 }],
        "bindings": [{ "queue_name": "calls", "exchange_name": "events", "routing_key": "call.#" }]
    }))
    .unwrap();

    let broker = MemoryBroker::new();
    let adapter = AmqpAdapter::builder(AdapterConfig::default())
        .connector(broker.connector())
        .topology(descriptor)
        .build();
    adapter.connect().await.unwrap();

    adapter
        .publish("events", "call.ended", &"bye", PublishOptions::new())
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("calls"), Some(1));
    assert_eq!(broker.queue_depth("calls-dlq"), Some(0));
}

#[test]
fn unknown_exchange_kind_is_rejected_when_loading() {
    let loaded = serde_json::from_value::<TopologyDescriptor>(serde_json::json!({
        "exchanges": [{ "name": "events", "kind": "headers-ish" }]
    }));

    assert!(loaded.is_err());
}

#[tokio::test]
async fn deleted_entities_are_not_redeclared_after_reconnect() {
    let broker = MemoryBroker::new();
    let adapter = connected(&broker).await;
    adapter
        .create_queue(QueueDefinition::new("kept").exclusive())
        .await
        .unwrap();
    adapter
        .create_queue(QueueDefinition::new("dropped").exclusive())
        .await
        .unwrap();
    adapter
        .send_to_queue("dropped", &1, PublishOptions::new())
        .await
        .unwrap();

    assert_eq!(adapter.delete_queue("dropped").await.unwrap(), 1);

    broker.sever_connections("test");
    eventually("the reconnect", || broker.connections_opened() == 2).await;
    adapter.wait_connected().await.unwrap();

    assert_eq!(broker.queue_depth("kept"), Some(0));
    assert_eq!(broker.queue_depth("dropped"), None);
}

#[tokio::test]
async fn delete_exchange_forgets_its_bindings() {
    let broker = MemoryBroker::new();
    let adapter = adapter(&broker);
    adapter.connect().await.unwrap();
    adapter
        .create_exchange(ExchangeDefinition::new("events").topic())
        .await
        .unwrap();
    adapter
        .create_queue(QueueDefinition::new("calls"))
        .await
        .unwrap();
    adapter.bind_queue("calls", "events", "#").await.unwrap();

    adapter.delete_exchange("events").await.unwrap();

    assert!(matches!(
        adapter
            .publish("events", "call", &1, PublishOptions::new())
            .await,
        Err(AmqpError::NotFound(_))
    ));

    broker.sever_connections("test");
    eventually("the reconnect", || broker.connections_opened() == 2).await;
    adapter.wait_connected().await.unwrap();
    assert!(matches!(
        adapter
            .publish("events", "call", &1, PublishOptions::new())
            .await,
        Err(AmqpError::NotFound(_))
    ));
}

#[tokio::test]
async fn deleting_a_consumed_queue_cancels_its_consumers() {
    let broker = MemoryBroker::new();
    let adapter = connected(&broker).await;
    let recorder = Recorder::attach(&adapter);
    adapter
        .create_queue(QueueDefinition::new("calls"))
        .await
        .unwrap();
    adapter
        .consume(
            "calls",
            handler_fn(|_| async { HandlerResult::Ok(()) }),
            ConsumeOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(adapter.delete_queue("calls").await.unwrap(), 0);
    assert_eq!(recorder.count(EventKind::ConsumerCancelled), 1);

    adapter
        .create_queue(QueueDefinition::new("other"))
        .await
        .unwrap();
    adapter
        .send_to_queue("other", &1, PublishOptions::new())
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(adapter.is_connected());
    assert_eq!(broker.queue_depth("other"), Some(1));
    assert_eq!(broker.connections_opened(), 1);
}
