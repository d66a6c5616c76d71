// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use rabbitmq_adapter::{
    transport::memory::MemoryBroker, AdapterConfig, AdapterEvent, AmqpAdapter, EventKind,
    RetryPolicy,
};
use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Installs a test-writer subscriber filtered by `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn adapter(broker: &MemoryBroker) -> AmqpAdapter {
    init_tracing();
    AmqpAdapter::builder(AdapterConfig::default())
        .connector(broker.connector())
        .retry_policy(RetryPolicy::fixed(Duration::from_millis(20)))
        .build()
}

pub async fn connected(broker: &MemoryBroker) -> AmqpAdapter {
    let adapter = adapter(broker);
    adapter.connect().await.unwrap();
    adapter
}

/// Polls `check` until it holds, failing the test after [`WAIT`].
pub async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let polled = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("operation timed out")
}

/// Collects every event emitted by `adapter`.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<AdapterEvent>>>,
}

impl Recorder {
    pub fn attach(adapter: &AmqpAdapter) -> Recorder {
        let recorder = Recorder::default();
        let events = Arc::clone(&recorder.events);
        adapter.on(move |event| events.lock().unwrap().push(event.clone()));
        recorder
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.kind() == kind)
            .count()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<AdapterEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.kind() == kind)
            .cloned()
            .collect()
    }
}
