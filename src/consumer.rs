// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! This module provides the handler-facing side of consumption: the `Delivery`
//! handed to a handler with its terminal actions, the `ConsumerHandler` trait, and
//! the per-delivery processing that runs a handler inside a consumer span and
//! settles whatever the handler left unsettled.

use crate::{
    envelope::Envelope,
    errors::AmqpError,
    events::{AdapterEvent, EventEmitter},
    headers::Headers,
    otel,
    transport::{Acker, MessageProperties, RawDelivery},
};
use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use serde::de::DeserializeOwned;
use std::{
    borrow::Cow,
    error::Error,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error};

/// Result returned by message handlers.
pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Processes messages delivered to a consumer.
///
/// Returning `Ok` without settling the delivery acks it; returning an error (or
/// panicking) rejects it without requeue, which dead-letters it when the queue has
/// a dead letter exchange.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> HandlerResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, delivery: Delivery) -> HandlerResult {
        (self.0)(delivery).await
    }
}

/// Wraps an async closure as a [`ConsumerHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct DeliveryInner {
    raw: RawDelivery,
    queue: String,
    consumer_tag: String,
    settled: AtomicBool,
    events: Arc<EventEmitter>,
    context: Context,
}

/// A message delivered to a consumer.
///
/// Clones refer to the same delivery; exactly one terminal action (`ack`, `nack`,
/// `reject`) reaches the broker, later ones fail with `AlreadySettled`.
#[derive(Clone)]
pub struct Delivery {
    inner: Arc<DeliveryInner>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.inner.queue)
            .field("consumer_tag", &self.inner.consumer_tag)
            .field("raw", &self.inner.raw)
            .field("settled", &self.is_settled())
            .finish()
    }
}

enum Settle {
    Ack,
    Nack(bool),
    Reject(bool),
}

impl Delivery {
    pub(crate) fn new(
        raw: RawDelivery,
        queue: &str,
        consumer_tag: &str,
        events: Arc<EventEmitter>,
    ) -> Delivery {
        let context = otel::extract(&raw.properties.headers);
        Delivery {
            inner: Arc::new(DeliveryInner {
                raw,
                queue: queue.to_owned(),
                consumer_tag: consumer_tag.to_owned(),
                settled: AtomicBool::new(false),
                events,
                context,
            }),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.raw.body
    }

    /// Decodes the body as an envelope carrying a `P` payload.
    pub fn envelope<P: DeserializeOwned>(&self) -> Result<Envelope<P>, AmqpError> {
        Envelope::from_bytes(&self.inner.raw.body)
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.inner.raw.properties
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.raw.properties.headers
    }

    pub fn redelivered(&self) -> bool {
        self.inner.raw.redelivered
    }

    pub fn exchange(&self) -> &str {
        &self.inner.raw.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.inner.raw.routing_key
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.inner.consumer_tag
    }

    pub fn delivery_tag(&self) -> u64 {
        self.inner.raw.delivery_tag
    }

    /// Trace context propagated by the publisher.
    pub fn trace_context(&self) -> &Context {
        &self.inner.context
    }

    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::SeqCst)
    }

    /// Acknowledges successful processing; the broker forgets the message.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.settle(Settle::Ack).await
    }

    /// Negatively acknowledges the message. With `requeue` the broker redelivers it
    /// at a position of its choosing; without, it is dead-lettered or dropped.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.settle(Settle::Nack(requeue)).await
    }

    /// Rejects the message. Without `requeue` it is dead-lettered or dropped.
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.settle(Settle::Reject(requeue)).await
    }

    async fn settle(&self, action: Settle) -> Result<(), AmqpError> {
        let inner = &self.inner;
        if inner.settled.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadySettled(inner.raw.delivery_tag));
        }

        let acker: &dyn Acker = inner.raw.acker.as_ref();
        let queue = inner.queue.clone();
        let consumer_tag = inner.consumer_tag.clone();
        let delivery_tag = inner.raw.delivery_tag;

        let (result, event) = match action {
            Settle::Ack => (
                acker.ack().await,
                AdapterEvent::MessageAcked {
                    queue,
                    consumer_tag,
                    delivery_tag,
                },
            ),
            Settle::Nack(requeue) => (
                acker.nack(requeue).await,
                AdapterEvent::MessageNacked {
                    queue,
                    consumer_tag,
                    delivery_tag,
                    requeue,
                },
            ),
            Settle::Reject(requeue) => (
                acker.reject(requeue).await,
                AdapterEvent::MessageRejected {
                    queue,
                    consumer_tag,
                    delivery_tag,
                    requeue,
                },
            ),
        };

        match result {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error to settle msg");
                Err(err)
            }
            Ok(()) => {
                inner.events.emit(event);
                Ok(())
            }
        }
    }
}

/// Runs `handler` for one delivery and settles what the handler left unsettled.
///
/// The prefetch `permit` is held until the delivery is settled and the handler
/// finished.
pub(crate) async fn process(
    handler: Arc<dyn ConsumerHandler>,
    delivery: Delivery,
    events: Arc<EventEmitter>,
    permit: Option<OwnedSemaphorePermit>,
) {
    let tracer: BoxedTracer = global::tracer(otel::TRACER_NAME);
    let (_ctx, mut span) = otel::new_span(delivery.headers(), &tracer, delivery.queue());

    debug!(
        "received: {} - exchange: {} - key: {}",
        delivery.delivery_tag(),
        delivery.exchange(),
        delivery.routing_key()
    );

    let outcome = AssertUnwindSafe(handler.handle(delivery.clone()))
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(panic) => Some(panic_message(panic.as_ref())),
    };

    match failure {
        None => {
            if !delivery.is_settled() {
                if let Err(err) = delivery.ack().await {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    drop(permit);
                    return;
                }
            }
            debug!("message successfully processed");
            span.set_status(Status::Ok);
        }
        Some(description) => {
            events.emit(AdapterEvent::HandlerError {
                queue: delivery.queue().to_owned(),
                consumer_tag: delivery.consumer_tag().to_owned(),
                delivery_tag: delivery.delivery_tag(),
                error: description.clone(),
            });
            span.record_error(&AmqpError::HandlerError(description.clone()));
            span.set_status(Status::Error {
                description: Cow::from(description),
            });

            if !delivery.is_settled() {
                if let Err(err) = delivery.reject(false).await {
                    error!(error = err.to_string(), "error to reject msg after handler failure");
                }
            }
        }
    }

    drop(permit);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::EventKind,
        transport::MockAcker,
    };
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    fn raw(acker: MockAcker) -> RawDelivery {
        RawDelivery {
            delivery_tag: 7,
            exchange: "calls".to_owned(),
            routing_key: "calls.inbound".to_owned(),
            redelivered: false,
            properties: MessageProperties::default(),
            body: br#"{"id":"1","payload":3,"metadata":{"timestamp":"2025-01-01T00:00:00Z","source":"s"}}"#
                .to_vec(),
            acker: Arc::new(acker),
        }
    }

    struct Panics;

    #[async_trait]
    impl ConsumerHandler for Panics {
        async fn handle(&self, _delivery: Delivery) -> HandlerResult {
            panic!("handler bug")
        }
    }

    fn recorder(events: &EventEmitter) -> Arc<Mutex<Vec<EventKind>>> {
        let seen = Arc::new(Mutex::new(vec![]));
        events.on({
            let seen = Arc::clone(&seen);
            move |event| seen.lock().unwrap().push(event.kind())
        });
        seen
    }

    #[tokio::test]
    async fn second_settlement_never_reaches_the_broker() {
        let mut acker = MockAcker::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_reject().never();
        let events = Arc::new(EventEmitter::default());
        let delivery = Delivery::new(raw(acker), "q", "c", Arc::clone(&events));

        delivery.ack().await.unwrap();
        assert_eq!(delivery.reject(false).await, Err(AmqpError::AlreadySettled(7)));
        assert!(delivery.is_settled());
    }

    #[tokio::test]
    async fn decodes_envelope_payload() {
        let delivery = Delivery::new(
            raw(MockAcker::new()),
            "q",
            "c",
            Arc::new(EventEmitter::default()),
        );

        let envelope: Envelope<u32> = delivery.envelope().unwrap();
        assert_eq!(envelope.payload, 3);
        assert_eq!(delivery.routing_key(), "calls.inbound");
    }

    #[tokio::test]
    async fn unsettled_success_is_acked() {
        let mut acker = MockAcker::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        let events = Arc::new(EventEmitter::default());
        let seen = recorder(&events);

        let delivery = Delivery::new(raw(acker), "q", "c", Arc::clone(&events));
        process(handler_fn(|_| async { HandlerResult::Ok(()) }), delivery, events, None).await;

        assert_eq!(*seen.lock().unwrap(), vec![EventKind::MessageAcked]);
    }

    #[tokio::test]
    async fn handler_error_rejects_without_requeue() {
        let mut acker = MockAcker::new();
        acker
            .expect_reject()
            .withf(|requeue| !*requeue)
            .times(1)
            .returning(|_| Ok(()));
        let events = Arc::new(EventEmitter::default());
        let seen = recorder(&events);

        let delivery = Delivery::new(raw(acker), "q", "c", Arc::clone(&events));
        process(
            handler_fn(|_| async { HandlerResult::Err("boom".into()) }),
            delivery,
            events,
            None,
        )
        .await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::HandlerError, EventKind::MessageRejected]
        );
    }

    #[tokio::test]
    async fn handler_panic_is_contained_and_releases_permit() {
        let mut acker = MockAcker::new();
        acker.expect_reject().times(1).returning(|_| Ok(()));
        let events = Arc::new(EventEmitter::default());
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&semaphore).acquire_owned().await.unwrap();

        let delivery = Delivery::new(raw(acker), "q", "c", Arc::clone(&events));
        process(
            Arc::new(Panics),
            delivery,
            events,
            Some(permit),
        )
        .await;

        assert_eq!(semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn explicit_settlement_is_not_repeated() {
        let mut acker = MockAcker::new();
        acker
            .expect_nack()
            .withf(|requeue| *requeue)
            .times(1)
            .returning(|_| Ok(()));
        acker.expect_ack().never();
        let events = Arc::new(EventEmitter::default());

        let delivery = Delivery::new(raw(acker), "q", "c", Arc::clone(&events));
        process(
            handler_fn(|delivery: Delivery| async move {
                delivery.nack(true).await?;
                HandlerResult::Ok(())
            }),
            delivery,
            events,
            None,
        )
        .await;
    }
}
