// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatch
//!
//! This module keeps the tag-keyed table of registered consumers and runs one
//! dispatch loop per subscription. A loop takes a prefetch slot, waits for the
//! next delivery and hands it to a handler task; the slot is freed only when that
//! task has finished and settled the delivery.
//!
//! Registrations outlive subscriptions: after a reconnect the adapter subscribes
//! every active descriptor again on the new channel, sharing its prefetch
//! semaphore with handlers still running from the previous one.

use crate::{
    connection::Session,
    consumer::{process, ConsumerHandler, Delivery},
    errors::AmqpError,
    events::{AdapterEvent, EventEmitter},
};
use futures_util::StreamExt;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error};
use uuid::Uuid;

/// Options of a consumer registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub(crate) prefetch: Option<u16>,
    pub(crate) exclusive: bool,
    pub(crate) consumer_tag: Option<String>,
}

impl ConsumeOptions {
    pub fn new() -> ConsumeOptions {
        ConsumeOptions::default()
    }

    /// Maximum number of unsettled deliveries; 0 is unbounded. Defaults to the
    /// adapter's configured prefetch.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Requests to be the only consumer of the queue.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Uses `tag` instead of a generated consumer tag.
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }
}

/// A registered consumer.
pub(crate) struct ConsumerDescriptor {
    pub(crate) tag: String,
    pub(crate) queue: String,
    pub(crate) prefetch: u16,
    pub(crate) exclusive: bool,
    handler: Arc<dyn ConsumerHandler>,
    semaphore: Option<Arc<Semaphore>>,
    active: AtomicBool,
    order: u64,
}

impl ConsumerDescriptor {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Tag-keyed table of registered consumers.
#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    consumers: RwLock<HashMap<String, Arc<ConsumerDescriptor>>>,
    next_order: AtomicU64,
}

impl ConsumerRegistry {
    /// Registers a new consumer; fails if `options` names a tag already in use.
    pub(crate) fn register(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        options: &ConsumeOptions,
        default_prefetch: u16,
    ) -> Result<Arc<ConsumerDescriptor>, AmqpError> {
        let tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", queue, Uuid::new_v4()));
        let prefetch = options.prefetch.unwrap_or(default_prefetch);

        let descriptor = Arc::new(ConsumerDescriptor {
            tag: tag.clone(),
            queue: queue.to_owned(),
            prefetch,
            exclusive: options.exclusive,
            handler,
            semaphore: (prefetch > 0).then(|| Arc::new(Semaphore::new(usize::from(prefetch)))),
            active: AtomicBool::new(true),
            order: self.next_order.fetch_add(1, Ordering::Relaxed),
        });

        let mut consumers = self
            .consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if consumers.contains_key(&tag) {
            return Err(AmqpError::InvalidConfiguration(format!(
                "consumer tag `{tag}` is already registered"
            )));
        }
        consumers.insert(tag, Arc::clone(&descriptor));

        Ok(descriptor)
    }

    pub(crate) fn remove(&self, tag: &str) -> Option<Arc<ConsumerDescriptor>> {
        self.consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tag)
    }

    /// Removes every consumer registered on `queue`.
    pub(crate) fn remove_queue(&self, queue: &str) -> Vec<Arc<ConsumerDescriptor>> {
        let mut consumers = self
            .consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let tags: Vec<String> = consumers
            .values()
            .filter(|descriptor| descriptor.queue == queue)
            .map(|descriptor| descriptor.tag.clone())
            .collect();
        tags.iter()
            .filter_map(|tag| consumers.remove(tag))
            .collect()
    }

    /// Active consumers in registration order.
    pub(crate) fn active(&self) -> Vec<Arc<ConsumerDescriptor>> {
        let mut active: Vec<_> = self
            .consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|descriptor| descriptor.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|descriptor| descriptor.order);
        active
    }
}

/// Subscribes `descriptor` on the session's channel and spawns its dispatch loop.
///
/// When the delivery stream ends while the consumer is still registered, the
/// session generation is reported on `lost` so the channel gets recovered.
pub(crate) async fn subscribe(
    descriptor: Arc<ConsumerDescriptor>,
    session: &Session,
    events: Arc<EventEmitter>,
    lost: mpsc::UnboundedSender<u64>,
) -> Result<(), AmqpError> {
    let mut deliveries = session
        .channel
        .consume(
            &descriptor.queue,
            &descriptor.tag,
            descriptor.prefetch,
            descriptor.exclusive,
        )
        .await
        .inspect_err(|err| {
            error!(
                error = err.to_string(),
                queue = %descriptor.queue,
                "error to create the consumer"
            )
        })?;

    events.emit(AdapterEvent::ConsumerStarted {
        queue: descriptor.queue.clone(),
        consumer_tag: descriptor.tag.clone(),
    });

    let generation = session.generation;
    tokio::spawn(async move {
        loop {
            let permit = match &descriptor.semaphore {
                Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
                None => None,
            };

            let Some(result) = deliveries.next().await else {
                break;
            };

            match result {
                Ok(raw) => {
                    let delivery =
                        Delivery::new(raw, &descriptor.queue, &descriptor.tag, Arc::clone(&events));
                    tokio::spawn(process(
                        Arc::clone(&descriptor.handler),
                        delivery,
                        Arc::clone(&events),
                        permit,
                    ));
                }
                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        debug!(consumer_tag = %descriptor.tag, "delivery stream ended");
        if descriptor.is_active() {
            let _ = lost.send(generation);
        }
    });

    Ok(())
}
