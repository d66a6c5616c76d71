// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lifecycle Events
//!
//! The adapter reports what happens on the broker side through a fixed set of
//! typed events. External monitors register listeners with
//! [`crate::AmqpAdapter::on`]; every event is also logged through `tracing`.

use crate::errors::AmqpError;
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};
use tracing::{debug, error, info, warn};

/// Discriminant of an [`AdapterEvent`], used to filter listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Error,
    MessagePublished,
    MessageSent,
    MessageAcked,
    MessageNacked,
    MessageRejected,
    ConsumerStarted,
    ConsumerCancelled,
    HandlerError,
    QueuePurged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Error => "error",
            EventKind::MessagePublished => "message-published",
            EventKind::MessageSent => "message-sent",
            EventKind::MessageAcked => "message-acked",
            EventKind::MessageNacked => "message-nacked",
            EventKind::MessageRejected => "message-rejected",
            EventKind::ConsumerStarted => "consumer-started",
            EventKind::ConsumerCancelled => "consumer-cancelled",
            EventKind::HandlerError => "handler-error",
            EventKind::QueuePurged => "queue-purged",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// A connection was established; `reconnected` is false for the first one.
    Connected { reconnected: bool },
    Disconnected { reason: String },
    Error { context: String, error: AmqpError },
    MessagePublished {
        exchange: String,
        routing_key: String,
        message_id: String,
    },
    MessageSent { queue: String, message_id: String },
    MessageAcked {
        queue: String,
        consumer_tag: String,
        delivery_tag: u64,
    },
    MessageNacked {
        queue: String,
        consumer_tag: String,
        delivery_tag: u64,
        requeue: bool,
    },
    MessageRejected {
        queue: String,
        consumer_tag: String,
        delivery_tag: u64,
        requeue: bool,
    },
    ConsumerStarted { queue: String, consumer_tag: String },
    ConsumerCancelled { queue: String, consumer_tag: String },
    HandlerError {
        queue: String,
        consumer_tag: String,
        delivery_tag: u64,
        error: String,
    },
    QueuePurged { queue: String, message_count: u32 },
}

impl AdapterEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AdapterEvent::Connected { .. } => EventKind::Connected,
            AdapterEvent::Disconnected { .. } => EventKind::Disconnected,
            AdapterEvent::Error { .. } => EventKind::Error,
            AdapterEvent::MessagePublished { .. } => EventKind::MessagePublished,
            AdapterEvent::MessageSent { .. } => EventKind::MessageSent,
            AdapterEvent::MessageAcked { .. } => EventKind::MessageAcked,
            AdapterEvent::MessageNacked { .. } => EventKind::MessageNacked,
            AdapterEvent::MessageRejected { .. } => EventKind::MessageRejected,
            AdapterEvent::ConsumerStarted { .. } => EventKind::ConsumerStarted,
            AdapterEvent::ConsumerCancelled { .. } => EventKind::ConsumerCancelled,
            AdapterEvent::HandlerError { .. } => EventKind::HandlerError,
            AdapterEvent::QueuePurged { .. } => EventKind::QueuePurged,
        }
    }

    fn log(&self) {
        match self {
            AdapterEvent::Connected { reconnected } => info!(reconnected, "amqp connected"),
            AdapterEvent::Disconnected { reason } => warn!(reason = %reason, "amqp disconnected"),
            AdapterEvent::Error { context, error } => {
                error!(error = error.to_string(), context = %context, "amqp error")
            }
            AdapterEvent::HandlerError {
                queue,
                consumer_tag,
                delivery_tag,
                error,
            } => warn!(
                queue = %queue,
                consumer_tag = %consumer_tag,
                delivery_tag,
                error = %error,
                "handler failed"
            ),
            AdapterEvent::ConsumerStarted { queue, consumer_tag }
            | AdapterEvent::ConsumerCancelled { queue, consumer_tag } => {
                info!(queue = %queue, consumer_tag = %consumer_tag, "{}", self.kind().as_str())
            }
            AdapterEvent::QueuePurged {
                queue,
                message_count,
            } => info!(queue = %queue, message_count, "queue purged"),
            other => debug!(event = ?other, "{}", other.kind().as_str()),
        }
    }
}

/// Identifies a registered listener so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&AdapterEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct EventEmitter {
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl EventEmitter {
    pub(crate) fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&AdapterEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub(crate) fn on_kind<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&AdapterEvent) + Send + Sync + 'static,
    {
        self.on(move |event| {
            if event.kind() == kind {
                listener(event)
            }
        })
    }

    /// Returns false when no listener was registered under `id`.
    pub(crate) fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    pub(crate) fn emit(&self, event: AdapterEvent) {
        event.log();

        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!(event = event.kind().as_str(), "event listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collector(emitter: &EventEmitter) -> (ListenerId, Arc<Mutex<Vec<EventKind>>>) {
        let seen = Arc::new(Mutex::new(vec![]));
        let id = emitter.on({
            let seen = Arc::clone(&seen);
            move |event| seen.lock().unwrap().push(event.kind())
        });
        (id, seen)
    }

    #[test]
    fn delivers_events_until_removed() {
        let emitter = EventEmitter::default();
        let (id, seen) = collector(&emitter);

        emitter.emit(AdapterEvent::Connected { reconnected: false });
        assert!(emitter.off(id));
        emitter.emit(AdapterEvent::Disconnected {
            reason: "gone".to_owned(),
        });

        assert_eq!(*seen.lock().unwrap(), vec![EventKind::Connected]);
        assert!(!emitter.off(id));
    }

    #[test]
    fn kind_filter_skips_other_events() {
        let emitter = EventEmitter::default();
        let seen = Arc::new(Mutex::new(0));
        emitter.on_kind(EventKind::QueuePurged, {
            let seen = Arc::clone(&seen);
            move |_| *seen.lock().unwrap() += 1
        });

        emitter.emit(AdapterEvent::Connected { reconnected: true });
        emitter.emit(AdapterEvent::QueuePurged {
            queue: "q".to_owned(),
            message_count: 3,
        });

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn panicking_listener_does_not_starve_others() {
        let emitter = EventEmitter::default();
        emitter.on(|_| panic!("listener bug"));
        let (_, seen) = collector(&emitter);

        emitter.emit(AdapterEvent::Connected { reconnected: false });

        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
