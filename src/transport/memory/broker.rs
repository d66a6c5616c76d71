// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker State
//!
//! All broker-side semantics of the memory transport live here: entity
//! declaration with equivalence checks, exchange routing, priority storage,
//! TTL and max-length enforcement, dead-lettering with `x-death` bookkeeping,
//! prefetch-bounded round-robin dispatch and settlement.
//!
//! Every operation runs synchronously under one mutex; nothing here awaits while
//! holding it.

use super::routing::topic_matches;
use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    headers::{HeaderValue, Headers, HEADER_DELAY, HEADER_X_DEATH},
    queue::{
        QueueBinding, QueueDefinition, AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
        AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, AMQP_HEADERS_MAX_LENGTH,
        AMQP_HEADERS_MAX_LENGTH_BYTES, AMQP_HEADERS_MAX_PRIORITY, AMQP_HEADERS_MESSAGE_TTL,
    },
    transport::{Acker, MessageProperties, QueueStats, RawDelivery},
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::debug;

pub(crate) type Outbox = mpsc::UnboundedSender<Result<RawDelivery, AmqpError>>;
pub(crate) type Inbox = mpsc::UnboundedReceiver<Result<RawDelivery, AmqpError>>;

const REASON_REJECTED: &str = "rejected";
const REASON_EXPIRED: &str = "expired";
const REASON_MAXLEN: &str = "maxlen";

const PREDECLARED_EXCHANGES: [(&str, ExchangeKind); 3] = [
    ("amq.direct", ExchangeKind::Direct),
    ("amq.fanout", ExchangeKind::Fanout),
    ("amq.topic", ExchangeKind::Topic),
];

/// How a delivery was terminally settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Ack,
    Requeue,
    Discard,
}

#[derive(Debug, Clone)]
pub(crate) struct Message {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) properties: MessageProperties,
    pub(crate) body: Vec<u8>,
}

struct Stored {
    message: Message,
    expires_at: Option<Instant>,
    redelivered: bool,
}

/// Queue arguments as the broker understands them.
#[derive(Debug, Default)]
struct QueueArgs {
    dead_letter_exchange: Option<String>,
    dead_letter_routing_key: Option<String>,
    message_ttl: Option<u64>,
    max_length: Option<usize>,
    max_length_bytes: Option<usize>,
    max_priority: Option<u8>,
}

impl QueueArgs {
    fn parse(name: &str, args: &Headers) -> Result<QueueArgs, AmqpError> {
        let text = |key: &str| -> Result<Option<String>, AmqpError> {
            match args.get(key) {
                None => Ok(None),
                Some(HeaderValue::String(v)) => Ok(Some(v.clone())),
                Some(other) => Err(invalid_arg(name, key, other)),
            }
        };
        let number = |key: &str| -> Result<Option<u64>, AmqpError> {
            match args.get(key) {
                None => Ok(None),
                Some(value) => value
                    .as_i64()
                    .and_then(|v| u64::try_from(v).ok())
                    .map(Some)
                    .ok_or_else(|| invalid_arg(name, key, value)),
            }
        };

        let max_priority = match number(AMQP_HEADERS_MAX_PRIORITY)? {
            None => None,
            Some(v) => Some(u8::try_from(v).map_err(|_| {
                AmqpError::PreconditionFailed(format!(
                    "invalid arg '{AMQP_HEADERS_MAX_PRIORITY}' for queue '{name}'"
                ))
            })?),
        };

        let parsed = QueueArgs {
            dead_letter_exchange: text(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)?,
            dead_letter_routing_key: text(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)?,
            message_ttl: number(AMQP_HEADERS_MESSAGE_TTL)?,
            max_length: number(AMQP_HEADERS_MAX_LENGTH)?.map(|v| v as usize),
            max_length_bytes: number(AMQP_HEADERS_MAX_LENGTH_BYTES)?.map(|v| v as usize),
            max_priority,
        };

        if parsed.dead_letter_routing_key.is_some() && parsed.dead_letter_exchange.is_none() {
            return Err(AmqpError::PreconditionFailed(format!(
                "'{AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY}' for queue '{name}' requires '{AMQP_HEADERS_DEAD_LETTER_EXCHANGE}'"
            )));
        }

        Ok(parsed)
    }
}

fn invalid_arg(queue: &str, key: &str, value: &HeaderValue) -> AmqpError {
    AmqpError::PreconditionFailed(format!(
        "invalid arg '{key}' for queue '{queue}': {value:?}"
    ))
}

struct Subscription {
    tag: String,
    channel: u64,
    prefetch: u16,
    exclusive: bool,
    in_flight: usize,
    outbox: Outbox,
}

impl Subscription {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct QueueState {
    declared: QueueDefinition,
    args: QueueArgs,
    owner: Option<u64>,
    ready: BTreeMap<u8, VecDeque<Stored>>,
    subscriptions: Vec<Subscription>,
    cursor: usize,
    had_consumers: bool,
}

impl QueueState {
    fn ready_count(&self) -> usize {
        self.ready.values().map(VecDeque::len).sum()
    }

    fn ready_bytes(&self) -> usize {
        self.ready
            .values()
            .flat_map(|bucket| bucket.iter())
            .map(|stored| stored.message.body.len())
            .sum()
    }

    fn priority_of(&self, props: &MessageProperties) -> u8 {
        match self.args.max_priority {
            Some(max) => props.priority.unwrap_or_default().min(max),
            None => 0,
        }
    }

    fn push_back(&mut self, stored: Stored) {
        let priority = self.priority_of(&stored.message.properties);
        self.ready.entry(priority).or_default().push_back(stored);
    }

    fn push_front(&mut self, stored: Stored) {
        let priority = self.priority_of(&stored.message.properties);
        self.ready.entry(priority).or_default().push_front(stored);
    }

    /// Next message in delivery order: highest priority first, FIFO within a priority.
    fn pop_front(&mut self) -> Option<Stored> {
        let mut bucket = self.ready.last_entry()?;
        let stored = bucket.get_mut().pop_front();
        if bucket.get().is_empty() {
            bucket.remove();
        }
        stored
    }

    fn take_expired(&mut self, now: Instant) -> Vec<Stored> {
        let mut expired = vec![];
        for bucket in self.ready.values_mut() {
            let (keep, gone): (VecDeque<Stored>, VecDeque<Stored>) = bucket
                .drain(..)
                .partition(|stored| stored.expires_at.is_none_or(|at| at > now));
            *bucket = keep;
            expired.extend(gone);
        }
        self.ready.retain(|_, bucket| !bucket.is_empty());
        expired
    }

    /// Drops messages from the head until the length limits hold again.
    fn take_overflow(&mut self) -> Vec<Stored> {
        let mut overflow = vec![];
        loop {
            let too_long = self
                .args
                .max_length
                .is_some_and(|max| self.ready_count() > max);
            let too_big = self
                .args
                .max_length_bytes
                .is_some_and(|max| self.ready_bytes() > max);
            if !(too_long || too_big) {
                break;
            }
            match self.pop_front() {
                Some(stored) => overflow.push(stored),
                None => break,
            }
        }
        overflow
    }

    fn next_subscription(&mut self) -> Option<usize> {
        let n = self.subscriptions.len();
        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            if self.subscriptions[idx].has_capacity() {
                self.cursor = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    fn dead_letter_target(&self) -> Option<(String, Option<String>)> {
        self.args
            .dead_letter_exchange
            .clone()
            .map(|exchange| (exchange, self.args.dead_letter_routing_key.clone()))
    }

    fn is_equivalent(&self, def: &QueueDefinition) -> bool {
        self.declared.durable == def.durable
            && self.declared.exclusive == def.exclusive
            && self.declared.auto_delete == def.auto_delete
            && self.declared.arguments() == def.arguments()
    }
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    stored: Stored,
}

struct ChannelState {
    connection: u64,
    open: bool,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
}

struct ConnectionState {
    open: bool,
    channels: Vec<u64>,
    lost: watch::Sender<Option<String>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: HashSet<QueueBinding>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    next_id: u64,
    connections_opened: usize,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_channel(&self, channel: u64) -> Result<u64, AmqpError> {
        let ch = self
            .channels
            .get(&channel)
            .ok_or_else(|| AmqpError::ChannelClosed(format!("unknown channel {channel}")))?;
        let connection_open = self
            .connections
            .get(&ch.connection)
            .is_some_and(|c| c.open);
        if !connection_open {
            return Err(AmqpError::ConnectionError("connection closed".to_owned()));
        }
        if !ch.open {
            return Err(AmqpError::ChannelClosed(format!("channel {channel} is closed")));
        }
        Ok(ch.connection)
    }

    fn check_owner(&self, queue: &QueueState, connection: u64) -> Result<(), AmqpError> {
        match queue.owner {
            Some(owner) if owner != connection => Err(AmqpError::ResourceLocked(format!(
                "cannot obtain exclusive access to locked queue '{}'",
                queue.declared.name
            ))),
            _ => Ok(()),
        }
    }

    fn targets(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                vec![]
            });
        }

        let ex = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| AmqpError::NotFound(format!("no exchange '{exchange}'")))?;
        let kind = ex.routing_kind();

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange)
            .filter(|b| match kind {
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                ExchangeKind::XMessageDelayed => false,
            })
            .map(|b| b.queue_name.clone())
            .collect();
        targets.sort();
        targets.dedup();
        Ok(targets)
    }

    /// Routes `message` and returns the queues that received a copy.
    fn route(&mut self, message: Message) -> Result<Vec<String>, AmqpError> {
        let targets = self.targets(&message.exchange, &message.routing_key)?;
        let mut touched = vec![];
        for queue in targets {
            touched.extend(self.enqueue(&queue, message.clone()));
        }
        Ok(touched)
    }

    fn enqueue(&mut self, queue_name: &str, message: Message) -> Vec<String> {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return vec![];
        };

        let now = Instant::now();
        let message_ttl = message
            .properties
            .expiration
            .as_deref()
            .and_then(|e| e.parse::<u64>().ok());
        let ttl = match (queue.args.message_ttl, message_ttl) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        queue.push_back(Stored {
            message,
            expires_at: ttl.map(|ms| now + Duration::from_millis(ms)),
            redelivered: false,
        });
        let overflow = queue.take_overflow();

        let mut touched = vec![queue_name.to_owned()];
        for stored in overflow {
            touched.extend(self.dead_letter(queue_name, stored.message, REASON_MAXLEN));
        }
        touched
    }

    fn dead_letter(&mut self, queue_name: &str, mut message: Message, reason: &str) -> Vec<String> {
        let Some((exchange, routing_key)) = self
            .queues
            .get(queue_name)
            .and_then(QueueState::dead_letter_target)
        else {
            debug!(queue = queue_name, reason, "dropping message without dead letter exchange");
            return vec![];
        };

        record_death(&mut message, queue_name, reason);
        message.properties.expiration = None;
        message.routing_key = routing_key.unwrap_or(message.routing_key);
        message.exchange = exchange;

        let targets = match self.targets(&message.exchange, &message.routing_key) {
            Ok(targets) => targets,
            Err(err) => {
                debug!(error = err.to_string(), "dead letter exchange is missing, dropping");
                return vec![];
            }
        };

        let mut touched = vec![];
        for target in targets {
            // a dead-letter cycle that involves no rejection is dropped
            if target == queue_name && reason != REASON_REJECTED {
                continue;
            }
            touched.extend(self.enqueue(&target, message.clone()));
        }
        touched
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut stored = unacked.stored;
            stored.redelivered = true;
            queue.push_front(stored);
        }
    }

    fn delete_queue(&mut self, name: &str) -> u32 {
        let Some(queue) = self.queues.remove(name) else {
            return 0;
        };
        self.bindings.retain(|b| b.queue_name != name);
        u32::try_from(queue.ready_count()).unwrap_or(u32::MAX)
    }

    fn reap_auto_delete(&mut self, names: &[String]) {
        for name in names {
            let unused = self.queues.get(name).is_some_and(|q| {
                q.declared.auto_delete && q.had_consumers && q.subscriptions.is_empty()
            });
            if unused {
                debug!(queue = %name, "auto-deleting queue");
                self.delete_queue(name);
            }
        }
    }

    fn remove_subscription(&mut self, channel: u64, tag: &str) -> Option<String> {
        for (name, queue) in self.queues.iter_mut() {
            if let Some(idx) = queue
                .subscriptions
                .iter()
                .position(|s| s.channel == channel && s.tag == tag)
            {
                queue.subscriptions.remove(idx);
                return Some(name.clone());
            }
        }
        None
    }

    fn stats(&self, name: &str) -> Option<QueueStats> {
        self.queues.get(name).map(|q| QueueStats {
            name: name.to_owned(),
            message_count: u32::try_from(q.ready_count()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(q.subscriptions.len()).unwrap_or(u32::MAX),
        })
    }
}

fn record_death(message: &mut Message, queue: &str, reason: &str) {
    let headers = &mut message.properties.headers;
    let mut deaths: Vec<HeaderValue> = headers
        .get(HEADER_X_DEATH)
        .and_then(HeaderValue::as_array)
        .map(<[HeaderValue]>::to_vec)
        .unwrap_or_default();

    let existing = deaths.iter().position(|entry| {
        entry.as_table().is_some_and(|t| {
            t.get("queue").and_then(HeaderValue::as_str) == Some(queue)
                && t.get("reason").and_then(HeaderValue::as_str) == Some(reason)
        })
    });

    let entry = match existing {
        Some(idx) => {
            let mut table = deaths.remove(idx).as_table().cloned().unwrap_or_default();
            let count = table.get("count").and_then(HeaderValue::as_i64).unwrap_or_default();
            table.insert("count".to_owned(), HeaderValue::Int(count + 1));
            table
        }
        None => Headers::from([
            ("count".to_owned(), HeaderValue::Int(1)),
            ("reason".to_owned(), HeaderValue::from(reason)),
            ("queue".to_owned(), HeaderValue::from(queue)),
            ("exchange".to_owned(), HeaderValue::from(message.exchange.as_str())),
            (
                "routing-keys".to_owned(),
                HeaderValue::Array(vec![HeaderValue::from(message.routing_key.as_str())]),
            ),
        ]),
    };

    deaths.insert(0, HeaderValue::Table(entry));
    headers.insert(HEADER_X_DEATH.to_owned(), HeaderValue::Array(deaths));
}

/// Shared broker handle; every memory connection, channel and acker points here.
pub(crate) struct Broker {
    state: Mutex<BrokerState>,
    flow: watch::Sender<bool>,
    available: AtomicBool,
}

impl Broker {
    pub(crate) fn new() -> Arc<Broker> {
        let mut state = BrokerState::default();
        for (name, kind) in PREDECLARED_EXCHANGES {
            state.exchanges.insert(
                name.to_owned(),
                ExchangeDefinition::new(name).kind(kind).durable(),
            );
        }

        Arc::new(Broker {
            state: Mutex::new(state),
            flow: watch::channel(false).0,
            available: AtomicBool::new(true),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub(crate) fn set_blocked(&self, blocked: bool) {
        self.flow.send_replace(blocked);
    }

    /// Suspends until the broker lifts flow control.
    pub(crate) async fn wait_unblocked(&self) {
        let mut flow = self.flow.subscribe();
        // the sender lives as long as the broker, so this only ends unblocked
        let _ = flow.wait_for(|blocked| !*blocked).await;
    }

    pub(crate) fn open_connection(
        &self,
    ) -> Result<(u64, watch::Receiver<Option<String>>), AmqpError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let mut state = self.lock();
        let id = state.next_id();
        let (lost, lost_rx) = watch::channel(None);
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                channels: vec![],
                lost,
            },
        );
        state.connections_opened += 1;
        Ok((id, lost_rx))
    }

    pub(crate) fn open_channel(&self, connection: u64) -> Result<u64, AmqpError> {
        let mut state = self.lock();
        let id = state.next_id();
        let conn = state
            .connections
            .get_mut(&connection)
            .filter(|c| c.open)
            .ok_or_else(|| AmqpError::ConnectionError("connection closed".to_owned()))?;
        conn.channels.push(id);
        state.channels.insert(
            id,
            ChannelState {
                connection,
                open: true,
                next_tag: 0,
                unacked: HashMap::new(),
            },
        );
        Ok(id)
    }

    pub(crate) fn is_connection_open(&self, connection: u64) -> bool {
        self.lock()
            .connections
            .get(&connection)
            .is_some_and(|c| c.open)
    }

    pub(crate) fn is_channel_open(&self, channel: u64) -> bool {
        self.lock().check_channel(channel).is_ok()
    }

    pub(crate) fn open_connections(&self) -> usize {
        self.lock().connections.values().filter(|c| c.open).count()
    }

    pub(crate) fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    pub(crate) fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(QueueState::ready_count)
    }

    pub(crate) fn close_channel(self: &Arc<Self>, channel: u64) {
        let mut state = self.lock();
        self.close_channel_locked(&mut state, channel);
    }

    pub(crate) fn close_connection(self: &Arc<Self>, connection: u64, reason: &str) {
        let mut state = self.lock();
        self.close_connection_locked(&mut state, connection, reason);
    }

    /// Drops every open connection, as a broker restart or network partition would.
    pub(crate) fn sever_connections(self: &Arc<Self>, reason: &str) {
        let mut state = self.lock();
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(id, _)| *id)
            .collect();
        for connection in open {
            self.close_connection_locked(&mut state, connection, reason);
        }
    }

    pub(crate) fn declare_exchange(
        self: &Arc<Self>,
        channel: u64,
        def: &ExchangeDefinition,
    ) -> Result<(), AmqpError> {
        let mut state = self.lock();
        state.check_channel(channel)?;
        let result = declare_exchange_locked(&mut state, def);
        self.close_on_error(&mut state, channel, result)
    }

    pub(crate) fn delete_exchange(self: &Arc<Self>, channel: u64, name: &str) -> Result<(), AmqpError> {
        let mut state = self.lock();
        state.check_channel(channel)?;
        let result = if name.is_empty() || name.starts_with("amq.") {
            Err(AmqpError::AccessRefused(format!(
                "exchange '{name}' cannot be deleted"
            )))
        } else {
            state.exchanges.remove(name);
            state.bindings.retain(|b| b.exchange_name != name);
            Ok(())
        };
        self.close_on_error(&mut state, channel, result)
    }

    pub(crate) fn declare_queue(
        self: &Arc<Self>,
        channel: u64,
        def: &QueueDefinition,
    ) -> Result<QueueStats, AmqpError> {
        let mut state = self.lock();
        let connection = state.check_channel(channel)?;
        let result = declare_queue_locked(&mut state, connection, def);
        self.close_on_error(&mut state, channel, result)
    }

    pub(crate) fn delete_queue(self: &Arc<Self>, channel: u64, name: &str) -> Result<u32, AmqpError> {
        let mut state = self.lock();
        let connection = state.check_channel(channel)?;
        let owned = match state.queues.get(name) {
            Some(queue) => state.check_owner(queue, connection),
            None => Ok(()),
        };
        let result = match owned {
            Ok(()) => Ok(state.delete_queue(name)),
            Err(err) => Err(err),
        };
        self.close_on_error(&mut state, channel, result)
    }

    pub(crate) fn bind_queue(self: &Arc<Self>, channel: u64, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.lock();
        let connection = state.check_channel(channel)?;
        let result = bind_queue_locked(&mut state, connection, binding);
        self.close_on_error(&mut state, channel, result)
    }

    pub(crate) fn publish(self: &Arc<Self>, channel: u64, message: Message) -> Result<(), AmqpError> {
        let mut state = self.lock();
        state.check_channel(channel)?;

        let delay = state
            .exchanges
            .get(&message.exchange)
            .filter(|ex| ex.kind == ExchangeKind::XMessageDelayed)
            .and_then(|_| message.properties.headers.get(HEADER_DELAY))
            .and_then(HeaderValue::as_i64)
            .and_then(|ms| u64::try_from(ms).ok())
            .filter(|ms| *ms > 0);

        if let Some(ms) = delay {
            drop(state);
            let broker = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let mut state = broker.lock();
                if let Ok(touched) = state.route(message) {
                    broker.dispatch(&mut state, touched);
                }
            });
            return Ok(());
        }

        let result = state.route(message);
        let result = result.map(|touched| self.dispatch(&mut state, touched));
        self.close_on_error(&mut state, channel, result)
    }

    pub(crate) fn consume(
        self: &Arc<Self>,
        channel: u64,
        queue: &str,
        tag: &str,
        prefetch: u16,
        exclusive: bool,
    ) -> Result<Inbox, AmqpError> {
        let mut state = self.lock();
        let connection = state.check_channel(channel)?;
        let result = consume_locked(&mut state, connection, channel, queue, tag, prefetch, exclusive);
        let result = result.map(|inbox| {
            self.dispatch(&mut state, vec![queue.to_owned()]);
            inbox
        });
        self.close_on_error(&mut state, channel, result)
    }

    pub(crate) fn cancel(self: &Arc<Self>, channel: u64, tag: &str) -> Result<(), AmqpError> {
        let mut state = self.lock();
        state.check_channel(channel)?;
        if let Some(queue) = state.remove_subscription(channel, tag) {
            state.reap_auto_delete(&[queue]);
        }
        Ok(())
    }

    pub(crate) fn queue_stats(self: &Arc<Self>, channel: u64, queue: &str) -> Result<QueueStats, AmqpError> {
        let mut state = self.lock();
        state.check_channel(channel)?;
        self.dispatch(&mut state, vec![queue.to_owned()]);
        let result = state
            .stats(queue)
            .ok_or_else(|| AmqpError::NotFound(format!("no queue '{queue}'")));
        self.close_on_error(&mut state, channel, result)
    }

    pub(crate) fn purge_queue(self: &Arc<Self>, channel: u64, queue: &str) -> Result<u32, AmqpError> {
        let mut state = self.lock();
        state.check_channel(channel)?;
        let result = match state.queues.get_mut(queue) {
            Some(q) => {
                let purged = q.ready_count();
                q.ready.clear();
                Ok(u32::try_from(purged).unwrap_or(u32::MAX))
            }
            None => Err(AmqpError::NotFound(format!("no queue '{queue}'"))),
        };
        self.close_on_error(&mut state, channel, result)
    }

    pub(crate) fn settle(
        self: &Arc<Self>,
        channel: u64,
        delivery_tag: u64,
        settlement: Settlement,
    ) -> Result<(), AmqpError> {
        let mut state = self.lock();
        state.check_channel(channel)?;

        let unacked = state
            .channels
            .get_mut(&channel)
            .and_then(|ch| ch.unacked.remove(&delivery_tag));
        let Some(unacked) = unacked else {
            let err = AmqpError::PreconditionFailed(format!("unknown delivery tag {delivery_tag}"));
            self.close_channel_locked(&mut state, channel);
            return Err(err);
        };

        if let Some(sub) = state.queues.get_mut(&unacked.queue).and_then(|q| {
            q.subscriptions
                .iter_mut()
                .find(|s| s.channel == channel && s.tag == unacked.consumer_tag)
        }) {
            sub.in_flight = sub.in_flight.saturating_sub(1);
        }

        let mut touched = vec![unacked.queue.clone()];
        match settlement {
            Settlement::Ack => {}
            Settlement::Requeue => state.requeue(unacked),
            Settlement::Discard => {
                touched.extend(state.dead_letter(
                    &unacked.queue,
                    unacked.stored.message,
                    REASON_REJECTED,
                ));
            }
        }

        self.dispatch(&mut state, touched);
        Ok(())
    }

    fn close_on_error<T>(
        self: &Arc<Self>,
        state: &mut BrokerState,
        channel: u64,
        result: Result<T, AmqpError>,
    ) -> Result<T, AmqpError> {
        if let Err(err) = &result {
            if err.closes_channel() {
                debug!(channel, error = err.to_string(), "closing channel after error");
                self.close_channel_locked(state, channel);
            }
        }
        result
    }

    fn close_channel_locked(self: &Arc<Self>, state: &mut BrokerState, channel: u64) {
        let Some(ch) = state.channels.get_mut(&channel).filter(|ch| ch.open) else {
            return;
        };
        ch.open = false;

        let mut unacked: Vec<(u64, Unacked)> = ch.unacked.drain().collect();
        // requeue newest first so the oldest ends up at the head again
        unacked.sort_by(|a, b| b.0.cmp(&a.0));

        let mut touched = vec![];
        for (name, queue) in state.queues.iter_mut() {
            let before = queue.subscriptions.len();
            queue.subscriptions.retain(|s| s.channel != channel);
            if queue.subscriptions.len() != before {
                touched.push(name.clone());
            }
        }

        for (_, entry) in unacked {
            touched.push(entry.queue.clone());
            state.requeue(entry);
        }

        state.reap_auto_delete(&touched);
        self.dispatch(state, touched);
    }

    fn close_connection_locked(self: &Arc<Self>, state: &mut BrokerState, connection: u64, reason: &str) {
        let Some(conn) = state.connections.get_mut(&connection).filter(|c| c.open) else {
            return;
        };
        conn.open = false;
        let channels = conn.channels.clone();

        for channel in channels {
            self.close_channel_locked(state, channel);
        }

        let exclusive: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            state.delete_queue(&name);
        }

        if let Some(conn) = state.connections.get(&connection) {
            conn.lost.send_replace(Some(reason.to_owned()));
        }
    }

    /// Delivers ready messages of every touched queue to subscriptions with spare
    /// prefetch, dead-lettering expired messages on the way.
    fn dispatch(self: &Arc<Self>, state: &mut BrokerState, touched: Vec<String>) {
        let mut pending: VecDeque<String> = touched.into();
        let mut seen = HashSet::new();

        while let Some(name) = pending.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }

            let now = Instant::now();
            let expired = match state.queues.get_mut(&name) {
                Some(queue) => queue.take_expired(now),
                None => continue,
            };
            for stored in expired {
                pending.extend(state.dead_letter(&name, stored.message, REASON_EXPIRED));
            }

            self.deliver_ready(state, &name);
        }
    }

    fn deliver_ready(self: &Arc<Self>, state: &mut BrokerState, name: &str) {
        let BrokerState { queues, channels, .. } = state;
        let Some(queue) = queues.get_mut(name) else {
            return;
        };

        while queue.ready_count() > 0 {
            let Some(idx) = queue.next_subscription() else {
                break;
            };
            let Some(stored) = queue.pop_front() else {
                break;
            };

            let sub = &mut queue.subscriptions[idx];
            let Some(channel) = channels.get_mut(&sub.channel) else {
                queue.push_front(stored);
                break;
            };

            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            let delivery = RawDelivery {
                delivery_tag,
                exchange: stored.message.exchange.clone(),
                routing_key: stored.message.routing_key.clone(),
                redelivered: stored.redelivered,
                properties: stored.message.properties.clone(),
                body: stored.message.body.clone(),
                acker: Arc::new(MemoryAcker {
                    broker: Arc::clone(self),
                    channel: sub.channel,
                    delivery_tag,
                }),
            };

            if sub.outbox.send(Ok(delivery)).is_err() {
                // the receiving stream was dropped without a cancel
                queue.subscriptions.remove(idx);
                queue.push_front(stored);
                continue;
            }

            sub.in_flight += 1;
            channel.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: name.to_owned(),
                    consumer_tag: sub.tag.clone(),
                    stored,
                },
            );
        }
    }
}

fn declare_exchange_locked(state: &mut BrokerState, def: &ExchangeDefinition) -> Result<(), AmqpError> {
    if def.passive {
        return if state.exchanges.contains_key(&def.name) {
            Ok(())
        } else {
            Err(AmqpError::NotFound(format!("no exchange '{}'", def.name)))
        };
    }

    if def.name.is_empty() || def.name.starts_with("amq.") {
        return Err(AmqpError::AccessRefused(format!(
            "exchange name '{}' is reserved",
            def.name
        )));
    }

    let mut normalized = def.clone();
    normalized.passive = false;

    match state.exchanges.get(&def.name) {
        Some(existing) if *existing == normalized => Ok(()),
        Some(existing) => Err(AmqpError::PreconditionFailed(format!(
            "inequivalent arg for exchange '{}': declared {:?}/durable={}, requested {:?}/durable={}",
            def.name, existing.kind, existing.durable, def.kind, def.durable
        ))),
        None => {
            state.exchanges.insert(def.name.clone(), normalized);
            Ok(())
        }
    }
}

fn declare_queue_locked(
    state: &mut BrokerState,
    connection: u64,
    def: &QueueDefinition,
) -> Result<QueueStats, AmqpError> {
    if let Some(queue) = state.queues.get(&def.name) {
        state.check_owner(queue, connection)?;
        if !def.passive && !queue.is_equivalent(def) {
            return Err(AmqpError::PreconditionFailed(format!(
                "inequivalent arg for queue '{}'",
                def.name
            )));
        }
    } else if def.passive {
        return Err(AmqpError::NotFound(format!("no queue '{}'", def.name)));
    } else {
        let args = QueueArgs::parse(&def.name, &def.arguments())?;
        let mut declared = def.clone();
        declared.passive = false;
        state.queues.insert(
            def.name.clone(),
            QueueState {
                declared,
                args,
                owner: def.exclusive.then_some(connection),
                ready: BTreeMap::new(),
                subscriptions: vec![],
                cursor: 0,
                had_consumers: false,
            },
        );
    }

    state
        .stats(&def.name)
        .ok_or_else(|| AmqpError::NotFound(format!("no queue '{}'", def.name)))
}

fn bind_queue_locked(
    state: &mut BrokerState,
    connection: u64,
    binding: &QueueBinding,
) -> Result<(), AmqpError> {
    let queue = state
        .queues
        .get(&binding.queue_name)
        .ok_or_else(|| AmqpError::NotFound(format!("no queue '{}'", binding.queue_name)))?;
    state.check_owner(queue, connection)?;

    if binding.exchange_name.is_empty() {
        return Err(AmqpError::AccessRefused(
            "operation not permitted on the default exchange".to_owned(),
        ));
    }
    if !state.exchanges.contains_key(&binding.exchange_name) {
        return Err(AmqpError::NotFound(format!(
            "no exchange '{}'",
            binding.exchange_name
        )));
    }

    state.bindings.insert(binding.clone());
    Ok(())
}

fn consume_locked(
    state: &mut BrokerState,
    connection: u64,
    channel: u64,
    queue: &str,
    tag: &str,
    prefetch: u16,
    exclusive: bool,
) -> Result<Inbox, AmqpError> {
    let reused = state
        .queues
        .values()
        .flat_map(|q| q.subscriptions.iter())
        .any(|s| s.channel == channel && s.tag == tag);
    if reused {
        return Err(AmqpError::AccessRefused(format!(
            "attempt to reuse consumer tag '{tag}'"
        )));
    }

    let q = state
        .queues
        .get(queue)
        .ok_or_else(|| AmqpError::NotFound(format!("no queue '{queue}'")))?;
    state.check_owner(q, connection)?;

    let q = state
        .queues
        .get_mut(queue)
        .ok_or_else(|| AmqpError::NotFound(format!("no queue '{queue}'")))?;
    if q.subscriptions.iter().any(|s| s.exclusive) || (exclusive && !q.subscriptions.is_empty()) {
        return Err(AmqpError::AccessRefused(format!(
            "queue '{queue}' in exclusive use"
        )));
    }

    let (outbox, inbox) = mpsc::unbounded_channel();
    q.subscriptions.push(Subscription {
        tag: tag.to_owned(),
        channel,
        prefetch,
        exclusive,
        in_flight: 0,
        outbox,
    });
    q.had_consumers = true;

    Ok(inbox)
}

/// Settles one delivery of the memory broker.
struct MemoryAcker {
    broker: Arc<Broker>,
    channel: u64,
    delivery_tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.broker
            .settle(self.channel, self.delivery_tag, Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.reject(requeue).await
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        let settlement = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        };
        self.broker
            .settle(self.channel, self.delivery_tag, settlement)
    }
}
