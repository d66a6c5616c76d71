// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides types for defining RabbitMQ queues and their bindings.
//! High-level queue options (dead-lettering, TTL, max length, priority) are mapped
//! onto the `x-*` declare arguments understood by the broker.

use crate::{
    errors::AmqpError,
    headers::{HeaderValue, Headers},
};
use serde::{Deserialize, Serialize};

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";
/// Constant for the argument used to turn a queue into a priority queue
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";

/// Suffix appended to a queue name to build its companion dead letter queue
pub const DLQ_SUFFIX: &str = "-dlq";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions.
/// It supports standard queue options as well as message TTL, max length, priorities
/// and Dead Letter Queues (DLQ).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) message_ttl: Option<u32>,
    pub(crate) max_length: Option<u32>,
    pub(crate) max_length_bytes: Option<u32>,
    pub(crate) max_priority: Option<u8>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
    #[serde(rename = "with_dlq")]
    pub(crate) dlq: bool,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete once its last consumer is cancelled.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists, without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    ///
    /// Expired messages are dead-lettered when a dead letter exchange is configured.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of ready messages the queue can hold.
    ///
    /// When this limit is reached, the oldest messages are dropped,
    /// or dead-lettered if configured.
    pub fn max_length(mut self, max: u32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum total body size in bytes of the ready messages.
    pub fn max_length_bytes(mut self, max_bytes: u32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Turns the queue into a priority queue accepting priorities `0..=max`.
    pub fn max_priority(mut self, max: u8) -> Self {
        self.max_priority = Some(max);
        self
    }

    /// Routes rejected, expired and overflowing messages to `exchange`.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Replaces the routing key of dead-lettered messages.
    pub fn dead_letter_routing_key(mut self, key: &str) -> Self {
        self.dead_letter_routing_key = Some(key.to_owned());
        self
    }

    /// Adds a Dead Letter Queue (DLQ) to the queue.
    ///
    /// The DLQ is declared alongside the queue, named after it with the "-dlq" suffix,
    /// and receives messages through the default exchange.
    pub fn with_dlq(mut self) -> Self {
        self.dlq = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Name of the companion dead letter queue, if one was requested.
    pub fn dlq_name(&self) -> Option<String> {
        self.dlq.then(|| format!("{}{}", self.name, DLQ_SUFFIX))
    }

    /// Definition of the companion dead letter queue, if one was requested.
    pub(crate) fn dlq_definition(&self) -> Option<QueueDefinition> {
        self.dlq_name().map(|name| QueueDefinition {
            name,
            durable: self.durable,
            auto_delete: false,
            exclusive: self.exclusive,
            ..Default::default()
        })
    }

    /// Maps the high-level options onto broker declare arguments.
    pub fn arguments(&self) -> Headers {
        let mut args = Headers::new();

        if let Some(dlq) = self.dlq_name() {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                HeaderValue::from(""),
            );
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                HeaderValue::from(dlq),
            );
        }

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                HeaderValue::from(exchange.as_str()),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                HeaderValue::from(key.as_str()),
            );
        }

        if let Some(ttl) = self.message_ttl {
            args.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), HeaderValue::from(ttl));
        }

        if let Some(max) = self.max_length {
            args.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), HeaderValue::from(max));
        }

        if let Some(max) = self.max_length_bytes {
            args.insert(AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(), HeaderValue::from(max));
        }

        if let Some(max) = self.max_priority {
            args.insert(AMQP_HEADERS_MAX_PRIORITY.to_owned(), HeaderValue::from(max));
        }

        args
    }

    /// Rejects contradictory or incomplete definitions before they reach the broker.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.name.is_empty() {
            return Err(AmqpError::InvalidConfiguration(
                "queue name must not be empty".to_owned(),
            ));
        }

        if self.dlq && (self.dead_letter_exchange.is_some() || self.dead_letter_routing_key.is_some())
        {
            return Err(AmqpError::InvalidConfiguration(format!(
                "queue `{}` combines a companion dlq with an explicit dead letter target",
                self.name
            )));
        }

        if self.dead_letter_routing_key.is_some() && self.dead_letter_exchange.is_none() {
            return Err(AmqpError::InvalidConfiguration(format!(
                "queue `{}` sets a dead letter routing key without a dead letter exchange",
                self.name
            )));
        }

        if self.max_priority == Some(0) {
            return Err(AmqpError::InvalidConfiguration(format!(
                "queue `{}` declares a max priority of zero",
                self.name
            )));
        }

        if self.passive && self.dlq {
            return Err(AmqpError::InvalidConfiguration(format!(
                "passive queue `{}` cannot declare a companion dlq",
                self.name
            )));
        }

        Ok(())
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Queue bindings define how messages flow from exchanges to queues based on
/// routing keys and exchange types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    /// These should be set using the `exchange` and `routing_key` methods.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key (or pattern, for topic exchanges) of the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.queue_name.is_empty() || self.exchange_name.is_empty() {
            return Err(AmqpError::InvalidConfiguration(format!(
                "binding requires both a queue and an exchange (queue `{}`, exchange `{}`)",
                self.queue_name, self.exchange_name
            )));
        }

        Ok(())
    }
}
