// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Abstraction
//!
//! The adapter core never talks to a wire client directly. It drives the traits in
//! this module, which mirror the AMQP 0-9-1 connection/channel split:
//!
//! - `Connector`: opens connections (one per adapter session)
//! - `AmqpConnection`: opens channels and reports unexpected loss
//! - `AmqpChannel`: topology, publish, consume, stats
//! - `Acker`: terminal settlement of a single delivery
//!
//! Two implementations are provided: `amqp` on top of `lapin`, and `memory`, an
//! in-process broker used by tests and brokerless deployments.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    headers::Headers,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{fmt, sync::Arc};

pub mod amqp;
pub mod memory;

/// Delivery mode marking a message as persistent
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
/// Delivery mode marking a message as transient
pub const DELIVERY_MODE_TRANSIENT: u8 = 1;

/// Stream of deliveries for a single consumer subscription.
///
/// The stream ends when the subscription is cancelled or its channel closes.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, AmqpError>>;

/// Broker message properties, independent of the wire client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds, encoded as a string like on the wire
    pub expiration: Option<String>,
    pub priority: Option<u8>,
    pub persistent: bool,
    /// Seconds since the unix epoch
    pub timestamp: Option<u64>,
    pub app_id: Option<String>,
    pub headers: Headers,
}

/// Counters reported by a (passive) queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Settles a single delivery on the channel it was received on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message as handed over by the transport, before any envelope decoding.
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    pub acker: Arc<dyn Acker>,
}

impl fmt::Debug for RawDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Opens connections to a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, connection_name: &str) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// An established broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Resolves with a reason once the connection was lost.
    async fn closed(&self) -> String;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel on an established connection.
///
/// Any method returning an error whose [`AmqpError::closes_channel`] is true leaves
/// the channel unusable, like the AMQP channel.close the broker sends in that case.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueStats, AmqpError>;

    /// Deletes the queue, returning the number of ready messages dropped with it.
    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Resolves once the message was handed to the transport (and confirmed, when
    /// publisher confirms are enabled). Suspends while the broker applies flow control.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Applies `prefetch` (0 = unbounded) and subscribes `consumer_tag` to `queue`.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
        exclusive: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, AmqpError>;

    /// Drops every ready message, returning how many were removed.
    async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}
