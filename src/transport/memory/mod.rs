// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Transport
//!
//! An in-process broker implementing the subset of AMQP 0-9-1 behaviour the adapter
//! relies on. It lets the adapter run without a RabbitMQ server, and gives tests
//! control over failures a real broker only produces under load or outages:
//! dropped connections, refused reconnects and publisher flow control.
//!
//! ```no_run
//! use rabbitmq_adapter::{transport::memory::MemoryBroker, AdapterConfig, AmqpAdapter};
//!
//! # async fn run() -> Result<(), rabbitmq_adapter::errors::AmqpError> {
//! let broker = MemoryBroker::new();
//! let adapter = AmqpAdapter::builder(AdapterConfig::default())
//!     .connector(broker.connector())
//!     .build();
//! adapter.connect().await?;
//! # Ok(())
//! # }
//! ```

mod broker;
pub(crate) mod routing;

use self::broker::{Broker, Message};
use super::{AmqpChannel, AmqpConnection, Connector, DeliveryStream, MessageProperties, QueueStats};
use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Handle to an in-process broker.
///
/// Clones share the same broker state.
#[derive(Clone)]
pub struct MemoryBroker {
    broker: Arc<Broker>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker {
            broker: Broker::new(),
        }
    }

    /// A connector opening connections to this broker.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: Arc::clone(&self.broker),
        })
    }

    /// While unavailable, new connections are refused. Open ones stay open.
    pub fn set_available(&self, available: bool) {
        self.broker.set_available(available);
    }

    /// Closes every open connection as if the broker went away.
    pub fn sever_connections(&self, reason: &str) {
        self.broker.sever_connections(reason);
    }

    /// Applies flow control: publishes suspend until [`Self::unblock_publishers`].
    pub fn block_publishers(&self) {
        self.broker.set_blocked(true);
    }

    pub fn unblock_publishers(&self) {
        self.broker.set_blocked(false);
    }

    /// Number of connections accepted since the broker was created.
    pub fn connections_opened(&self) -> usize {
        self.broker.connections_opened()
    }

    /// Number of connections currently open.
    pub fn open_connections(&self) -> usize {
        self.broker.open_connections()
    }

    /// Ready (not in-flight) messages held by `queue`, or `None` if it does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.broker.queue_depth(queue)
    }
}

struct MemoryConnector {
    broker: Arc<Broker>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, connection_name: &str) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let (id, lost) = self.broker.open_connection()?;
        debug!(connection = id, name = connection_name, "memory connection opened");

        Ok(Arc::new(MemoryConnection {
            broker: Arc::clone(&self.broker),
            id,
            lost,
        }))
    }
}

struct MemoryConnection {
    broker: Arc<Broker>,
    id: u64,
    lost: watch::Receiver<Option<String>>,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let id = self.broker.open_channel(self.id)?;
        Ok(Arc::new(MemoryChannel {
            broker: Arc::clone(&self.broker),
            id,
        }))
    }

    async fn closed(&self) -> String {
        let mut lost = self.lost.clone();
        let reason = match lost.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "broker dropped".to_owned(),
        };
        reason
    }

    fn is_connected(&self) -> bool {
        self.broker.is_connection_open(self.id)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.close_connection(self.id, "closed by client");
        Ok(())
    }
}

struct MemoryChannel {
    broker: Arc<Broker>,
    id: u64,
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.broker.declare_exchange(self.id, def)
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.broker.delete_exchange(self.id, name)
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueStats, AmqpError> {
        self.broker.declare_queue(self.id, def)
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.broker.delete_queue(self.id, name)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.broker.bind_queue(self.id, binding)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        self.broker.wait_unblocked().await;
        self.broker.publish(
            self.id,
            Message {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                properties: properties.clone(),
                body: body.to_vec(),
            },
        )
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
        exclusive: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let inbox = self
            .broker
            .consume(self.id, queue, consumer_tag, prefetch, exclusive)?;

        let deliveries = stream::unfold(inbox, |mut inbox| async move {
            inbox.recv().await.map(|delivery| (delivery, inbox))
        });

        Ok(Box::pin(deliveries))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.broker.cancel(self.id, consumer_tag)
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, AmqpError> {
        self.broker.queue_stats(self.id, queue)
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        self.broker.purge_queue(self.id, queue)
    }

    fn is_open(&self) -> bool {
        self.broker.is_channel_open(self.id)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.close_channel(self.id);
        Ok(())
    }
}
