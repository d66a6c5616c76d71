// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient AMQP 0-9-1 messaging: topology declaration, JSON envelopes,
//! bounded-prefetch consumers and transparent reconnection.

mod connection;
mod otel;

pub mod adapter;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod headers;
pub mod publisher;
pub mod queue;
pub mod resilience;
pub mod retry;
pub mod topology;
pub mod transport;

pub use adapter::{AdapterBuilder, AmqpAdapter};
pub use config::{AdapterConfig, ReconnectConfig};
pub use connection::ConnectionState;
pub use consumer::{handler_fn, ConsumerHandler, Delivery, HandlerResult};
pub use dispatcher::ConsumeOptions;
pub use envelope::{Envelope, Metadata};
pub use errors::{AmqpError, ErrorKind};
pub use events::{AdapterEvent, EventKind, ListenerId};
pub use exchange::{ExchangeDefinition, ExchangeKind};
pub use headers::{HeaderValue, Headers};
pub use publisher::PublishOptions;
pub use queue::{QueueBinding, QueueDefinition};
pub use retry::RetryPolicy;
pub use topology::{Declaration, TopologyDescriptor};
pub use transport::QueueStats;
