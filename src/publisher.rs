// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module provides functionality for publishing envelopes to exchanges or
//! directly to queues. Publish options are mapped onto broker message properties
//! and the current OpenTelemetry context is injected into the message headers for
//! distributed request tracking.
//!
//! A publish resolves only once the transport accepted the message (and the broker
//! confirmed it, with publisher confirms enabled). Lost connections and closed
//! channels are waited out and the same envelope is published again.

use crate::{
    connection::ConnectionManager,
    envelope::Envelope,
    errors::AmqpError,
    events::{AdapterEvent, EventEmitter},
    headers::{HeaderValue, Headers},
    otel,
    transport::MessageProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Per-message publish options.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOptions {
    pub(crate) message_id: Option<String>,
    pub(crate) correlation_id: Option<String>,
    pub(crate) reply_to: Option<String>,
    pub(crate) priority: Option<u8>,
    pub(crate) expiration: Option<Duration>,
    pub(crate) persistent: bool,
    pub(crate) headers: Headers,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            message_id: None,
            correlation_id: None,
            reply_to: None,
            priority: None,
            expiration: None,
            persistent: true,
            headers: Headers::new(),
        }
    }
}

impl PublishOptions {
    /// Persistent messages without priority, expiration or extra headers.
    pub fn new() -> PublishOptions {
        PublishOptions::default()
    }

    /// Uses `id` instead of a generated message id.
    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    /// Queue the consumer should send its reply to.
    pub fn reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Per-message TTL, with millisecond resolution.
    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    /// Marks the message transient; it does not survive a broker restart.
    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// Builds the envelope for `payload`, applying the envelope-level options.
pub(crate) fn envelope_for<P>(payload: P, source: &str, options: &PublishOptions) -> Envelope<P> {
    let mut envelope = Envelope::new(payload, source);
    if let Some(id) = &options.message_id {
        envelope.id = id.clone();
    }
    envelope.correlation_id = options.correlation_id.clone();
    envelope.metadata.priority = options.priority;
    envelope.headers = options.headers.clone();
    envelope
}

/// Maps an envelope and its options onto broker message properties.
pub(crate) fn properties_for<P>(
    envelope: &Envelope<P>,
    options: &PublishOptions,
    ctx: &Context,
) -> MessageProperties {
    let mut headers = envelope.headers.clone();
    headers.extend(options.headers.clone());
    otel::inject(ctx, &mut headers);

    MessageProperties {
        content_type: Some(JSON_CONTENT_TYPE.to_owned()),
        message_id: Some(envelope.id.clone()),
        correlation_id: envelope.correlation_id.clone(),
        reply_to: options.reply_to.clone(),
        expiration: options
            .expiration
            .map(|ttl| ttl.as_millis().to_string()),
        priority: options.priority.or(envelope.metadata.priority),
        persistent: options.persistent,
        timestamp: u64::try_from(envelope.metadata.timestamp.timestamp()).ok(),
        app_id: Some(envelope.metadata.source.clone()),
        headers,
    }
}

/// Publishes encoded envelopes through the adapter's current channel.
pub(crate) struct Publisher {
    connection: Arc<ConnectionManager>,
    events: Arc<EventEmitter>,
}

impl Publisher {
    pub(crate) fn new(connection: Arc<ConnectionManager>, events: Arc<EventEmitter>) -> Publisher {
        Publisher { connection, events }
    }

    /// Publishes `envelope` to `exchange`; an empty exchange name targets the queue
    /// named by `routing_key`.
    pub(crate) async fn publish<P: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope<P>,
        options: &PublishOptions,
    ) -> Result<String, AmqpError> {
        if exchange.is_empty() && routing_key.is_empty() {
            return Err(AmqpError::InvalidConfiguration(
                "a queue name is required to publish through the default exchange".to_owned(),
            ));
        }

        let body = envelope.to_bytes()?;
        let properties = properties_for(envelope, options, &Context::current());

        debug!(
            "publishing: {} - exchange: {} - key: {}",
            envelope.id, exchange, routing_key
        );

        let body = &body;
        let properties = &properties;
        self.connection
            .run(|channel| async move {
                channel
                    .publish(exchange, routing_key, body, properties)
                    .await
            })
            .await
            .inspect_err(|err| error!(error = err.to_string(), "error publishing message"))?;

        let event = if exchange.is_empty() {
            AdapterEvent::MessageSent {
                queue: routing_key.to_owned(),
                message_id: envelope.id.clone(),
            }
        } else {
            AdapterEvent::MessagePublished {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                message_id: envelope.id.clone(),
            }
        };
        self.events.emit(event);

        Ok(envelope.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HEADER_RETRY_COUNT;

    #[test]
    fn options_map_onto_properties() {
        let options = PublishOptions::new()
            .message_id("m-1")
            .correlation_id("req-9")
            .reply_to("replies")
            .priority(7)
            .expiration(Duration::from_secs(30))
            .header("tenant", "acme");

        let envelope = envelope_for("hi", "router", &options);
        let props = properties_for(&envelope, &options, &Context::new());

        assert_eq!(envelope.id, "m-1");
        assert_eq!(envelope.metadata.priority, Some(7));
        assert_eq!(props.message_id.as_deref(), Some("m-1"));
        assert_eq!(props.correlation_id.as_deref(), Some("req-9"));
        assert_eq!(props.reply_to.as_deref(), Some("replies"));
        assert_eq!(props.priority, Some(7));
        assert_eq!(props.expiration.as_deref(), Some("30000"));
        assert_eq!(props.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(props.app_id.as_deref(), Some("router"));
        assert!(props.persistent);
        assert!(props.timestamp.is_some());
        assert_eq!(props.headers["tenant"], HeaderValue::from("acme"));
    }

    #[test]
    fn generated_ids_differ_per_publish() {
        let options = PublishOptions::new().transient();

        let a = envelope_for((), "s", &options);
        let b = envelope_for((), "s", &options);

        assert_ne!(a.id, b.id);
        assert!(!properties_for(&a, &options, &Context::new()).persistent);
    }

    #[test]
    fn option_headers_override_envelope_headers() {
        let mut envelope = Envelope::new((), "s");
        envelope
            .headers
            .insert(HEADER_RETRY_COUNT.to_owned(), HeaderValue::Int(1));
        let options = PublishOptions::new().header(HEADER_RETRY_COUNT, 2);

        let props = properties_for(&envelope, &options, &Context::new());
        assert_eq!(props.headers[HEADER_RETRY_COUNT], HeaderValue::Int(2));
    }
}
