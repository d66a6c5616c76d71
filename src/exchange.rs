// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! This module provides types for defining RabbitMQ exchanges. Exchanges are the
//! routing mechanism that determines how published messages are distributed to
//! queues. Definitions are plain data: they can be built with the builder methods
//! or deserialized from a topology descriptor.

use crate::{
    errors::AmqpError,
    headers::{HeaderValue, Headers},
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Constant for the argument used to specify the routing type of a delayed exchange
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges supported by the adapter.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - XMessageDelayed: Delays delivery by the `x-delay` header, then routes by
///   its `x-delayed-type` argument (plugin required)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeKind {
    #[default]
    #[serde(rename = "direct")]
    Direct,
    #[serde(rename = "fanout")]
    Fanout,
    #[serde(rename = "topic")]
    Topic,
    #[serde(rename = "x-delayed-message")]
    XMessageDelayed,
}

impl ExchangeKind {
    /// The AMQP wire name of the exchange type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::XMessageDelayed => "x-delayed-message",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "x-delayed-message" => Ok(ExchangeKind::XMessageDelayed),
            other => Err(AmqpError::InvalidConfiguration(format!(
                "unknown exchange type `{other}`"
            ))),
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure exchange definitions.
/// Two definitions that compare equal declare the same broker entity, which is what makes
/// repeated declaration a no-op.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) auto_delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) params: Headers,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is created as a non-durable Direct exchange.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    /// Sets the exchange type to Topic.
    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Creates a delayed exchange routing like `routing` once the delay elapsed.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn delayed(mut self, routing: ExchangeKind) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            AMQP_HEADERS_DELAYED_EXCHANGE_TYPE.to_owned(),
            HeaderValue::from(routing.as_str()),
        );
        self
    }

    /// Adds a single argument to the exchange declaration.
    pub fn param(mut self, key: &str, value: HeaderValue) -> Self {
        self.params.insert(key.to_owned(), value);
        self
    }

    /// Sets the exchange to auto-delete when the last binding is removed.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// The routing type used once a delayed message is released.
    pub(crate) fn routing_kind(&self) -> ExchangeKind {
        if self.kind != ExchangeKind::XMessageDelayed {
            return self.kind;
        }

        self.params
            .get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE)
            .and_then(HeaderValue::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(ExchangeKind::Direct)
    }

    /// Rejects definitions that can never be declared.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.name.is_empty() {
            return Err(AmqpError::InvalidConfiguration(
                "exchange name must not be empty".to_owned(),
            ));
        }

        if self.kind == ExchangeKind::XMessageDelayed {
            let routing = self
                .params
                .get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE)
                .and_then(HeaderValue::as_str)
                .ok_or_else(|| {
                    AmqpError::InvalidConfiguration(format!(
                        "delayed exchange `{}` requires `{}`",
                        self.name, AMQP_HEADERS_DELAYED_EXCHANGE_TYPE
                    ))
                })?;
            let routing: ExchangeKind = routing.parse()?;
            if routing == ExchangeKind::XMessageDelayed {
                return Err(AmqpError::InvalidConfiguration(format!(
                    "delayed exchange `{}` cannot route as a delayed exchange",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_flags() {
        let def = ExchangeDefinition::new("calls").topic().durable();

        assert_eq!(def.name(), "calls");
        assert_eq!(def.exchange_kind(), ExchangeKind::Topic);
        assert!(def.is_durable());
        assert!(!def.auto_delete);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn delayed_exchange_routes_by_argument() {
        let def = ExchangeDefinition::new("retry").delayed(ExchangeKind::Topic);

        assert_eq!(def.exchange_kind(), ExchangeKind::XMessageDelayed);
        assert_eq!(def.routing_kind(), ExchangeKind::Topic);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_definitions() {
        assert!(matches!(
            ExchangeDefinition::new("").validate(),
            Err(AmqpError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            ExchangeDefinition::new("d")
                .kind(ExchangeKind::XMessageDelayed)
                .validate(),
            Err(AmqpError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn parses_wire_names() {
        assert_eq!("fanout".parse::<ExchangeKind>(), Ok(ExchangeKind::Fanout));
        assert!(matches!(
            "headers".parse::<ExchangeKind>(),
            Err(AmqpError::InvalidConfiguration(_))
        ));

        let def: ExchangeDefinition =
            serde_json::from_str(r#"{"name":"calls","kind":"topic","durable":true}"#).unwrap();
        assert_eq!(def, ExchangeDefinition::new("calls").topic().durable());
        assert!(serde_json::from_str::<ExchangeDefinition>(r#"{"name":"x","kind":"bogus"}"#)
            .is_err());
    }
}
