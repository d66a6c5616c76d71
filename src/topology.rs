// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module declares exchanges, queues and bindings and remembers every
//! successful declaration so it can be replayed after a reconnection. The main
//! components are:
//! - `TopologyDescriptor`: caller-supplied batch of definitions, loadable with serde
//! - `Declaration`: a single recorded declaration
//! - `TopologyRegistry`: the ordered, de-duplicated record replayed on recovery

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::AmqpChannel,
};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error};

/// A batch of topology definitions.
///
/// Installing a descriptor declares all exchanges, then all queues (companion dead
/// letter queues first), then all bindings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyDescriptor {
    pub exchanges: Vec<ExchangeDefinition>,
    pub queues: Vec<QueueDefinition>,
    pub bindings: Vec<QueueBinding>,
}

impl TopologyDescriptor {
    pub fn new() -> TopologyDescriptor {
        TopologyDescriptor::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }

    /// Validates every definition before anything is sent to the broker.
    pub fn validate(&self) -> Result<(), AmqpError> {
        for def in &self.exchanges {
            def.validate()?;
        }
        for def in &self.queues {
            def.validate()?;
        }
        for binding in &self.bindings {
            binding.validate()?;
        }
        Ok(())
    }

    /// The declarations of this descriptor in installation order.
    pub fn declarations(&self) -> Vec<Declaration> {
        self.exchanges
            .iter()
            .cloned()
            .map(Declaration::Exchange)
            .chain(self.queues.iter().cloned().map(Declaration::Queue))
            .chain(self.bindings.iter().cloned().map(Declaration::Binding))
            .collect()
    }
}

/// A single declaration, as recorded for replay.
#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    Binding(QueueBinding),
}

impl Declaration {
    pub fn validate(&self) -> Result<(), AmqpError> {
        match self {
            Declaration::Exchange(def) => def.validate(),
            Declaration::Queue(def) => def.validate(),
            Declaration::Binding(binding) => binding.validate(),
        }
    }

    /// Declares this entity on `channel`.
    pub(crate) async fn apply(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        match self {
            Declaration::Exchange(def) => {
                debug!("creating exchange: {}", def.name);
                channel.declare_exchange(def).await.inspect_err(|err| {
                    error!(error = err.to_string(), name = %def.name, "error to declare the exchange")
                })?;
                debug!("exchange: {} was created", def.name);
            }
            Declaration::Queue(def) => {
                if let Some(dlq) = def.dlq_definition() {
                    debug!("creating dlq: {}", dlq.name);
                    channel.declare_queue(&dlq).await.inspect_err(|err| {
                        error!(error = err.to_string(), name = %dlq.name, "failure to declare dlq")
                    })?;
                }

                debug!("creating queue: {}", def.name);
                channel.declare_queue(def).await.inspect_err(|err| {
                    error!(error = err.to_string(), name = %def.name, "failure to declare queue")
                })?;
                debug!("queue: {} was created", def.name);
            }
            Declaration::Binding(binding) => {
                debug!(
                    "binding queue: {} - exchange: {} - key: {}",
                    binding.queue_name, binding.exchange_name, binding.routing_key
                );
                channel.bind_queue(binding).await.inspect_err(|err| {
                    error!(error = err.to_string(), queue = %binding.queue_name, "error to bind queue")
                })?;
            }
        }

        Ok(())
    }

    fn involves_queue(&self, name: &str) -> bool {
        match self {
            Declaration::Queue(def) => def.name == name,
            Declaration::Binding(binding) => binding.queue_name == name,
            Declaration::Exchange(_) => false,
        }
    }

    fn involves_exchange(&self, name: &str) -> bool {
        match self {
            Declaration::Exchange(def) => def.name == name,
            Declaration::Binding(binding) => binding.exchange_name == name,
            Declaration::Queue(_) => false,
        }
    }
}

/// Ordered record of successful declarations.
///
/// Identical declarations are stored once. Passive declarations only assert
/// existence and are never recorded.
#[derive(Debug, Default)]
pub(crate) struct TopologyRegistry {
    declarations: Mutex<Vec<Declaration>>,
}

impl TopologyRegistry {
    pub(crate) fn record(&self, declaration: Declaration) {
        let passive = match &declaration {
            Declaration::Exchange(def) => def.passive,
            Declaration::Queue(def) => def.passive,
            Declaration::Binding(_) => false,
        };
        if passive {
            return;
        }

        let mut declarations = self
            .declarations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !declarations.contains(&declaration) {
            declarations.push(declaration);
        }
    }

    /// Drops the queue and its bindings from the record.
    pub(crate) fn forget_queue(&self, name: &str) {
        self.declarations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|declaration| !declaration.involves_queue(name));
    }

    /// Drops the exchange and its bindings from the record.
    pub(crate) fn forget_exchange(&self, name: &str) {
        self.declarations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|declaration| !declaration.involves_exchange(name));
    }

    pub(crate) fn snapshot(&self) -> Vec<Declaration> {
        self.declarations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replays every recorded declaration on `channel`, in registration order.
    pub(crate) async fn restore(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        let declarations = self.snapshot();
        debug!(count = declarations.len(), "restoring topology");

        for declaration in &declarations {
            declaration.apply(channel).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{exchange::ExchangeKind, transport::MockAmqpChannel, transport::QueueStats};
    use mockall::{predicate::function, Sequence};

    fn stats(name: &str) -> QueueStats {
        QueueStats {
            name: name.to_owned(),
            message_count: 0,
            consumer_count: 0,
        }
    }

    #[test]
    fn descriptor_loads_from_json() {
        let descriptor: TopologyDescriptor = serde_json::from_str(
            r#"{
                "exchanges": [{"name": "calls", "kind": "topic", "durable": true}],
                "queues": [{"name": "inbound", "durable": true, "with_dlq": true}],
                "bindings": [{"queue_name": "inbound", "exchange_name": "calls", "routing_key": "calls.inbound.#"}]
            }"#,
        )
        .unwrap();

        assert_eq!(descriptor.exchanges[0].exchange_kind(), ExchangeKind::Topic);
        assert_eq!(descriptor.queues[0].dlq_name().as_deref(), Some("inbound-dlq"));
        assert_eq!(descriptor.bindings[0].key(), "calls.inbound.#");
        assert!(descriptor.validate().is_ok());
        assert_eq!(descriptor.declarations().len(), 3);
    }

    #[test]
    fn descriptor_rejects_invalid_definitions() {
        let descriptor = TopologyDescriptor::new()
            .exchange(ExchangeDefinition::new("calls"))
            .queue_binding(QueueBinding::new("inbound"));

        assert!(matches!(
            descriptor.validate(),
            Err(AmqpError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn registry_records_each_declaration_once() {
        let registry = TopologyRegistry::default();
        let exchange = Declaration::Exchange(ExchangeDefinition::new("calls").topic());

        registry.record(exchange.clone());
        registry.record(exchange.clone());
        registry.record(Declaration::Queue(QueueDefinition::new("q").passive()));

        assert_eq!(registry.snapshot(), vec![exchange]);
    }

    #[test]
    fn forgetting_a_queue_drops_its_bindings() {
        let registry = TopologyRegistry::default();
        registry.record(Declaration::Exchange(ExchangeDefinition::new("calls")));
        registry.record(Declaration::Queue(QueueDefinition::new("q")));
        registry.record(Declaration::Binding(
            QueueBinding::new("q").exchange("calls").routing_key("k"),
        ));

        registry.forget_queue("q");

        assert_eq!(
            registry.snapshot(),
            vec![Declaration::Exchange(ExchangeDefinition::new("calls"))]
        );
    }

    #[tokio::test]
    async fn restore_replays_in_order_with_dlq_first() {
        let registry = TopologyRegistry::default();
        registry.record(Declaration::Exchange(ExchangeDefinition::new("calls")));
        registry.record(Declaration::Queue(QueueDefinition::new("q").with_dlq()));
        registry.record(Declaration::Binding(QueueBinding::new("q").exchange("calls")));

        let mut seq = Sequence::new();
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_exchange()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .with(function(|def: &QueueDefinition| def.name() == "q-dlq"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|def| Ok(stats(def.name())));
        channel
            .expect_declare_queue()
            .with(function(|def: &QueueDefinition| def.name() == "q"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|def| Ok(stats(def.name())));
        channel
            .expect_bind_queue()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        registry.restore(&channel).await.unwrap();
    }

    #[tokio::test]
    async fn restore_stops_at_first_failure() {
        let registry = TopologyRegistry::default();
        registry.record(Declaration::Exchange(ExchangeDefinition::new("calls")));
        registry.record(Declaration::Queue(QueueDefinition::new("q")));

        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_exchange()
            .returning(|_| Err(AmqpError::PreconditionFailed("calls".to_owned())));
        channel.expect_declare_queue().never();

        let err = registry.restore(&channel).await.unwrap_err();
        assert_eq!(err, AmqpError::PreconditionFailed("calls".to_owned()));
    }
}
