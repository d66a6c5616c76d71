// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Adapter
//!
//! `AmqpAdapter` is the entry point of the crate. It ties the connection manager,
//! topology registry, publisher and consumer registry together and runs the
//! supervisor that recovers the session:
//!
//! - a lost channel on a healthy connection is replaced by a new channel;
//! - a lost connection is re-established following the `RetryPolicy`.
//!
//! Either way, recorded topology is declared again and every active consumer is
//! subscribed again before the session is handed out as `Connected`.
//!
//! ```no_run
//! use rabbitmq_adapter::{
//!     consumer::{handler_fn, HandlerResult},
//!     AdapterConfig, AmqpAdapter, ConsumeOptions, PublishOptions, QueueDefinition,
//! };
//!
//! # async fn run() -> Result<(), rabbitmq_adapter::errors::AmqpError> {
//! let adapter = AmqpAdapter::new(AdapterConfig::from_env()?);
//! adapter.connect().await?;
//! adapter.create_queue(QueueDefinition::new("calls").durable().with_dlq()).await?;
//!
//! adapter
//!     .consume(
//!         "calls",
//!         handler_fn(|delivery| async move {
//!             let envelope = delivery.envelope::<String>()?;
//!             println!("{}", envelope.payload);
//!             HandlerResult::Ok(())
//!         }),
//!         ConsumeOptions::new().prefetch(20),
//!     )
//!     .await?;
//!
//! adapter
//!     .send_to_queue("calls", &"hello".to_owned(), PublishOptions::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    config::AdapterConfig,
    connection::{ConnectionManager, ConnectionState, Session},
    consumer::ConsumerHandler,
    dispatcher::{subscribe, ConsumeOptions, ConsumerDescriptor, ConsumerRegistry},
    envelope::Envelope,
    errors::AmqpError,
    events::{AdapterEvent, EventEmitter, EventKind, ListenerId},
    exchange::ExchangeDefinition,
    publisher::{envelope_for, PublishOptions, Publisher},
    queue::{QueueBinding, QueueDefinition},
    retry::RetryPolicy,
    topology::{Declaration, TopologyDescriptor, TopologyRegistry},
    transport::{amqp::LapinConnector, Connector, QueueStats},
};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

struct Inner {
    config: AdapterConfig,
    retry: RetryPolicy,
    default_topology: TopologyDescriptor,
    connection: Arc<ConnectionManager>,
    lost: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
    topology: TopologyRegistry,
    consumers: ConsumerRegistry,
    events: Arc<EventEmitter>,
    publisher: Publisher,
    lifecycle: AsyncMutex<()>,
    shutdown: watch::Sender<bool>,
}

/// Builder of an [`AmqpAdapter`].
pub struct AdapterBuilder {
    config: AdapterConfig,
    connector: Option<Arc<dyn Connector>>,
    retry: Option<RetryPolicy>,
    topology: TopologyDescriptor,
}

impl AdapterBuilder {
    /// Connects through `connector` instead of the lapin transport.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Overrides the policy derived from the reconnect configuration.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Topology declared on every `connect()`, before anything else.
    pub fn topology(mut self, topology: TopologyDescriptor) -> Self {
        self.topology = topology;
        self
    }

    pub fn build(self) -> AmqpAdapter {
        let connector = self.connector.unwrap_or_else(|| {
            // connect() validates the config, so an unusable uri is never dialed
            Arc::new(LapinConnector::new(
                &self.config.uri().unwrap_or_default(),
                self.config.publisher_confirms,
            ))
        });
        let retry = self.retry.unwrap_or_else(|| self.config.retry_policy());

        let (connection, lost) = ConnectionManager::new(connector, &self.config.connection_name);
        let connection = Arc::new(connection);
        let events = Arc::new(EventEmitter::default());

        AmqpAdapter {
            inner: Arc::new(Inner {
                publisher: Publisher::new(Arc::clone(&connection), Arc::clone(&events)),
                config: self.config,
                retry,
                default_topology: self.topology,
                connection,
                lost: Mutex::new(Some(lost)),
                topology: TopologyRegistry::default(),
                consumers: ConsumerRegistry::default(),
                events,
                lifecycle: AsyncMutex::new(()),
                shutdown: watch::channel(false).0,
            }),
        }
    }
}

/// Handle to a broker adapter. Clones share the same connection and registries.
#[derive(Clone)]
pub struct AmqpAdapter {
    inner: Arc<Inner>,
}

impl AmqpAdapter {
    pub fn builder(config: AdapterConfig) -> AdapterBuilder {
        AdapterBuilder {
            config,
            connector: None,
            retry: None,
            topology: TopologyDescriptor::default(),
        }
    }

    /// An adapter connecting with lapin to the broker named by `config`.
    pub fn new(config: AdapterConfig) -> AmqpAdapter {
        AmqpAdapter::builder(config).build()
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connects and declares the default topology.
    ///
    /// A no-op while connected; waits for the outcome while a connect or reconnect
    /// is already in progress. The attempt is not retried: its failure is returned
    /// to the caller. Connecting again after the reconnect policy gave up restores
    /// the recorded topology and every registered consumer.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        let inner = &self.inner;
        if inner.connection.is_closed() {
            return Err(AmqpError::Closed);
        }
        inner.config.validate()?;
        inner.default_topology.validate()?;

        if !inner.connection.begin_connect() {
            return inner.connection.wait_connected().await.map(|_| ());
        }

        let _lifecycle = inner.lifecycle.lock().await;
        let initial = inner.connection.generation() == 0;
        match inner.establish(initial).await {
            Ok(session) => {
                if !inner.connection.mark_connected(&session) {
                    inner.abandon(&session).await;
                    return Err(AmqpError::Closed);
                }
                inner.events.emit(AdapterEvent::Connected {
                    reconnected: !initial,
                });
                self.spawn_supervisor();
                Ok(())
            }
            Err(err) => {
                inner.connection.set_state(ConnectionState::Disconnected);
                inner.events.emit(AdapterEvent::Error {
                    context: "connect".to_owned(),
                    error: err.clone(),
                });
                Err(err)
            }
        }
    }

    /// Waits until the adapter is connected, or fails if it is closed or gave up
    /// reconnecting.
    pub async fn wait_connected(&self) -> Result<(), AmqpError> {
        self.inner.connection.wait_connected().await.map(|_| ())
    }

    /// Closes the connection. The adapter does not reconnect afterwards and every
    /// later operation fails with `Closed`.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let inner = &self.inner;
        if inner.connection.is_closed() {
            return Ok(());
        }

        inner.shutdown.send_replace(true);
        inner.connection.shut_down();

        let _lifecycle = inner.lifecycle.lock().await;
        for descriptor in inner.consumers.active() {
            descriptor.deactivate();
        }

        if let Some(session) = inner.connection.take() {
            close_session(&session).await;
            inner.events.emit(AdapterEvent::Disconnected {
                reason: "closed by client".to_owned(),
            });
        }
        inner.connection.set_state(ConnectionState::Disconnected);

        Ok(())
    }

    /// Declares an exchange and records it for re-declaration.
    pub async fn create_exchange(&self, def: ExchangeDefinition) -> Result<(), AmqpError> {
        self.inner.declare_one(Declaration::Exchange(def)).await
    }

    /// Declares a queue (and its companion dead letter queue) and records it for
    /// re-declaration.
    pub async fn create_queue(&self, def: QueueDefinition) -> Result<(), AmqpError> {
        self.inner.declare_one(Declaration::Queue(def)).await
    }

    /// Binds `queue` to `exchange` and records the binding for re-declaration.
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let binding = QueueBinding::new(queue)
            .exchange(exchange)
            .routing_key(routing_key);
        self.inner.declare_one(Declaration::Binding(binding)).await
    }

    /// Declares a whole descriptor. Every definition is validated first, so an
    /// invalid descriptor declares nothing.
    pub async fn declare(&self, topology: &TopologyDescriptor) -> Result<(), AmqpError> {
        topology.validate()?;
        for declaration in topology.declarations() {
            self.inner.declare_one(declaration).await?;
        }
        Ok(())
    }

    /// Deletes a queue and forgets it, returning the number of dropped messages.
    ///
    /// Consumers registered on the queue are cancelled first.
    pub async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        {
            let _lifecycle = self.inner.lifecycle.lock().await;
            for descriptor in self.inner.consumers.remove_queue(name) {
                self.inner.cancel_consumer(&descriptor).await;
            }
        }

        let dropped = self
            .inner
            .connection
            .run(|channel| async move { channel.delete_queue(name).await })
            .await?;
        self.inner.topology.forget_queue(name);
        Ok(dropped)
    }

    /// Deletes an exchange and forgets it together with its bindings.
    pub async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.inner
            .connection
            .run(|channel| async move { channel.delete_exchange(name).await })
            .await?;
        self.inner.topology.forget_exchange(name);
        Ok(())
    }

    /// Publishes `payload` to `exchange` with `routing_key`, returning the message id.
    pub async fn publish<P: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &P,
        options: PublishOptions,
    ) -> Result<String, AmqpError> {
        let envelope = envelope_for(payload, &self.inner.config.source, &options);
        self.inner
            .publisher
            .publish(exchange, routing_key, &envelope, &options)
            .await
    }

    /// Sends `payload` straight to `queue` through the default exchange.
    pub async fn send_to_queue<P: Serialize>(
        &self,
        queue: &str,
        payload: &P,
        options: PublishOptions,
    ) -> Result<String, AmqpError> {
        self.publish("", queue, payload, options).await
    }

    /// Publishes an existing envelope again, keeping its id.
    pub async fn publish_envelope<P: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope<P>,
        options: PublishOptions,
    ) -> Result<String, AmqpError> {
        self.inner
            .publisher
            .publish(exchange, routing_key, envelope, &options)
            .await
    }

    /// Registers `handler` for `queue` and subscribes it, returning the consumer tag.
    ///
    /// The registration survives reconnections until [`Self::cancel`].
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        options: ConsumeOptions,
    ) -> Result<String, AmqpError> {
        let inner = &self.inner;
        if queue.is_empty() {
            return Err(AmqpError::InvalidConfiguration(
                "a queue name is required to consume".to_owned(),
            ));
        }

        loop {
            let session = inner.connection.wait_connected().await?;
            let lifecycle = inner.lifecycle.lock().await;
            if inner.connection.state() != ConnectionState::Connected
                || inner.connection.generation() != session.generation
            {
                continue;
            }

            let descriptor = inner.consumers.register(
                queue,
                Arc::clone(&handler),
                &options,
                inner.config.prefetch,
            )?;

            let result = subscribe(
                Arc::clone(&descriptor),
                &session,
                Arc::clone(&inner.events),
                inner.connection.lost_sender(),
            )
            .await;

            let err = match result {
                Ok(()) => return Ok(descriptor.tag.clone()),
                Err(err) => err,
            };

            descriptor.deactivate();
            inner.consumers.remove(&descriptor.tag);
            drop(lifecycle);

            if err.closes_channel() || !session.connection.is_connected() {
                inner.connection.report_lost(session.generation);
            }
            if !err.is_transient() {
                return Err(err);
            }
            inner.connection.wait_session(session.generation).await?;
        }
    }

    /// Stops new deliveries to the consumer `tag`. Handlers already running finish
    /// and their settlements still reach the broker.
    pub async fn cancel(&self, tag: &str) -> Result<(), AmqpError> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        let descriptor = inner
            .consumers
            .remove(tag)
            .ok_or_else(|| AmqpError::ConsumerNotFound(tag.to_owned()))?;
        inner.cancel_consumer(&descriptor).await;
        Ok(())
    }

    pub async fn get_queue_stats(&self, queue: &str) -> Result<QueueStats, AmqpError> {
        self.inner
            .connection
            .run(|channel| async move { channel.queue_stats(queue).await })
            .await
    }

    /// Drops every ready message of `queue`, returning how many were removed.
    pub async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        let purged = self
            .inner
            .connection
            .run(|channel| async move { channel.purge_queue(queue).await })
            .await?;

        self.inner.events.emit(AdapterEvent::QueuePurged {
            queue: queue.to_owned(),
            message_count: purged,
        });
        Ok(purged)
    }

    /// Registers a listener for every adapter event.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&AdapterEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(listener)
    }

    /// Registers a listener for events of one kind.
    pub fn on_kind<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&AdapterEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_kind(kind, listener)
    }

    /// Removes a listener; returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    fn spawn_supervisor(&self) {
        let Some(lost) = self
            .inner
            .lost
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(supervise(weak, lost, shutdown));
    }
}

impl Inner {
    async fn declare_one(&self, declaration: Declaration) -> Result<(), AmqpError> {
        declaration.validate()?;

        let declaration_ref = &declaration;
        self.connection
            .run(|channel| async move { declaration_ref.apply(channel.as_ref()).await })
            .await?;

        self.topology.record(declaration);
        Ok(())
    }

    /// Stops a consumer already removed from the registry.
    async fn cancel_consumer(&self, descriptor: &ConsumerDescriptor) {
        descriptor.deactivate();

        if let Some(session) = self.connection.current() {
            if let Err(err) = session.channel.cancel(&descriptor.tag).await {
                warn!(
                    error = err.to_string(),
                    consumer_tag = %descriptor.tag,
                    "error to cancel consumer"
                );
                if err.closes_channel() {
                    self.connection.report_lost(session.generation);
                }
            }
        }

        self.events.emit(AdapterEvent::ConsumerCancelled {
            queue: descriptor.queue.clone(),
            consumer_tag: descriptor.tag.clone(),
        });
    }

    /// Opens a session and prepares it: topology first, then consumers.
    async fn establish(&self, initial: bool) -> Result<Arc<Session>, AmqpError> {
        let (connection, channel) = self.connection.open().await?;
        let session = self.connection.install(connection, channel);

        if let Err(err) = self.prepare(&session, initial).await {
            self.connection.take();
            if let Err(close_err) = session.connection.close().await {
                debug!(error = close_err.to_string(), "error closing failed connection");
            }
            return Err(err);
        }

        Ok(session)
    }

    async fn prepare(&self, session: &Session, initial: bool) -> Result<(), AmqpError> {
        if initial {
            for declaration in self.default_topology.declarations() {
                declaration.apply(session.channel.as_ref()).await?;
                self.topology.record(declaration);
            }
        } else {
            self.topology.restore(session.channel.as_ref()).await?;
        }

        for descriptor in self.consumers.active() {
            subscribe(
                descriptor,
                session,
                Arc::clone(&self.events),
                self.connection.lost_sender(),
            )
            .await?;
        }

        Ok(())
    }

    /// Replaces the lost channel of `session` with a new one on the same connection.
    async fn recover_channel(&self, session: &Session) -> Result<(), AmqpError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.connection.is_closed() || self.connection.generation() != session.generation {
            return Ok(());
        }

        info!("recovering amqp channel");
        self.connection.set_state(ConnectionState::Connecting);
        let channel = self.connection.open_channel(&session.connection).await?;
        let recovered = self
            .connection
            .install(Arc::clone(&session.connection), channel);
        self.prepare(&recovered, false).await?;
        // close() takes the recovered session once it gets the lifecycle lock
        self.connection.mark_connected(&recovered);
        Ok(())
    }

    /// Drops a session that was prepared while the adapter was being closed.
    async fn abandon(&self, session: &Session) {
        debug!("adapter closed while connecting, dropping the new session");
        self.connection.take();
        close_session(session).await;
        self.connection.set_state(ConnectionState::Disconnected);
    }
}

async fn close_session(session: &Session) {
    if let Err(err) = session.channel.close().await {
        debug!(error = err.to_string(), "error closing channel");
    }
    if let Err(err) = session.connection.close().await {
        debug!(error = err.to_string(), "error closing connection");
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

enum Loss {
    Connection(String),
    Channel(u64),
}

/// Watches the current session and recovers it until the adapter is closed or
/// dropped, or the retry policy gives up.
async fn supervise(
    weak: Weak<Inner>,
    mut lost: mpsc::UnboundedReceiver<u64>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let Some(session) = weak.upgrade().and_then(|inner| inner.connection.current()) else {
            return;
        };

        let loss = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return,
            reason = session.connection.closed() => Loss::Connection(reason),
            generation = lost.recv() => match generation {
                Some(generation) => Loss::Channel(generation),
                None => return,
            },
        };

        let reason = match loss {
            Loss::Connection(reason) => reason,
            Loss::Channel(generation) if generation != session.generation => continue,
            Loss::Channel(_) if session.connection.is_connected() => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match inner.recover_channel(&session).await {
                    Ok(()) => continue,
                    Err(err) => {
                        inner.events.emit(AdapterEvent::Error {
                            context: "channel recovery".to_owned(),
                            error: err.clone(),
                        });
                        if let Err(close_err) = session.connection.close().await {
                            debug!(error = close_err.to_string(), "error closing connection");
                        }
                        format!("channel recovery failed: {err}")
                    }
                }
            }
            Loss::Channel(_) => "connection lost".to_owned(),
        };
        drop(session);

        {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.connection.is_closed() {
                return;
            }
            inner.connection.take();
            inner.events.emit(AdapterEvent::Disconnected { reason });
        }

        let mut attempt = 1;
        loop {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.connection.is_closed() {
                return;
            }

            if !inner.retry.allows(attempt) {
                *inner.lost.lock().unwrap_or_else(PoisonError::into_inner) = Some(lost);
                inner.connection.set_state(ConnectionState::Disconnected);
                inner.events.emit(AdapterEvent::Error {
                    context: "reconnect".to_owned(),
                    error: AmqpError::ConnectionError(format!(
                        "giving up after {} reconnection attempts",
                        attempt - 1
                    )),
                });
                return;
            }

            inner
                .connection
                .set_state(ConnectionState::Reconnecting { attempt });
            let delay = inner.retry.delay_for(attempt);
            drop(inner);

            debug!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "waiting to reconnect"
            );
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let _lifecycle = inner.lifecycle.lock().await;
            if inner.connection.is_closed() {
                return;
            }

            inner.connection.set_state(ConnectionState::Connecting);
            match inner.establish(false).await {
                Ok(session) => {
                    if !inner.connection.mark_connected(&session) {
                        inner.abandon(&session).await;
                        return;
                    }
                    inner
                        .events
                        .emit(AdapterEvent::Connected { reconnected: true });
                    break;
                }
                Err(err) => {
                    warn!(error = err.to_string(), attempt, "reconnection attempt failed");
                    attempt += 1;
                }
            }
        }
    }
}
