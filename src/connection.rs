// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! `ConnectionManager` owns the connection/channel pair of an adapter and the
//! lifecycle state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//! Connected -> Reconnecting{attempt} -> Connecting -> Connected
//! ```
//!
//! Every successfully opened session gets a new generation number. Operations that
//! failed on a session wait for a newer generation before retrying, which keeps a
//! single failure from being recovered twice.

use crate::{
    errors::AmqpError,
    transport::{AmqpChannel, AmqpConnection, Connector},
};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

/// Lifecycle state of an adapter connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before reconnection attempt number `attempt`.
    Reconnecting { attempt: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    state: ConnectionState,
    generation: u64,
}

/// An open connection with the channel the adapter works on.
pub(crate) struct Session {
    pub(crate) connection: Arc<dyn AmqpConnection>,
    pub(crate) channel: Arc<dyn AmqpChannel>,
    pub(crate) generation: u64,
}

pub(crate) struct ConnectionManager {
    connector: Arc<dyn Connector>,
    connection_name: String,
    status: watch::Sender<Status>,
    session: RwLock<Option<Arc<Session>>>,
    closed: AtomicBool,
    lost: mpsc::UnboundedSender<u64>,
}

impl ConnectionManager {
    /// Creates the manager together with the receiving end of channel loss reports.
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        connection_name: &str,
    ) -> (ConnectionManager, mpsc::UnboundedReceiver<u64>) {
        let (lost, lost_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager {
            connector,
            connection_name: connection_name.to_owned(),
            status: watch::channel(Status {
                state: ConnectionState::Disconnected,
                generation: 0,
            })
            .0,
            session: RwLock::new(None),
            closed: AtomicBool::new(false),
            lost,
        };
        (manager, lost_rx)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub(crate) fn generation(&self) -> u64 {
        self.status.borrow().generation
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| status.state = state);
    }

    /// Moves to `Connecting` unless a connect is already running or done.
    ///
    /// Returns false when the caller should not start a new connect.
    pub(crate) fn begin_connect(&self) -> bool {
        self.status.send_if_modified(|status| {
            if status.state == ConnectionState::Disconnected {
                status.state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        })
    }

    /// Opens a connection and a channel on it.
    pub(crate) async fn open(&self) -> Result<(Arc<dyn AmqpConnection>, Arc<dyn AmqpChannel>), AmqpError> {
        debug!("creating amqp connection...");
        let connection = self
            .connector
            .connect(&self.connection_name)
            .await
            .inspect_err(|err| error!(error = err.to_string(), "failure to connect"))?;
        debug!("amqp connected");

        let channel = self.open_channel(&connection).await?;
        Ok((connection, channel))
    }

    pub(crate) async fn open_channel(
        &self,
        connection: &Arc<dyn AmqpConnection>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = connection
            .create_channel()
            .await
            .inspect_err(|err| error!(error = err.to_string(), "error to create the channel"))?;
        debug!("channel created");
        Ok(channel)
    }

    /// Installs a new session without publishing it as `Connected` yet.
    pub(crate) fn install(
        &self,
        connection: Arc<dyn AmqpConnection>,
        channel: Arc<dyn AmqpChannel>,
    ) -> Arc<Session> {
        let generation = self.generation() + 1;
        let session = Arc::new(Session {
            connection,
            channel,
            generation,
        });
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&session));
        session
    }

    /// Publishes the installed session as connected.
    ///
    /// Returns false, leaving the state alone, once [`Self::shut_down`] has begun.
    pub(crate) fn mark_connected(&self, session: &Session) -> bool {
        self.status.send_if_modified(|status| {
            if self.is_closed() {
                return false;
            }
            *status = Status {
                state: ConnectionState::Connected,
                generation: session.generation,
            };
            true
        })
    }

    pub(crate) fn current(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn take(&self) -> Option<Arc<Session>> {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Marks the adapter as closed; no further session will be handed out.
    pub(crate) fn shut_down(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Waits for a connected session with a generation above `after`.
    ///
    /// Fails with `Closed` after [`Self::shut_down`] and with `NotConnected` while
    /// the adapter is disconnected without a reconnect in progress.
    pub(crate) async fn wait_session(&self, after: u64) -> Result<Arc<Session>, AmqpError> {
        let mut status = self.status.subscribe();

        loop {
            if self.is_closed() {
                return Err(AmqpError::Closed);
            }

            let current = *status.borrow_and_update();
            match current.state {
                ConnectionState::Connected if current.generation > after => {
                    if let Some(session) = self.current().filter(|s| s.generation > after) {
                        return Ok(session);
                    }
                }
                ConnectionState::Disconnected => return Err(AmqpError::NotConnected),
                _ => {}
            }

            if status.changed().await.is_err() {
                return Err(AmqpError::Closed);
            }
        }
    }

    /// Waits until the adapter is connected.
    pub(crate) async fn wait_connected(&self) -> Result<Arc<Session>, AmqpError> {
        self.wait_session(0).await
    }

    /// Reports that the channel of session `generation` is unusable.
    pub(crate) fn report_lost(&self, generation: u64) {
        let _ = self.lost.send(generation);
    }

    pub(crate) fn lost_sender(&self) -> mpsc::UnboundedSender<u64> {
        self.lost.clone()
    }

    /// Runs `op` on the current channel.
    ///
    /// Errors that leave the channel unusable are reported for recovery. Transient
    /// ones are retried on the next session; everything else is returned.
    pub(crate) async fn run<T, F, Fut>(&self, op: F) -> Result<T, AmqpError>
    where
        F: Fn(Arc<dyn AmqpChannel>) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let mut session = self.wait_connected().await?;

        loop {
            let err = match op(Arc::clone(&session.channel)).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.closes_channel()
                || !session.channel.is_open()
                || !session.connection.is_connected()
            {
                self.report_lost(session.generation);
            }

            if !err.is_transient() {
                return Err(err);
            }

            warn!(error = err.to_string(), "channel unavailable, waiting for recovery");
            session = self.wait_session(session.generation).await?;
        }
    }
}
