// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Adapter
//!
//! This module provides the error taxonomy shared by every layer of the adapter.
//! The `AmqpError` enum represents all failure scenarios of connection, channel,
//! topology, publishing and consuming operations, and `ErrorKind` groups them into
//! the recovery classes the adapter acts upon.

use thiserror::Error;

/// Coarse classification of an [`AmqpError`], used to decide how to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport-level loss. Retried with backoff.
    Connection,
    /// Protocol violation. The channel must be recreated and topology re-asserted.
    Channel,
    /// The caller's message handler failed.
    Handler,
    /// Malformed static configuration. Fatal, never retried.
    Configuration,
    /// Misuse of the adapter API or a condition the caller must act upon.
    Usage,
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Channel-level variants mirror the AMQP soft-error reply codes, so callers can
/// distinguish a conflicting redeclare (`PreconditionFailed`) from a missing entity
/// (`NotFound`) without inspecting strings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing or keeping a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The channel was closed by the broker or by a previous failure
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// An entity was redeclared with arguments that differ from the existing one
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A referenced exchange or queue does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The broker refused access to the resource
    #[error("access refused: {0}")]
    AccessRefused(String),

    /// The resource is exclusively owned by another connection
    #[error("resource locked: {0}")]
    ResourceLocked(String),

    /// A static exchange/queue/binding definition or configuration value is invalid
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The adapter has not been connected or has permanently lost its connection
    #[error("adapter is not connected")]
    NotConnected,

    /// The adapter was closed by the caller
    #[error("adapter is closed")]
    Closed,

    /// The broker negatively confirmed a published message
    #[error("publish of message `{0}` was nacked by the broker")]
    PublishNacked(String),

    /// Error encoding or decoding a message envelope
    #[error("failure to (de)serialize payload: {0}")]
    Serialization(String),

    /// A terminal action was attempted on a delivery that was already settled
    #[error("delivery `{0}` was already settled")]
    AlreadySettled(u64),

    /// No consumer is registered under the given tag
    #[error("consumer `{0}` not found")]
    ConsumerNotFound(String),

    /// The caller's handler failed while processing a message
    #[error("handler failure: {0}")]
    HandlerError(String),
}

impl AmqpError {
    /// Returns the recovery class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AmqpError::ConnectionError(_) => ErrorKind::Connection,
            AmqpError::ChannelClosed(_)
            | AmqpError::PreconditionFailed(_)
            | AmqpError::NotFound(_)
            | AmqpError::AccessRefused(_)
            | AmqpError::ResourceLocked(_) => ErrorKind::Channel,
            AmqpError::HandlerError(_) => ErrorKind::Handler,
            AmqpError::InvalidConfiguration(_) => ErrorKind::Configuration,
            AmqpError::NotConnected
            | AmqpError::Closed
            | AmqpError::PublishNacked(_)
            | AmqpError::Serialization(_)
            | AmqpError::AlreadySettled(_)
            | AmqpError::ConsumerNotFound(_) => ErrorKind::Usage,
        }
    }

    /// True when retrying the same operation after recovery is expected to succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_) | AmqpError::ChannelClosed(_)
        )
    }

    /// True when the channel that produced this error is no longer usable.
    pub fn closes_channel(&self) -> bool {
        self.kind() == ErrorKind::Channel
    }
}

impl From<serde_json::Error> for AmqpError {
    fn from(err: serde_json::Error) -> Self {
        AmqpError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for AmqpError {
    fn from(err: config::ConfigError) -> Self {
        AmqpError::InvalidConfiguration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_recovery_kinds() {
        assert_eq!(
            AmqpError::ConnectionError("reset".into()).kind(),
            ErrorKind::Connection
        );
        assert_eq!(
            AmqpError::PreconditionFailed("q".into()).kind(),
            ErrorKind::Channel
        );
        assert_eq!(
            AmqpError::InvalidConfiguration("x".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(AmqpError::Closed.kind(), ErrorKind::Usage);
    }

    #[test]
    fn only_loss_is_transient() {
        assert!(AmqpError::ConnectionError("reset".into()).is_transient());
        assert!(AmqpError::ChannelClosed("gone".into()).is_transient());
        assert!(!AmqpError::PreconditionFailed("q".into()).is_transient());
        assert!(!AmqpError::NotFound("q".into()).is_transient());
        assert!(AmqpError::NotFound("q".into()).closes_channel());
    }
}
