// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Transport
//!
//! This module implements the transport traits on top of `lapin`, the AMQP 0-9-1
//! client. It owns every conversion between the adapter's neutral types and the
//! lapin/amq-protocol types, and maps AMQP reply codes onto [`AmqpError`].

use super::{
    Acker, AmqpChannel, AmqpConnection, Connector, DeliveryStream, MessageProperties,
    QueueStats, RawDelivery, DELIVERY_MODE_PERSISTENT, DELIVERY_MODE_TRANSIENT,
};
use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    headers::{HeaderValue, Headers},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions, QueuePurgeOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, warn};

/// Reply code sent when the adapter closes a connection or channel on purpose
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections to the configured broker URI.
pub struct LapinConnector {
    uri: String,
    confirms: bool,
}

impl LapinConnector {
    /// Creates a connector for `uri`; `confirms` enables publisher confirms on
    /// every channel it opens.
    pub fn new(uri: &str, confirms: bool) -> LapinConnector {
        LapinConnector {
            uri: uri.to_owned(),
            confirms,
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, connection_name: &str) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let connection = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let (lost_tx, lost_rx) = watch::channel(None);
        connection.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection lost");
            lost_tx.send_replace(Some(err.to_string()));
        });

        Ok(Arc::new(LapinConnection {
            connection,
            lost: lost_rx,
            confirms: self.confirms,
        }))
    }
}

struct LapinConnection {
    connection: Connection,
    lost: watch::Receiver<Option<String>>,
    confirms: bool,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = match self.connection.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(map_error(err))
            }
        }?;

        if self.confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(map_error)?;
        }
        debug!("channel created");

        Ok(Arc::new(LapinChannel {
            channel,
            publish_lock: Mutex::new(()),
            confirms: self.confirms,
        }))
    }

    async fn closed(&self) -> String {
        let mut lost = self.lost.clone();
        let reason = match lost.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "connection dropped".to_owned(),
        };
        reason
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.connection
            .close(REPLY_SUCCESS, "adapter closed")
            .await
            .map_err(map_error)
    }
}

struct LapinChannel {
    channel: Channel,
    publish_lock: Mutex<()>,
    confirms: bool,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        self.channel
            .exchange_declare(
                &def.name,
                lapin_exchange_kind(def.kind),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: false,
                },
                to_field_table(&def.params),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                map_error(err)
            })
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(map_error)
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueStats, AmqpError> {
        debug!("creating queue: {}", def.name);

        let queue = self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                to_field_table(&def.arguments()),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                map_error(err)
            })?;

        Ok(QueueStats {
            name: def.name.clone(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(map_error)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                map_error(err)
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        // lapin resolves basic_publish once the frames left its buffer, so holding the
        // lock keeps concurrent publishers from interleaving on this channel.
        let confirm = {
            let _guard = self.publish_lock.lock().await;
            self.channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions {
                        immediate: false,
                        mandatory: false,
                    },
                    body,
                    to_basic_properties(properties),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error publishing message");
                    map_error(err)
                })?
        };

        if self.confirms {
            let confirmation = confirm.await.map_err(map_error)?;
            if confirmation.is_nack() {
                return Err(AmqpError::PublishNacked(
                    properties.message_id.clone().unwrap_or_default(),
                ));
            }
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
        exclusive: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                map_error(err)
            })?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to create the consumer");
                map_error(err)
            })?;

        Ok(consumer
            .map(|result| result.map(to_raw_delivery).map_err(map_error))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_error)
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, AmqpError> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        Ok(QueueStats {
            name: queue.to_owned(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(map_error)
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "adapter closed")
            .await
            .map_err(map_error)
    }
}

struct LapinAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(map_error)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(map_error)
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(map_error)
    }
}

/// Maps a lapin error onto the adapter taxonomy.
///
/// Soft AMQP errors close only the channel; hard errors and I/O failures are
/// treated as connection loss.
pub(crate) fn map_error(err: lapin::Error) -> AmqpError {
    let message = err.to_string();
    match &err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                AmqpError::PreconditionFailed(message)
            }
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => AmqpError::NotFound(message),
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => AmqpError::AccessRefused(message),
            AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED) => {
                AmqpError::ResourceLocked(message)
            }
            AMQPErrorKind::Soft(_) => AmqpError::ChannelClosed(message),
            AMQPErrorKind::Hard(_) => AmqpError::ConnectionError(message),
        },
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidChannel(_) => {
            AmqpError::ChannelClosed(message)
        }
        _ => AmqpError::ConnectionError(message),
    }
}

fn lapin_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::XMessageDelayed => {
            lapin::ExchangeKind::Custom(ExchangeKind::XMessageDelayed.as_str().to_owned())
        }
    }
}

fn to_raw_delivery(delivery: Delivery) -> RawDelivery {
    let Delivery {
        delivery_tag,
        exchange,
        routing_key,
        redelivered,
        properties,
        data,
        acker,
        ..
    } = delivery;

    RawDelivery {
        delivery_tag,
        exchange: exchange.as_str().to_owned(),
        routing_key: routing_key.as_str().to_owned(),
        redelivered,
        properties: from_basic_properties(&properties),
        body: data,
        acker: Arc::new(LapinAcker { acker }),
    }
}

pub(crate) fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default()
        .with_delivery_mode(if props.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        })
        .with_headers(to_field_table(&props.headers));

    if let Some(v) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(v.as_str()));
    }
    if let Some(v) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(v.as_str()));
    }
    if let Some(v) = &props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(v.as_str()));
    }
    if let Some(v) = &props.reply_to {
        basic = basic.with_reply_to(ShortString::from(v.as_str()));
    }
    if let Some(v) = &props.expiration {
        basic = basic.with_expiration(ShortString::from(v.as_str()));
    }
    if let Some(v) = props.priority {
        basic = basic.with_priority(v);
    }
    if let Some(v) = props.timestamp {
        basic = basic.with_timestamp(v);
    }
    if let Some(v) = &props.app_id {
        basic = basic.with_app_id(ShortString::from(v.as_str()));
    }

    basic
}

pub(crate) fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    let text = |v: &Option<ShortString>| v.as_ref().map(|s| s.as_str().to_owned());

    MessageProperties {
        content_type: text(props.content_type()),
        message_id: text(props.message_id()),
        correlation_id: text(props.correlation_id()),
        reply_to: text(props.reply_to()),
        expiration: text(props.expiration()),
        priority: *props.priority(),
        persistent: *props.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT),
        timestamp: *props.timestamp(),
        app_id: text(props.app_id()),
        headers: props
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
    }
}

pub(crate) fn to_field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in headers {
        btree.insert(ShortString::from(key.as_str()), to_amqp_value(value));
    }
    FieldTable::from(btree)
}

pub(crate) fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            from_amqp_value(value).map(|value| (key.as_str().to_owned(), value))
        })
        .collect()
}

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
        HeaderValue::Float(v) => AMQPValue::Double(*v),
        HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.as_str())),
        HeaderValue::Array(v) => AMQPValue::FieldArray(FieldArray::from(
            v.iter().map(to_amqp_value).collect::<Vec<_>>(),
        )),
        HeaderValue::Table(v) => AMQPValue::FieldTable(to_field_table(v)),
    }
}

fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    let value = match value {
        AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::ShortShortUInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::ShortInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::ShortUInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::LongInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::LongUInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
        AMQPValue::Timestamp(v) => HeaderValue::Int(i64::try_from(*v).ok()?),
        AMQPValue::Float(v) => HeaderValue::Float((*v).into()),
        AMQPValue::Double(v) => HeaderValue::Float(*v),
        AMQPValue::ShortString(v) => HeaderValue::String(v.as_str().to_owned()),
        AMQPValue::LongString(v) => {
            HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(v) => {
            HeaderValue::Array(v.as_slice().iter().filter_map(from_amqp_value).collect())
        }
        AMQPValue::FieldTable(v) => HeaderValue::Table(from_field_table(v)),
        _ => return None,
    };

    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_survive_the_lapin_conversion() {
        let mut headers = Headers::new();
        headers.insert("retryCount".into(), HeaderValue::Int(2));
        headers.insert(
            "nested".into(),
            HeaderValue::Table(Headers::from([("k".to_owned(), HeaderValue::from("v"))])),
        );

        let props = MessageProperties {
            content_type: Some("application/json".into()),
            message_id: Some("id-1".into()),
            correlation_id: Some("corr".into()),
            reply_to: Some("replies".into()),
            expiration: Some("1000".into()),
            priority: Some(7),
            persistent: true,
            timestamp: Some(1_700_000_000),
            app_id: Some("billing".into()),
            headers,
        };

        let basic = to_basic_properties(&props);
        assert_eq!(*basic.delivery_mode(), Some(DELIVERY_MODE_PERSISTENT));
        assert_eq!(from_basic_properties(&basic), props);
    }

    #[test]
    fn narrow_integers_widen_to_int() {
        let mut btree = BTreeMap::new();
        btree.insert(ShortString::from("a"), AMQPValue::ShortShortUInt(3));
        btree.insert(ShortString::from("b"), AMQPValue::LongInt(-4));
        btree.insert(ShortString::from("c"), AMQPValue::Void);

        let headers = from_field_table(&FieldTable::from(btree));

        assert_eq!(headers["a"], HeaderValue::Int(3));
        assert_eq!(headers["b"], HeaderValue::Int(-4));
        assert!(!headers.contains_key("c"));
    }
}
