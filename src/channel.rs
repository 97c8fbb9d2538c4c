// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel over lapin
//!
//! lapin-backed implementation of the transport traits: opening connections, creating
//! channels, declaring topology, publishing, consuming, and settling deliveries.

use crate::{
    config::BrokerConfig,
    consumer::ConsumeOptions,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueArgument, QueueBinding, QueueDefinition, QueueInfo},
    transport::{
        BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryAcker, DeliveryStream,
        EventSink, Headers, OutboundMessage,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Reply code sent when the client closes a channel or a connection on purpose.
const AMQP_REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Arc<LapinConnector> {
        Arc::new(LapinConnector)
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        config: &BrokerConfig,
        events: EventSink,
    ) -> Result<Box<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let mut options = ConnectionProperties::default();
        if let Some(name) = &config.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        let conn = match Connection::connect(&config.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;

        // lapin only reports fatal failures here, after which the connection is gone
        conn.on_error(move |err| {
            events.error(err.to_string());
            events.closed();
        });

        debug!("amqp connected");
        Ok(Box::new(LapinConnection { conn }))
    }
}

struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(AMQP_REPLY_SUCCESS, "connection closed by client")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let args = def
            .arguments
            .iter()
            .map(|(key, value)| {
                (
                    ShortString::from(key.clone()),
                    AMQPValue::LongString(LongString::from(value.clone())),
                )
            })
            .collect::<BTreeMap<_, _>>();

        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::from(args),
            )
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(def.name.clone(), err.to_string()))
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        let args = def
            .arguments()
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    QueueArgument::Text(v) => AMQPValue::LongString(LongString::from(v)),
                    QueueArgument::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
                };
                (ShortString::from(key), value)
            })
            .collect::<BTreeMap<_, _>>();

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
                FieldTable::from(args),
            )
            .await
            .map_err(|err| AmqpError::DeclareQueueError(def.name.clone(), err.to_string()))?;

        Ok(QueueInfo {
            name: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
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
                AmqpError::BindingExchangeToQueueError(
                    binding.queue_name.clone(),
                    binding.exchange_name.clone(),
                    err.to_string(),
                )
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<bool, AmqpError> {
        let props = &message.properties;
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(props.content_type.clone()))
            .with_message_id(ShortString::from(props.message_id.clone()))
            .with_headers(to_field_table(&props.headers));

        if props.persistent {
            properties = properties.with_delivery_mode(2);
        }
        if let Some(kind) = &props.message_type {
            properties = properties.with_kind(ShortString::from(kind.clone()));
        }
        if let Some(correlation_id) = &props.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
        }
        if let Some(expiration) = props.expiration {
            properties =
                properties.with_expiration(ShortString::from(expiration.as_millis().to_string()));
        }
        if let Some(priority) = props.priority {
            properties = properties.with_priority(priority);
        }

        // lapin buffers writes internally and never asks the caller to pause
        self.channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    mandatory: message.mandatory,
                    immediate: false,
                },
                &message.payload,
                properties,
            )
            .await
            .map(|_| true)
            .map_err(|err| AmqpError::PublishingError(message.exchange.clone(), err.to_string()))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::BindingConsumerError(queue.to_owned(), err.to_string()))?;

        let stream = consumer.map(|result| match result {
            Ok(delivery) => Some(Delivery {
                delivery_tag: delivery.delivery_tag,
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
                redelivered: delivery.redelivered,
                message_type: delivery.properties.kind().as_ref().map(|k| k.to_string()),
                headers: from_field_table(delivery.properties.headers().as_ref()),
                acker: Arc::new(LapinAcker {
                    acker: delivery.acker.clone(),
                }),
                data: delivery.data,
            }),
            Err(err) => {
                error!(error = err.to_string(), "errors consume msg");
                None
            }
        });

        Ok(stream.boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                AmqpError::BindingConsumerError(consumer_tag.to_owned(), err.to_string())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(AMQP_REPLY_SUCCESS, "channel closed by client")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let btree = headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect::<BTreeMap<_, _>>();

    FieldTable::from(btree)
}

fn from_field_table(table: Option<&FieldTable>) -> Headers {
    let Some(table) = table else {
        return Headers::default();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
                AMQPValue::ShortString(v) => v.to_string(),
                AMQPValue::ShortInt(v) => v.to_string(),
                AMQPValue::LongInt(v) => v.to_string(),
                AMQPValue::LongLongInt(v) => v.to_string(),
                AMQPValue::LongUInt(v) => v.to_string(),
                AMQPValue::Boolean(v) => v.to_string(),
                // nested tables and arrays (e.g. x-death) are not exposed as text
                _ => return None,
            };
            Some((key.to_string(), value))
        })
        .collect()
}
