// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Seam
//!
//! The connection manager, topology declarer, publisher, and consumer talk to the broker
//! only through the traits in this module. [`crate::channel`] implements them on top of
//! lapin; tests implement them in memory.

use crate::{
    config::BrokerConfig,
    consumer::ConsumeOptions,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueInfo},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};
use tokio::sync::mpsc;

#[cfg(test)]
use mockall::automock;

/// Message headers, as text.
pub type Headers = BTreeMap<String, String>;

/// Stream of deliveries for one consumer. `None` items are empty notifications
/// (e.g. a consumer cancelled by the broker) and carry nothing to settle.
pub type DeliveryStream = BoxStream<'static, Option<Delivery>>;

/// Asynchronous notifications raised by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Error { generation: u64, reason: String },
    Closed { generation: u64 },
}

/// Handle a transport uses to report events for one connection.
///
/// Every connection gets its own generation number, so events coming from a
/// connection that was already replaced can be told apart.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl EventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        EventSink { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn error(&self, reason: impl Into<String>) {
        let _ = self.tx.send(ConnectionEvent::Error {
            generation: self.generation,
            reason: reason.into(),
        });
    }

    pub fn closed(&self) {
        let _ = self.tx.send(ConnectionEvent::Closed {
            generation: self.generation,
        });
    }
}

/// Properties attached to an outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: String,
    pub message_id: String,
    pub message_type: Option<String>,
    pub correlation_id: Option<String>,
    pub persistent: bool,
    pub expiration: Option<Duration>,
    pub priority: Option<u8>,
    pub headers: Headers,
}

/// A serialized message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub mandatory: bool,
    pub properties: MessageProperties,
}

/// A message delivered by the broker. It must be settled exactly once through its acker.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_type: Option<String>,
    pub headers: Headers,
    pub data: Vec<u8>,
    pub acker: Arc<dyn DeliveryAcker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("message_type", &self.message_type)
            .field("headers", &self.headers)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Settles a single delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// Opens connections to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new connection. Asynchronous errors and the closure of the connection
    /// must be reported through `events`.
    async fn connect(
        &self,
        config: &BrokerConfig,
        events: EventSink,
    ) -> Result<Box<dyn BrokerConnection>, AmqpError>;
}

/// A live transport connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A multiplexed session on a connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    /// Hands the message to the broker. `false` asks the caller to pause publishing.
    async fn publish(&self, message: &OutboundMessage) -> Result<bool, AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Stops the broker from delivering to the given consumer.
    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
