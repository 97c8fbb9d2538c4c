// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker Façade
//!
//! `AmqpError` covers every failure the façade can surface to its callers: configuration,
//! connection and channel lifecycle, topology declaration, publishing, and delivery
//! settlement. Transport errors are stringified at the boundary so the enum stays
//! comparable and cloneable.
//!
//! `HandlerError` is the value an application handler returns to reject a delivery.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants carry the target of the failed operation (exchange, queue, consumer)
/// followed by the cause reported by the broker or the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The supplied broker configuration is unusable
    #[error("invalid broker configuration: {0}")]
    InvalidConfig(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The connection manager was shut down and will not connect again
    #[error("connection manager is shut down")]
    ManagerClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer on queue `{0}`: {1}")]
    BindingConsumerError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error encoding an outbound payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error publishing a message to the given exchange
    #[error("failure to publish to exchange `{0}`: {1}")]
    PublishingError(String, String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error closing a channel or a connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// A topic pattern could not be built from the given segments
    #[error("invalid topic pattern: {0}")]
    InvalidPattern(String),
}

/// Failure returned by a message handler.
///
/// Any handler failure makes the consumer reject the delivery; the reason is only
/// logged and recorded on the consumer span.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct HandlerError {
    reason: String,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        HandlerError {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl From<AmqpError> for HandlerError {
    fn from(err: AmqpError) -> Self {
        HandlerError::new(err.to_string())
    }
}
