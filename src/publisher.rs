// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Serializes application payloads to JSON and publishes them to an exchange with a
//! routing key. The current OpenTelemetry context travels in the message headers.

use crate::{
    connection::ConnectionManager,
    errors::AmqpError,
    otel,
    transport::{Headers, MessageProperties, OutboundMessage},
};
use opentelemetry::Context;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Per-publish options passed through to the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Delivery mode 2: the broker writes the message to disk on durable queues.
    pub persistent: bool,
    /// Per-message TTL.
    pub expiration: Option<Duration>,
    pub priority: Option<u8>,
    /// Application message type.
    pub message_type: Option<String>,
    /// Defaults to a random UUID v4.
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: Headers,
    /// Return the message when no queue is bound to the routing key.
    pub mandatory: bool,
}

impl PublishOptions {
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn message_type(mut self, kind: &str) -> Self {
        self.message_type = Some(kind.to_owned());
        self
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// Publishes JSON messages through the managed channel.
#[derive(Debug, Clone)]
pub struct Publisher {
    manager: Arc<ConnectionManager>,
}

impl Publisher {
    /// Creates a publisher working on the channel of `manager`.
    ///
    /// # Parameters
    /// * `manager` - Connection manager supplying the live channel
    ///
    /// # Returns
    /// A shareable publisher
    pub fn new(manager: Arc<ConnectionManager>) -> Arc<Publisher> {
        Arc::new(Publisher { manager })
    }

    /// Publishes `payload` to `exchange` with `routing_key`.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, `""` for the default exchange
    /// * `routing_key` - Routing key of the message
    /// * `payload` - Value serialized to JSON
    /// * `options` - Per-message properties
    ///
    /// # Returns
    /// `false` when the broker side asked the caller to slow down; respecting it is up to
    /// the caller. Submission failures are returned with the exchange name.
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<bool, AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let message = build_message(exchange, routing_key, payload, options, &Context::current())?;

        let channel = self.manager.ensure_live().await?;
        match channel.publish(&message).await {
            Ok(accepted) => {
                if accepted {
                    debug!(exchange, routing_key, "message published");
                } else {
                    warn!(exchange, routing_key, "broker asked to pause publishing");
                }
                Ok(accepted)
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                );
                Err(err)
            }
        }
    }
}

fn build_message<T>(
    exchange: &str,
    routing_key: &str,
    payload: &T,
    options: PublishOptions,
    ctx: &Context,
) -> Result<OutboundMessage, AmqpError>
where
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(payload).map_err(|err| {
        error!(error = err.to_string(), exchange, "failure to serialize payload");
        AmqpError::SerializePayloadError(err.to_string())
    })?;

    let mut headers = options.headers;
    otel::inject(ctx, &mut headers);

    Ok(OutboundMessage {
        exchange: exchange.to_owned(),
        routing_key: routing_key.to_owned(),
        payload,
        mandatory: options.mandatory,
        properties: MessageProperties {
            content_type: JSON_CONTENT_TYPE.to_owned(),
            message_id: options
                .message_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            message_type: options.message_type,
            correlation_id: options.correlation_id,
            persistent: options.persistent,
            expiration: options.expiration,
            priority: options.priority,
            headers,
        },
    })
}
