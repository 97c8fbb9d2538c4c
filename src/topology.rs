// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Idempotent declaration of exchanges, queues, and the bindings between them. Every
//! declaration goes through [`ConnectionManager::ensure_live`], so callers never need to
//! sequence connection setup themselves.
//!
//! Successful declarations are recorded by the connection manager and replayed on every
//! new connection, unless `restore_on_reconnect` is disabled in the configuration.

use crate::{
    connection::ConnectionManager,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition, QueueInfo},
    transport::BrokerChannel,
};
use std::sync::Arc;
use tracing::{debug, error};

/// A declaration that was applied to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    Binding(QueueBinding),
}

/// Declares exchanges, queues, and bindings on the managed channel.
#[derive(Debug, Clone)]
pub struct TopologyDeclarer {
    manager: Arc<ConnectionManager>,
}

impl TopologyDeclarer {
    /// Creates a declarer working on the channel of `manager`.
    ///
    /// # Parameters
    /// * `manager` - Connection manager supplying the live channel
    ///
    /// # Returns
    /// A shareable declarer
    pub fn new(manager: Arc<ConnectionManager>) -> Arc<TopologyDeclarer> {
        Arc::new(TopologyDeclarer { manager })
    }

    /// Declares an exchange.
    ///
    /// Declaring an existing exchange with a different kind is rejected by the broker;
    /// the error is returned unchanged.
    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut channel = self.manager.ensure_live().await?;

        declare_exchange_on(&*channel, def).await?;
        channel.record(Declaration::Exchange(def.clone()));

        Ok(())
    }

    /// Shorthand for a durable exchange of the given kind.
    pub async fn exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), AmqpError> {
        self.declare_exchange(&ExchangeDefinition::new(name).kind(kind))
            .await
    }

    /// Declares a queue and its DLQ, when one is configured.
    ///
    /// # Parameters
    /// * `def` - Queue definition; its dead letter queue is declared first
    ///
    /// # Returns
    /// The broker's view of the queue: name, ready message count and consumer count
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        let mut channel = self.manager.ensure_live().await?;

        let info = declare_queue_on(&*channel, def).await?;
        channel.record(Declaration::Queue(def.clone()));

        Ok(info)
    }

    /// Binds a queue to an exchange.
    ///
    /// # Parameters
    /// * `binding` - Queue, exchange and routing key; the key defaults to `""`
    ///
    /// # Returns
    /// Ok(()) once the broker confirmed the binding
    pub async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut channel = self.manager.ensure_live().await?;

        bind_on(&*channel, binding).await?;
        channel.record(Declaration::Binding(binding.clone()));

        Ok(())
    }

    /// Shorthand for [`TopologyDeclarer::bind`].
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.bind(
            &QueueBinding::new(queue)
                .exchange(exchange)
                .routing_key(routing_key),
        )
        .await
    }
}

/// Applies recorded declarations, in order, to a fresh channel.
pub(crate) async fn replay(
    channel: &dyn BrokerChannel,
    declarations: &[Declaration],
) -> Result<(), AmqpError> {
    for declaration in declarations {
        match declaration {
            Declaration::Exchange(def) => declare_exchange_on(channel, def).await?,
            Declaration::Queue(def) => {
                declare_queue_on(channel, def).await?;
            }
            Declaration::Binding(binding) => bind_on(channel, binding).await?,
        }
    }

    Ok(())
}

async fn declare_exchange_on(
    channel: &dyn BrokerChannel,
    def: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    debug!(exchange = def.name.as_str(), kind = %def.kind, "creating exchange");

    match channel.declare_exchange(def).await {
        Err(err) => {
            error!(
                error = err.to_string(),
                exchange = def.name.as_str(),
                "error to declare the exchange"
            );
            Err(err)
        }
        Ok(()) => {
            debug!(exchange = def.name.as_str(), "exchange was created");
            Ok(())
        }
    }
}

async fn declare_queue_on(
    channel: &dyn BrokerChannel,
    def: &QueueDefinition,
) -> Result<QueueInfo, AmqpError> {
    // the DLQ has to exist before the main queue starts dead-lettering into it
    if let Some(dlq) = def.dead_letter_queue() {
        debug!(queue = dlq.name.as_str(), "creating dead letter queue");
        if let Err(err) = channel.declare_queue(&dlq).await {
            error!(
                error = err.to_string(),
                queue = dlq.name.as_str(),
                "failure to declare dead letter queue"
            );
            return Err(err);
        }
    }

    debug!(queue = def.name.as_str(), "creating queue");
    match channel.declare_queue(def).await {
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = def.name.as_str(),
                "error to declare the queue"
            );
            Err(err)
        }
        Ok(info) => {
            debug!(
                queue = def.name.as_str(),
                messages = info.message_count,
                consumers = info.consumer_count,
                "queue was created"
            );
            Ok(info)
        }
    }
}

async fn bind_on(channel: &dyn BrokerChannel, binding: &QueueBinding) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        binding.queue_name, binding.exchange_name, binding.routing_key
    );

    match channel.bind_queue(binding).await {
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = binding.queue_name.as_str(),
                exchange = binding.exchange_name.as_str(),
                "error to bind queue to exchange"
            );
            Err(err)
        }
        Ok(()) => Ok(()),
    }
}
