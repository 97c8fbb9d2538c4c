// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queue declarations, queue-to-exchange bindings, and the queue metadata the broker
//! returns on declaration. Dead Letter Queues (DLQ) are supported so rejected
//! deliveries can be parked by the broker instead of being dropped.

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// A queue declaration argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueArgument {
    Text(String),
    Int(i64),
}

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Queues are durable unless [`QueueDefinition::transient`] is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
}

impl QueueDefinition {
    /// Creates a durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            passive: false,
            ttl: None,
            max_length: None,
            max_length_bytes: None,
            dlq_name: None,
        }
    }

    /// Makes the queue non-durable; it will not survive a broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a Dead Letter Queue (DLQ) to the queue.
    ///
    /// The DLQ receives messages that are rejected without requeue, expired, or
    /// overflowing from the main queue. Its name is the main queue name with a
    /// "-dlq" suffix.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// The definition of the DLQ attached to this queue, if any.
    ///
    /// The DLQ shares the durability of the main queue but none of its limits.
    pub fn dead_letter_queue(&self) -> Option<QueueDefinition> {
        self.dlq_name.as_ref().map(|dlq| QueueDefinition {
            name: dlq.clone(),
            durable: self.durable,
            auto_delete: false,
            exclusive: self.exclusive,
            passive: self.passive,
            ttl: None,
            max_length: None,
            max_length_bytes: None,
            dlq_name: None,
        })
    }

    /// Declaration arguments derived from the definition.
    pub fn arguments(&self) -> Vec<(&'static str, QueueArgument)> {
        let mut args = vec![];

        if let Some(dlq) = &self.dlq_name {
            // dead-letter through the default exchange straight into the DLQ
            args.push((
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
                QueueArgument::Text(String::new()),
            ));
            args.push((
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
                QueueArgument::Text(dlq.clone()),
            ));
        }

        if let Some(ttl) = self.ttl {
            args.push((AMQP_HEADERS_MESSAGE_TTL, QueueArgument::Int(ttl.into())));
        }

        if let Some(max) = self.max_length {
            args.push((AMQP_HEADERS_MAX_LENGTH, QueueArgument::Int(max.into())));
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.push((
                AMQP_HEADERS_MAX_LENGTH_BYTES,
                QueueArgument::Int(max_bytes.into()),
            ));
        }

        args
    }
}

/// Configuration for binding a queue to an exchange.
///
/// The routing key defaults to the empty string, which is what fanout exchanges expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new binding for the given queue.
    ///
    /// The exchange should be set with [`QueueBinding::exchange`].
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

/// Queue metadata reported by the broker when a queue is declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}
