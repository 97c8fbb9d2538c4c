// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! Registers a consumer on a queue and dispatches every delivery to an application
//! handler. The payload is decoded from JSON, handed to the handler, and the delivery is
//! settled exactly once from the handler's result:
//!
//! - `Ok(())` acks the delivery
//! - `Err(HandlerError)`, an undecodable payload, or a handler panic nacks it
//!
//! A nacked delivery is left to the broker's redelivery and dead-letter policy; the
//! consumer never retries on its own. Each delivery is processed in its own task, so a
//! failing delivery never affects the others.

use crate::{
    connection::{ConnectionManager, ConnectionState},
    errors::{AmqpError, HandlerError},
    otel,
    transport::{Delivery, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-subscription options passed through to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Defaults to `<queue>-<uuid v4>`.
    pub consumer_tag: Option<String>,
    /// Maximum number of unsettled deliveries (basic.qos).
    pub prefetch: Option<u16>,
    pub exclusive: bool,
    /// Let the broker settle deliveries on send; the handler outcome is then only logged.
    pub no_ack: bool,
    /// Requeue rejected deliveries instead of dead-lettering them.
    pub requeue_on_failure: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        ConsumeOptions {
            consumer_tag: None,
            prefetch: None,
            exclusive: false,
            no_ack: false,
            requeue_on_failure: true,
        }
    }
}

impl ConsumeOptions {
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    /// Rejected deliveries are dropped or dead-lettered instead of requeued.
    pub fn dead_letter_on_failure(mut self) -> Self {
        self.requeue_on_failure = false;
        self
    }
}

/// Application callback invoked for every decoded delivery.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync
where
    T: Send + 'static,
{
    async fn handle(&self, payload: T) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, payload: T) -> Result<(), HandlerError> {
        (self)(payload).await
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Nacked,
    /// Settled by the broker on send (`no_ack`).
    AutoAcked,
}

/// Handle to a running subscription.
///
/// Dropping the handle leaves the subscription running; call [`Subscription::cancel`]
/// to stop it.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    token: CancellationToken,
    task_tracker: TaskTracker,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stops consuming and waits for in-flight deliveries to be settled.
    pub async fn cancel(&self) {
        self.token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
    }
}

/// Subscribes handlers to queues on the managed channel.
#[derive(Debug, Clone)]
pub struct Consumer {
    manager: Arc<ConnectionManager>,
}

impl Consumer {
    /// Creates a consumer working on the channel of `manager`.
    ///
    /// # Parameters
    /// * `manager` - Connection manager supplying the live channel
    ///
    /// # Returns
    /// A shareable consumer
    pub fn new(manager: Arc<ConnectionManager>) -> Arc<Consumer> {
        Arc::new(Consumer { manager })
    }

    /// Registers `handler` on `queue`.
    ///
    /// Returns once the broker accepted the consumer; deliveries are handled in the
    /// background. When the connection is restored after a failure, the consumer is
    /// registered again unless `restore_on_reconnect` is disabled. A consumer cancelled
    /// by the broker while the connection stays up is not registered again.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume from
    /// * `handler` - Callback receiving every decoded payload
    /// * `options` - Consumer tag, prefetch and settlement options
    ///
    /// # Returns
    /// A handle to stop the subscription
    pub async fn subscribe<T, H>(
        &self,
        queue: &str,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<Subscription, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T> + 'static,
    {
        let consumer_tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", queue, Uuid::new_v4()));

        let (deliveries, generation) =
            register(&self.manager, queue, &consumer_tag, &options).await?;
        info!(queue, consumer_tag = consumer_tag.as_str(), "subscribed to queue");

        let token = self.manager.shutdown_token().child_token();
        let task_tracker = TaskTracker::new();

        task_tracker.spawn(run_subscription(
            self.manager.clone(),
            SubscriptionContext {
                queue: queue.to_owned(),
                consumer_tag: consumer_tag.clone(),
                options,
                token: token.clone(),
                task_tracker: task_tracker.clone(),
            },
            Arc::new(handler),
            deliveries,
            generation,
        ));

        Ok(Subscription {
            queue: queue.to_owned(),
            consumer_tag,
            token,
            task_tracker,
        })
    }
}

struct SubscriptionContext {
    queue: String,
    consumer_tag: String,
    options: ConsumeOptions,
    token: CancellationToken,
    task_tracker: TaskTracker,
}

/// Registers the consumer on the live channel, returning its deliveries and the
/// generation of the connection they arrive on.
async fn register(
    manager: &Arc<ConnectionManager>,
    queue: &str,
    consumer_tag: &str,
    options: &ConsumeOptions,
) -> Result<(DeliveryStream, u64), AmqpError> {
    let channel = manager.ensure_live().await?;
    let generation = channel.generation();

    if let Some(prefetch) = options.prefetch {
        if let Err(err) = channel.set_prefetch(prefetch).await {
            error!(error = err.to_string(), queue, "failure to configure qos");
            return Err(err);
        }
    }

    match channel.consume(queue, consumer_tag, options).await {
        Ok(deliveries) => Ok((deliveries, generation)),
        Err(err) => {
            error!(error = err.to_string(), queue, "failure to create the consumer");
            Err(err)
        }
    }
}

async fn run_subscription<T, H>(
    manager: Arc<ConnectionManager>,
    ctx: SubscriptionContext,
    handler: Arc<H>,
    mut deliveries: DeliveryStream,
    mut generation: u64,
) where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + 'static,
{
    let queue = ctx.queue.as_str();

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => break,
            next = deliveries.next() => next,
        };

        match next {
            Some(Some(delivery)) => {
                let handler = handler.clone();
                let queue = ctx.queue.clone();
                let options = ctx.options.clone();

                ctx.task_tracker.spawn(async move {
                    if let Err(err) = dispatch(&queue, handler.as_ref(), delivery, &options).await {
                        error!(
                            error = err.to_string(),
                            queue = queue.as_str(),
                            "error consume msg"
                        );
                    }
                });
            }
            Some(None) => debug!(queue, "empty delivery notification, ignoring"),
            None => {
                // the connection it was registered on is still up: the broker cancelled
                // the consumer itself (e.g. the queue was deleted)
                if manager.is_current(generation).await {
                    warn!(queue, "consumer cancelled by the broker, subscription stopped");
                    break;
                }

                if !manager.config().restore_on_reconnect {
                    warn!(queue, "consumer stream ended, subscription stopped");
                    break;
                }

                warn!(queue, "consumer stream ended, waiting for the connection");
                match resubscribe(&manager, &ctx).await {
                    Some((stream, current)) => {
                        deliveries = stream;
                        generation = current;
                    }
                    None => break,
                }
            }
        }
    }

    // cancelled by the caller while the consumer may still be registered
    if ctx.token.is_cancelled()
        && !manager.is_shut_down()
        && manager.state() == ConnectionState::Connected
    {
        if let Ok(channel) = manager.ensure_live().await {
            if let Err(err) = channel.cancel_consumer(&ctx.consumer_tag).await {
                debug!(error = err.to_string(), queue, "failure to cancel the consumer");
            }
        }
    }

    ctx.token.cancel();
    debug!(queue, consumer_tag = ctx.consumer_tag.as_str(), "subscription stopped");
}

/// Registers the consumer again once the manager is connected. `None` when the
/// subscription or the manager was shut down in the meantime, or when the broker
/// rejects the consumer on the new connection.
async fn resubscribe(
    manager: &Arc<ConnectionManager>,
    ctx: &SubscriptionContext,
) -> Option<(DeliveryStream, u64)> {
    loop {
        let connected = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => return None,
            connected = manager.wait_for_connected() => connected,
        };
        if connected.is_err() {
            return None;
        }

        match register(manager, &ctx.queue, &ctx.consumer_tag, &ctx.options).await {
            Ok(registered) => {
                info!(queue = ctx.queue.as_str(), "re-subscribed to queue");
                return Some(registered);
            }
            Err(AmqpError::ManagerClosed) => return None,
            Err(err @ AmqpError::BindingConsumerError(..)) => {
                // the connection is fine but the broker refuses the consumer
                error!(
                    error = err.to_string(),
                    queue = ctx.queue.as_str(),
                    "consumer rejected on re-subscribe, subscription stopped"
                );
                return None;
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = ctx.queue.as_str(),
                    "failure to re-subscribe"
                );
                tokio::select! {
                    biased;
                    _ = ctx.token.cancelled() => return None,
                    _ = tokio::time::sleep(manager.config().reconnect_delay_duration()) => {}
                }
            }
        }
    }
}

/// Decodes, handles, and settles a single delivery.
pub(crate) async fn dispatch<T, H>(
    queue: &str,
    handler: &H,
    delivery: Delivery,
    options: &ConsumeOptions,
) -> Result<Disposition, AmqpError>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + ?Sized,
{
    let tracer = global::tracer(otel::CONSUMER_TRACER);
    let span_name = delivery
        .message_type
        .clone()
        .unwrap_or_else(|| queue.to_owned());
    let (_, mut span) = otel::new_span(&delivery.headers, &tracer, &span_name);

    debug!(
        queue,
        delivery_tag = delivery.delivery_tag,
        exchange = delivery.exchange.as_str(),
        routing_key = delivery.routing_key.as_str(),
        redelivered = delivery.redelivered,
        "received message"
    );

    let outcome = match serde_json::from_slice::<T>(&delivery.data) {
        Ok(payload) => match AssertUnwindSafe(handler.handle(payload))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err(HandlerError::new("handler panicked")),
        },
        Err(err) => Err(AmqpError::ParsePayloadError(err.to_string()).into()),
    };

    if options.no_ack {
        match &outcome {
            Ok(()) => span.set_status(Status::Ok),
            Err(reason) => {
                error!(queue, error = reason.reason(), "error processing message");
                span.record_error(reason);
            }
        }
        return Ok(Disposition::AutoAcked);
    }

    match outcome {
        Ok(()) => {
            debug!(queue, "message successfully processed");
            match delivery.acker.ack().await {
                Ok(()) => {
                    span.set_status(Status::Ok);
                    Ok(Disposition::Acked)
                }
                Err(err) => {
                    error!(error = err.to_string(), queue, "error whiling ack msg");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(err)
                }
            }
        }
        Err(reason) => {
            error!(
                queue,
                error = reason.reason(),
                requeue = options.requeue_on_failure,
                "error processing message, rejecting"
            );
            span.record_error(&reason);
            span.set_status(Status::Error {
                description: Cow::from(reason.to_string()),
            });

            match delivery.acker.nack(options.requeue_on_failure).await {
                Ok(()) => Ok(Disposition::Nacked),
                Err(err) => {
                    error!(error = err.to_string(), queue, "error whiling nack msg");
                    span.record_error(&err);
                    Err(err)
                }
            }
        }
    }
}
