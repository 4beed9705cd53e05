// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module registers message handlers and starts their consumers.
//!
//! Each message type accepts a single handler per [`DispatchContext`]. A
//! registration opens a dedicated channel, declares the queue the handler
//! listens on and spawns a consumer task that feeds every delivery through the
//! handler, so handlers of different types progress independently.
//!
//! A handler listens either on the direct queue `<T>.input` or, when registered
//! for a subscriber `s`, on the fan-out queue `<s>.<T>.input`.

use crate::{
    consumer::spawn_consumer, context::DispatchContext, errors::AmqpError, message::Message,
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};
use uuid::Uuid;

/// Error a handler reports; the delivery is then requeued.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Business logic run for every delivered message of type `M`.
///
/// Setting `need_nack` on the message asks for a redelivery instead of an ack.
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    async fn handle(&self, message: &mut M) -> Result<(), HandlerError>;
}

/// Per-consumer tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Pause before each handler call.
    pub delay_process: Duration,
    /// Unacknowledged deliveries allowed on the consumer channel; `None`
    /// leaves the broker default.
    pub prefetch_count: Option<u16>,
}

impl HandlerOptions {
    /// A throttled consumer: a positive delay also bounds the prefetch.
    pub fn delayed(delay_ms: u64, prefetch_count: u16) -> HandlerOptions {
        HandlerOptions {
            delay_process: Duration::from_millis(delay_ms),
            prefetch_count: (delay_ms > 0).then_some(prefetch_count),
        }
    }
}

/// Outcome of a handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    /// A handler for this message type already runs; nothing was created.
    AlreadyRegistered,
}

/// Registers message handlers and runs their consumers.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
}

impl Dispatcher {
    /// Creates a dispatcher on top of `ctx`.
    pub fn new(ctx: Arc<DispatchContext>) -> Dispatcher {
        Dispatcher { ctx }
    }

    /// Consumes `<T>.input` with `handler`.
    ///
    /// # Parameters
    /// * `handler` - Handler run for every delivery of `M`
    /// * `delay_process_ms` - Pause before each handler call; a positive value
    ///   also bounds the prefetch to `dispatch.prefetch_count`
    ///
    /// # Returns
    /// [`Registration::AlreadyRegistered`] when `M` already has a handler.
    pub async fn register_handler<M, H>(
        &self,
        handler: H,
        delay_process_ms: u64,
    ) -> Result<Registration, AmqpError>
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let options = HandlerOptions::delayed(delay_process_ms, self.ctx.configs.prefetch_count);
        self.register_with::<M, H>(None, handler, options).await
    }

    /// Consumes the fan-out queue `<subscriber>.<T>.input` with `handler`.
    ///
    /// Same as [`Dispatcher::register_handler`], but `subscriber` must not be blank.
    pub async fn register_handler_as<M, H>(
        &self,
        subscriber: &str,
        handler: H,
        delay_process_ms: u64,
    ) -> Result<Registration, AmqpError>
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let options = HandlerOptions::delayed(delay_process_ms, self.ctx.configs.prefetch_count);
        self.register_with::<M, H>(Some(subscriber), handler, options)
            .await
    }

    /// Registers `handler` with explicit [`HandlerOptions`].
    ///
    /// # Parameters
    /// * `subscriber` - `Some(name)` for the fan-out queue of `name`, `None`
    ///   for `<T>.input`
    /// * `handler` - Handler run for every delivery of `M`
    /// * `options` - Processing delay and prefetch of the consumer channel
    ///
    /// # Returns
    /// * `Ok(Registration::Registered)` - The consumer is running
    /// * `Ok(Registration::AlreadyRegistered)` - `M` already has a handler
    /// * `Err(AmqpError)` - Blank subscriber, topology or consume failure; the
    ///   handler slot is released so the registration can be retried
    pub async fn register_with<M, H>(
        &self,
        subscriber: Option<&str>,
        handler: H,
        options: HandlerOptions,
    ) -> Result<Registration, AmqpError>
    where
        M: Message,
        H: MessageHandler<M>,
    {
        if subscriber.is_some_and(|s| s.trim().is_empty()) {
            return Err(AmqpError::EmptySubscriberName);
        }

        if !self.ctx.claim_handler::<M>() {
            debug!(
                msg_type = M::message_type(),
                "handler already registered, ignoring"
            );
            return Ok(Registration::AlreadyRegistered);
        }

        match self
            .start_consumer::<M, H>(subscriber, Arc::new(handler), options)
            .await
        {
            Ok(queue) => {
                debug!(
                    msg_type = M::message_type(),
                    queue = queue.as_str(),
                    "handler registered"
                );
                Ok(Registration::Registered)
            }
            Err(err) => {
                self.ctx.release_handler::<M>();
                error!(
                    error = err.to_string(),
                    msg_type = M::message_type(),
                    "failure to register the handler"
                );
                Err(err)
            }
        }
    }

    async fn start_consumer<M, H>(
        &self,
        subscriber: Option<&str>,
        handler: Arc<H>,
        options: HandlerOptions,
    ) -> Result<String, AmqpError>
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let channel = self.ctx.connection.create_channel().await?;

        if let Some(prefetch_count) = options.prefetch_count {
            channel.basic_qos(prefetch_count).await?;
        }

        let queue = match subscriber {
            Some(subscriber) => self
                .ctx
                .topology
                .resolve_fan_out::<M>(channel.as_ref(), &[subscriber])
                .await?
                .subscriber_queue_name(subscriber),
            None => self
                .ctx
                .topology
                .resolve::<M>(channel.as_ref())
                .await?
                .queue_name
                .clone(),
        };

        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
        let deliveries = channel.basic_consume(&queue, &consumer_tag).await?;

        spawn_consumer::<M, H>(channel, deliveries, handler, options.delay_process);

        Ok(queue)
    }
}
