// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The dispatch engine talks to RabbitMQ through two narrow traits: a shared
//! [`BrokerConnection`] that hands out channels, and the [`BrokerChannel`]
//! operations the topology, publish and consume paths need. The `lapin`
//! implementation lives in [`crate::channel`].

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream};
use lapin::BasicProperties;
use std::sync::Arc;

/// Resolves to `true` when the broker acked the publish, `false` on a nack.
pub type PendingConfirm = BoxFuture<'static, Result<bool, AmqpError>>;

/// Stream of deliveries produced by a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// A message delivered to a consumer.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// The process-wide broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new channel on the shared connection.
    ///
    /// # Returns
    /// * `Err(AmqpError::ChannelError)` - The broker refused the channel
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// One broker channel. A channel is never used by two operations at once.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Channel number on the connection.
    fn id(&self) -> u16;

    /// `false` once the broker or the client closed the channel.
    fn is_open(&self) -> bool;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Switches the channel into publisher confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Limits unacknowledged deliveries on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Publishes and returns the pending confirmation; callers decide whether to await it.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, empty for the default exchange
    /// * `routing_key` - Route key of the binding to hit
    /// * `payload` - Encoded message body
    /// * `properties` - AMQP properties, headers included
    ///
    /// # Returns
    /// A [`PendingConfirm`]; it only resolves once the channel is in confirm mode
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, AmqpError>;

    /// Starts consuming `queue` under `consumer_tag`.
    ///
    /// # Returns
    /// The delivery stream; it ends when the consumer is cancelled or the channel closes
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Rejects a delivery; `requeue` puts it back on its queue.
    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}
