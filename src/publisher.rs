// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes messages to the topology derived from their type.
//! Every publish goes through the dedup guard first, runs on a pooled
//! confirm-mode channel and waits for the broker confirm before returning.
//!
//! Two delivery shapes are supported:
//! - `send`: point-to-point, to `<T>.exchange` / `<T>.input`
//! - `publish`: fan-out, to `topic.<T>.exchange` with one `topic.<s>` route key
//!   per subscriber
//!
//! Both accept a delay in milliseconds; a delayed message waits in
//! `<T>.input.delay` until its TTL expires.

use crate::{
    broker::{BrokerChannel, PendingConfirm},
    context::DispatchContext,
    errors::AmqpError,
    message::{encode, Message},
    otel,
    relay::insert_relay_target,
    topology::QueueInfo,
};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};

/// Content type of every published payload
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// AMQP delivery mode asking the broker to persist the message
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Publishes messages through a [`DispatchContext`].
#[derive(Clone)]
pub struct Publisher {
    ctx: Arc<DispatchContext>,
}

impl Publisher {
    /// Creates a publisher sharing the pools, topology cache and dedup guard of `ctx`.
    pub fn new(ctx: Arc<DispatchContext>) -> Publisher {
        Publisher { ctx }
    }

    /// Sends `message` to the single queue of its type.
    ///
    /// On success the identity hash is stamped into the message id.
    ///
    /// # Parameters
    /// * `message` - The message to publish; its `source` must not be blank
    /// * `delay_ms` - Delivery delay in milliseconds, `0` for immediate delivery
    ///
    /// # Returns
    /// * `Ok(true)` - The broker confirmed the publish
    /// * `Ok(false)` - The message was already seen and nothing was published
    /// * `Err(AmqpError)` - Validation, topology, channel or confirm failure
    pub async fn send<M: Message>(&self, message: &mut M, delay_ms: u32) -> Result<bool, AmqpError> {
        if message.source().trim().is_empty() {
            return Err(AmqpError::EmptySource);
        }

        let admission = self.ctx.dedup.try_admit(message).await?;
        if !admission.admitted {
            return Ok(false);
        }

        let channel = self.ctx.pools.acquire::<M>().await?;

        let (exchange, route_key) = if delay_ms > 0 {
            let info = self
                .ctx
                .topology
                .resolve_delayed::<M>(channel.channel(), delay_ms)
                .await?;
            (String::new(), info.delay_queue_name())
        } else {
            let info = self.ctx.topology.resolve::<M>(channel.channel()).await?;
            (info.exchange_name.clone(), info.route_key_name.clone())
        };

        message.set_id(admission.identity_hash.clone());
        let payload = encode(message)?;
        let properties = properties::<M>(&admission.identity_hash, BTreeMap::new());

        let confirm = channel
            .basic_publish(&exchange, &route_key, &payload, properties)
            .await?;

        match self.wait_confirm(confirm).await? {
            true => {
                debug!(
                    msg_type = M::message_type(),
                    route_key = route_key.as_str(),
                    "message published"
                );
                Ok(true)
            }
            false => {
                error!(
                    msg_type = M::message_type(),
                    route_key = route_key.as_str(),
                    "broker refused the message"
                );
                Err(AmqpError::PublishNacked)
            }
        }
    }

    /// Publishes `message` to every subscriber in `subscribers`.
    ///
    /// A single subscriber is served by [`Publisher::send`], so the message
    /// lands on `<T>.input` rather than on the subscriber queue.
    ///
    /// # Parameters
    /// * `message` - The message to publish; its `source` must not be blank
    /// * `delay_ms` - Delivery delay in milliseconds, `0` for immediate delivery
    /// * `subscribers` - Non-empty list of non-blank subscriber names
    ///
    /// # Returns
    /// `Ok(false)` for a duplicate, `Ok(true)` once every leg was issued. A
    /// nacked fan-out leg is logged and does not fail the call.
    pub async fn publish<M: Message>(
        &self,
        message: &mut M,
        delay_ms: u32,
        subscribers: &[&str],
    ) -> Result<bool, AmqpError> {
        if message.source().trim().is_empty() {
            return Err(AmqpError::EmptySource);
        }

        if subscribers.is_empty() {
            return Err(AmqpError::NoSubscribers);
        }

        if subscribers.iter().any(|s| s.trim().is_empty()) {
            return Err(AmqpError::EmptySubscriberName);
        }

        if subscribers.len() == 1 {
            return self.send(message, delay_ms).await;
        }

        let admission = self.ctx.dedup.try_admit(message).await?;
        if !admission.admitted {
            return Ok(false);
        }

        let channel = self.ctx.pools.acquire::<M>().await?;

        message.set_id(admission.identity_hash.clone());
        let payload = encode(message)?;

        if delay_ms > 0 {
            let info = self
                .ctx
                .topology
                .resolve_delayed_fan_out::<M>(channel.channel(), delay_ms, subscribers)
                .await?;
            self.ctx.ensure_relay().await?;

            return self
                .publish_delayed_fan_out::<M>(
                    channel.channel(),
                    &info,
                    &admission.identity_hash,
                    &payload,
                    subscribers,
                )
                .await;
        }

        let info = self
            .ctx
            .topology
            .resolve_fan_out::<M>(channel.channel(), subscribers)
            .await?;
        let exchange = info.topic_exchange_name();

        for subscriber in subscribers {
            let route_key = QueueInfo::subscriber_route_key(subscriber);
            let confirm = channel
                .basic_publish(
                    &exchange,
                    &route_key,
                    &payload,
                    properties::<M>(&admission.identity_hash, BTreeMap::new()),
                )
                .await?;

            match self.wait_confirm(confirm).await {
                Ok(true) => debug!(route_key = route_key.as_str(), "message published"),
                Ok(false) => warn!(
                    route_key = route_key.as_str(),
                    "broker refused the message, moving on"
                ),
                Err(err) => warn!(
                    error = err.to_string(),
                    route_key = route_key.as_str(),
                    "message not confirmed, moving on"
                ),
            }
        }

        Ok(true)
    }

    async fn publish_delayed_fan_out<M: Message>(
        &self,
        channel: &dyn BrokerChannel,
        info: &QueueInfo,
        identity_hash: &str,
        payload: &[u8],
        subscribers: &[&str],
    ) -> Result<bool, AmqpError> {
        let route_keys: Vec<String> = subscribers
            .iter()
            .map(|s| QueueInfo::subscriber_route_key(s))
            .collect();

        let mut headers = BTreeMap::new();
        insert_relay_target(&mut headers, &info.topic_exchange_name(), &route_keys);

        let delay_queue = info.delay_queue_name();
        let confirm = channel
            .basic_publish(
                "",
                &delay_queue,
                payload,
                properties::<M>(identity_hash, headers),
            )
            .await?;

        if !self.wait_confirm(confirm).await? {
            error!(
                queue = delay_queue.as_str(),
                "broker refused the delayed message"
            );
            return Err(AmqpError::PublishNacked);
        }

        debug!(
            queue = delay_queue.as_str(),
            subscribers = subscribers.len(),
            "delayed fan-out published"
        );
        Ok(true)
    }

    async fn wait_confirm(&self, confirm: PendingConfirm) -> Result<bool, AmqpError> {
        match self.ctx.configs.confirm_timeout() {
            Some(limit) => tokio::time::timeout(limit, confirm).await.map_err(|_| {
                error!("publisher confirm timed out");
                AmqpError::ConfirmTimeout
            })?,
            None => confirm.await,
        }
    }
}

fn properties<M: Message>(
    identity_hash: &str,
    mut headers: BTreeMap<ShortString, AMQPValue>,
) -> BasicProperties {
    otel::inject_current(&mut headers);

    BasicProperties::default()
        .with_content_type(ShortString::from(TEXT_CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_type(ShortString::from(M::message_type()))
        .with_message_id(ShortString::from(identity_hash))
        .with_headers(FieldTable::from(headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::DispatchConfigs,
        dedup::{identity_hash, InMemoryDedupStore, MockDedupStore},
        message::tests::OrderPlaced,
        queue::AMQP_HEADERS_MESSAGE_TTL,
        relay::relay_target,
        testing::{FakeBroker, Op},
        topology::RELAY_QUEUE,
    };
    use std::sync::atomic::Ordering;

    fn publisher(broker: &Arc<FakeBroker>) -> Publisher {
        DispatchContext::new(
            broker.connection(),
            Arc::new(InMemoryDedupStore::new()),
            DispatchConfigs::default(),
        )
        .publisher()
    }

    #[tokio::test]
    async fn send_publishes_to_the_direct_route() {
        let broker = FakeBroker::new();
        let publisher = publisher(&broker);
        let mut msg = OrderPlaced::new("order-1", 1);

        assert!(publisher.send(&mut msg, 0).await.unwrap());

        let hash = identity_hash("order-1");
        assert_eq!(msg.id(), hash);
        assert_eq!(
            broker.publishes(),
            vec![(
                "OrderPlaced.exchange".to_owned(),
                "OrderPlaced.input".to_owned()
            )]
        );

        let (payload, props) = broker.published_messages().remove(0);
        assert_eq!(
            props.content_type(),
            &Some(ShortString::from(TEXT_CONTENT_TYPE))
        );
        assert_eq!(props.delivery_mode(), &Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(props.kind(), &Some(ShortString::from("OrderPlaced")));
        assert_eq!(props.message_id(), &Some(ShortString::from(hash.as_str())));

        let sent: OrderPlaced = serde_json::from_slice(&payload).unwrap();
        assert_eq!(sent.id(), hash);
        assert_eq!(sent.order_id, 1);
    }

    #[tokio::test]
    async fn duplicate_send_is_skipped() {
        let broker = FakeBroker::new();
        let publisher = publisher(&broker);

        assert!(publisher
            .send(&mut OrderPlaced::new("order-1", 1), 0)
            .await
            .unwrap());
        assert!(!publisher
            .send(&mut OrderPlaced::new("order-1", 1), 0)
            .await
            .unwrap());

        assert_eq!(broker.publishes().len(), 1);
    }

    #[tokio::test]
    async fn blank_source_is_rejected_before_the_broker() {
        let broker = FakeBroker::new();
        let publisher = publisher(&broker);

        let result = publisher.send(&mut OrderPlaced::new("  ", 1), 0).await;

        assert_eq!(result, Err(AmqpError::EmptySource));
        assert!(broker.ops().is_empty());
    }

    #[tokio::test]
    async fn publish_validates_subscribers() {
        let broker = FakeBroker::new();
        let publisher = publisher(&broker);

        assert_eq!(
            publisher
                .publish(&mut OrderPlaced::new("order-1", 1), 0, &[])
                .await,
            Err(AmqpError::NoSubscribers)
        );
        assert_eq!(
            publisher
                .publish(&mut OrderPlaced::new("order-1", 1), 0, &["A", " "])
                .await,
            Err(AmqpError::EmptySubscriberName)
        );
        assert_eq!(
            publisher
                .publish(&mut OrderPlaced::new("", 1), 0, &["A", "B"])
                .await,
            Err(AmqpError::EmptySource)
        );
        assert!(broker.ops().is_empty());
    }

    #[tokio::test]
    async fn fan_out_publishes_once_per_subscriber_after_one_admission() {
        let broker = FakeBroker::new();
        let mut store = MockDedupStore::new();
        store.expect_lookup().times(1).returning(|_| Ok(None));
        store.expect_insert().times(1).returning(|_| Ok(()));

        let publisher =
            DispatchContext::new(broker.connection(), Arc::new(store), DispatchConfigs::default())
                .publisher();

        let published = publisher
            .publish(&mut OrderPlaced::new("order-1", 1), 0, &["A", "B", "C"])
            .await
            .unwrap();

        assert!(published);
        assert_eq!(
            broker.publishes(),
            vec![
                ("topic.OrderPlaced.exchange".to_owned(), "topic.A".to_owned()),
                ("topic.OrderPlaced.exchange".to_owned(), "topic.B".to_owned()),
                ("topic.OrderPlaced.exchange".to_owned(), "topic.C".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn fan_out_keeps_going_when_a_leg_is_nacked() {
        let broker = FakeBroker::new();
        broker.nack_publishes.store(true, Ordering::SeqCst);
        let publisher = publisher(&broker);

        let published = publisher
            .publish(&mut OrderPlaced::new("order-1", 1), 0, &["A", "B"])
            .await
            .unwrap();

        assert!(published);
        assert_eq!(broker.publishes().len(), 2);
    }

    #[tokio::test]
    async fn single_subscriber_takes_the_direct_route() {
        let broker = FakeBroker::new();
        let publisher = publisher(&broker);

        publisher
            .publish(&mut OrderPlaced::new("order-1", 1), 0, &["billing"])
            .await
            .unwrap();

        assert_eq!(
            broker.publishes(),
            vec![(
                "OrderPlaced.exchange".to_owned(),
                "OrderPlaced.input".to_owned()
            )]
        );
        assert_eq!(broker.exchange_declares("topic.OrderPlaced.exchange"), 0);
    }

    #[tokio::test]
    async fn delayed_send_goes_through_the_delay_queue() {
        let broker = FakeBroker::new();
        let publisher = publisher(&broker);

        assert!(publisher
            .send(&mut OrderPlaced::new("order-1", 1), 5000)
            .await
            .unwrap());

        assert_eq!(
            broker.publishes(),
            vec![("".to_owned(), "OrderPlaced.input.delay".to_owned())]
        );
        let args = broker.queue_arguments("OrderPlaced.input.delay").unwrap();
        assert_eq!(
            args.inner().get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongLongInt(5000))
        );
        assert_eq!(broker.queue_declares("OrderPlaced.input"), 1);
    }

    #[tokio::test]
    async fn delayed_fan_out_is_published_once_and_relayed() {
        let broker = FakeBroker::new();
        let publisher = publisher(&broker);

        assert!(publisher
            .publish(&mut OrderPlaced::new("order-1", 1), 1000, &["A", "B"])
            .await
            .unwrap());

        assert_eq!(
            broker.publishes(),
            vec![("".to_owned(), "OrderPlaced.input.delay".to_owned())]
        );
        assert_eq!(broker.consumes(RELAY_QUEUE), 1);

        let (_, props) = broker.published_messages().remove(0);
        let (exchange, keys) = relay_target(&props).unwrap();
        assert_eq!(exchange, "topic.OrderPlaced.exchange");
        assert_eq!(keys, vec!["topic.A", "topic.B"]);

        publisher
            .publish(&mut OrderPlaced::new("order-2", 2), 1000, &["A", "B"])
            .await
            .unwrap();
        assert_eq!(broker.consumes(RELAY_QUEUE), 1);
    }

    #[tokio::test]
    async fn nacked_send_is_an_error() {
        let broker = FakeBroker::new();
        broker.nack_publishes.store(true, Ordering::SeqCst);
        let publisher = publisher(&broker);

        let result = publisher.send(&mut OrderPlaced::new("order-1", 1), 0).await;

        assert_eq!(result, Err(AmqpError::PublishNacked));
    }

    #[tokio::test]
    async fn unconfirmed_send_times_out_and_frees_the_channel() {
        let broker = FakeBroker::new();
        broker.hang_confirms.store(true, Ordering::SeqCst);
        let ctx = DispatchContext::new(
            broker.connection(),
            Arc::new(InMemoryDedupStore::new()),
            DispatchConfigs {
                confirm_timeout_ms: 20,
                ..DispatchConfigs::default()
            },
        );

        let result = ctx
            .publisher()
            .send(&mut OrderPlaced::new("order-1", 1), 0)
            .await;

        assert_eq!(result, Err(AmqpError::ConfirmTimeout));
        assert_eq!(ctx.pools().pool::<OrderPlaced>().idle(), 1);
        assert!(broker
            .ops()
            .iter()
            .any(|op| matches!(op, Op::ConfirmSelect { .. })));
    }
}
