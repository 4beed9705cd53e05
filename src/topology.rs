// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module derives the exchange, queue and routing key names of every
//! message type and declares them on the broker the first time they are needed.
//!
//! The main components are:
//! - `QueueInfo`: the names derived from a message type
//! - `Delayed<M>`: the marker keying the delayed topology of `M` apart from its direct one
//! - `AmqpTopology`: a batch of exchanges, queues and bindings installed in order
//! - `TopologyResolver`: the per-context cache deciding what still needs declaring
//!
//! Declared topology is assumed stable for the lifetime of the process; a
//! topology removed or altered on the broker behind our back is not redeclared.

use crate::{
    broker::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Message,
    queue::{QueueBinding, QueueDefinition},
};
use std::{
    any::TypeId,
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::OnceCell;
use tracing::debug;

/// Direct exchange receiving dead-lettered delayed fan-out messages
pub const RELAY_EXCHANGE: &str = "inner_delay_exchange";
/// Queue consumed by the delay relay
pub const RELAY_QUEUE: &str = "inner_delay_input";
/// Prefix of every fan-out exchange and route key
pub const TOPIC_PREFIX: &str = "topic.";

/// Broker names derived from a message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub exchange_name: String,
    pub route_key_name: String,
    pub queue_name: String,
}

impl QueueInfo {
    pub fn new(type_name: &str) -> QueueInfo {
        QueueInfo {
            exchange_name: format!("{}.exchange", type_name),
            route_key_name: format!("{}.input", type_name),
            queue_name: format!("{}.input", type_name),
        }
    }

    /// Queue holding delayed messages until their TTL expires.
    pub fn delay_queue_name(&self) -> String {
        format!("{}.delay", self.queue_name)
    }

    pub fn topic_exchange_name(&self) -> String {
        format!("{}{}", TOPIC_PREFIX, self.exchange_name)
    }

    pub fn subscriber_queue_name(&self, subscriber: &str) -> String {
        format!("{}.{}", subscriber, self.queue_name)
    }

    pub fn subscriber_route_key(subscriber: &str) -> String {
        format!("{}{}", TOPIC_PREFIX, subscriber)
    }
}

/// Marker type standing for the delay-wrapped variant of `M`.
///
/// It shares the names of `M` but has its own cache entry.
pub struct Delayed<M>(PhantomData<fn() -> M>);

/// A batch of exchanges, queues and bindings, installed in that order.
#[derive(Debug, Default)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology through `channel`.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            channel.exchange_declare(exch).await?;
        }

        for queue in &self.queues {
            debug!("creating queue: {}", queue.name);
            channel.queue_declare(queue).await?;
        }

        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            channel.queue_bind(binding).await?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Declaration {
    Direct(TypeId),
    Delayed(TypeId),
    FanOut(TypeId),
    DelayedFanOut(TypeId),
    Subscriber(TypeId, String),
    Relay,
}

/// Memoized topology of one dispatch context.
///
/// Names are cached per message type (and per `Delayed<M>`); each declaration
/// runs at most once, and only a successful one is remembered.
#[derive(Default)]
pub struct TopologyResolver {
    infos: Mutex<HashMap<TypeId, Arc<QueueInfo>>>,
    declared: Mutex<HashMap<Declaration, Arc<OnceCell<()>>>>,
}

impl TopologyResolver {
    pub fn new() -> TopologyResolver {
        TopologyResolver::default()
    }

    /// Names of `M`, without touching the broker.
    pub fn queue_info<M: Message>(&self) -> Arc<QueueInfo> {
        self.info_for(TypeId::of::<M>(), M::message_type())
    }

    /// Names of `Delayed<M>`: identical to those of `M`, cached separately.
    pub fn queue_info_delayed<M: Message>(&self) -> Arc<QueueInfo> {
        self.info_for(TypeId::of::<Delayed<M>>(), M::message_type())
    }

    fn info_for(&self, key: TypeId, type_name: &str) -> Arc<QueueInfo> {
        let mut infos = self.infos.lock().unwrap_or_else(PoisonError::into_inner);
        infos
            .entry(key)
            .or_insert_with(|| Arc::new(QueueInfo::new(type_name)))
            .clone()
    }

    async fn ensure(
        &self,
        key: Declaration,
        channel: &dyn BrokerChannel,
        plan: impl FnOnce() -> AmqpTopology,
    ) -> Result<(), AmqpError> {
        let cell = {
            let mut declared = self.declared.lock().unwrap_or_else(PoisonError::into_inner);
            declared.entry(key).or_default().clone()
        };

        cell.get_or_try_init(|| async move { plan().install(channel).await })
            .await?;

        Ok(())
    }

    /// Direct topology: `<T>.exchange` bound to `<T>.input`.
    pub async fn resolve<M: Message>(
        &self,
        channel: &dyn BrokerChannel,
    ) -> Result<Arc<QueueInfo>, AmqpError> {
        let info = self.queue_info::<M>();

        self.ensure(Declaration::Direct(TypeId::of::<M>()), channel, || {
            direct_topology(&info)
        })
        .await?;

        Ok(info)
    }

    /// Direct topology plus `<T>.input.delay`, dead-lettering into `<T>.exchange`.
    ///
    /// The TTL of the first resolution sticks for the lifetime of the process.
    pub async fn resolve_delayed<M: Message>(
        &self,
        channel: &dyn BrokerChannel,
        delay_ms: u32,
    ) -> Result<Arc<QueueInfo>, AmqpError> {
        let info = self.queue_info_delayed::<M>();

        self.ensure(Declaration::Delayed(TypeId::of::<M>()), channel, || {
            direct_topology(&info).queue(
                QueueDefinition::new(&info.delay_queue_name())
                    .ttl(delay_ms)
                    .dead_letter(&info.exchange_name, &info.route_key_name),
            )
        })
        .await?;

        Ok(info)
    }

    /// Topic exchange `topic.<T>.exchange` plus one `<s>.<T>.input` queue per subscriber.
    pub async fn resolve_fan_out<M: Message>(
        &self,
        channel: &dyn BrokerChannel,
        subscribers: &[&str],
    ) -> Result<Arc<QueueInfo>, AmqpError> {
        let info = self.queue_info::<M>();
        let exchange = info.topic_exchange_name();

        self.ensure(Declaration::FanOut(TypeId::of::<M>()), channel, || {
            AmqpTopology::new().exchange(ExchangeDefinition::new(&exchange).topic())
        })
        .await?;

        for subscriber in subscribers {
            let key = Declaration::Subscriber(TypeId::of::<M>(), (*subscriber).to_owned());
            self.ensure(key, channel, || {
                let queue = info.subscriber_queue_name(subscriber);
                AmqpTopology::new()
                    .queue(QueueDefinition::new(&queue))
                    .queue_binding(
                        QueueBinding::new(&queue)
                            .exchange(&exchange)
                            .routing_key(&QueueInfo::subscriber_route_key(subscriber)),
                    )
            })
            .await?;
        }

        Ok(info)
    }

    /// Fan-out topology plus the relay and `<T>.input.delay`, dead-lettering into the relay.
    pub async fn resolve_delayed_fan_out<M: Message>(
        &self,
        channel: &dyn BrokerChannel,
        delay_ms: u32,
        subscribers: &[&str],
    ) -> Result<Arc<QueueInfo>, AmqpError> {
        self.resolve_fan_out::<M>(channel, subscribers).await?;

        self.ensure(Declaration::Relay, channel, || {
            AmqpTopology::new()
                .exchange(ExchangeDefinition::new(RELAY_EXCHANGE).direct())
                .queue(QueueDefinition::new(RELAY_QUEUE))
                .queue_binding(
                    QueueBinding::new(RELAY_QUEUE)
                        .exchange(RELAY_EXCHANGE)
                        .routing_key(RELAY_QUEUE),
                )
        })
        .await?;

        let info = self.queue_info_delayed::<M>();

        self.ensure(
            Declaration::DelayedFanOut(TypeId::of::<M>()),
            channel,
            || {
                AmqpTopology::new().queue(
                    QueueDefinition::new(&info.delay_queue_name())
                        .ttl(delay_ms)
                        .dead_letter(RELAY_EXCHANGE, RELAY_QUEUE),
                )
            },
        )
        .await?;

        Ok(info)
    }
}

fn direct_topology(info: &QueueInfo) -> AmqpTopology {
    AmqpTopology::new()
        .exchange(ExchangeDefinition::new(&info.exchange_name).direct())
        .queue(QueueDefinition::new(&info.queue_name))
        .queue_binding(
            QueueBinding::new(&info.queue_name)
                .exchange(&info.exchange_name)
                .routing_key(&info.route_key_name),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exchange::ExchangeKind,
        message::tests::OrderPlaced,
        queue::{
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
            AMQP_HEADERS_MESSAGE_TTL,
        },
        testing::{FakeBroker, Op},
    };
    use lapin::types::{AMQPValue, LongString};

    #[test]
    fn names_follow_the_type_name() {
        let info = QueueInfo::new("OrderPlaced");

        assert_eq!(info.exchange_name, "OrderPlaced.exchange");
        assert_eq!(info.route_key_name, "OrderPlaced.input");
        assert_eq!(info.queue_name, "OrderPlaced.input");
        assert_eq!(info.delay_queue_name(), "OrderPlaced.input.delay");
        assert_eq!(info.topic_exchange_name(), "topic.OrderPlaced.exchange");
        assert_eq!(info.subscriber_queue_name("billing"), "billing.OrderPlaced.input");
        assert_eq!(QueueInfo::subscriber_route_key("billing"), "topic.billing");
    }

    #[test]
    fn delayed_variant_shares_names_but_not_the_cache_entry() {
        let resolver = TopologyResolver::new();

        let direct = resolver.queue_info::<OrderPlaced>();
        let delayed = resolver.queue_info_delayed::<OrderPlaced>();

        assert_eq!(*direct, *delayed);
        assert!(!Arc::ptr_eq(&direct, &delayed));
        assert!(Arc::ptr_eq(&direct, &resolver.queue_info::<OrderPlaced>()));
    }

    #[tokio::test]
    async fn resolve_declares_once() {
        let broker = FakeBroker::new();
        let channel = broker.connection().create_channel().await.unwrap();
        let resolver = TopologyResolver::new();

        let first = resolver.resolve::<OrderPlaced>(&*channel).await.unwrap();
        let second = resolver.resolve::<OrderPlaced>(&*channel).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.exchange_declares("OrderPlaced.exchange"), 1);
        assert_eq!(broker.queue_declares("OrderPlaced.input"), 1);
        assert!(broker.ops().iter().any(|op| matches!(
            op,
            Op::ExchangeDeclare { name, kind: ExchangeKind::Direct } if name == "OrderPlaced.exchange"
        )));
        assert!(broker.ops().iter().any(|op| matches!(
            op,
            Op::QueueBind { queue, exchange, routing_key }
                if queue == "OrderPlaced.input"
                    && exchange == "OrderPlaced.exchange"
                    && routing_key == "OrderPlaced.input"
        )));
    }

    #[tokio::test]
    async fn concurrent_first_resolutions_declare_once() {
        let broker = FakeBroker::new();
        let channel = broker.connection().create_channel().await.unwrap();
        let resolver = Arc::new(TopologyResolver::new());

        let mut tasks = vec![];
        for _ in 0..8 {
            let resolver = resolver.clone();
            let channel = channel.clone();
            tasks.push(tokio::spawn(async move {
                resolver.resolve::<OrderPlaced>(&*channel).await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(broker.exchange_declares("OrderPlaced.exchange"), 1);
    }

    #[tokio::test]
    async fn delayed_topology_dead_letters_into_the_real_queue() {
        let broker = FakeBroker::new();
        let channel = broker.connection().create_channel().await.unwrap();
        let resolver = TopologyResolver::new();

        resolver
            .resolve_delayed::<OrderPlaced>(&*channel, 5000)
            .await
            .unwrap();
        resolver
            .resolve_delayed::<OrderPlaced>(&*channel, 9000)
            .await
            .unwrap();

        assert_eq!(broker.queue_declares("OrderPlaced.input.delay"), 1);
        let args = broker.queue_arguments("OrderPlaced.input.delay").unwrap();
        let args = args.inner();
        assert_eq!(
            args.get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongLongInt(5000))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("OrderPlaced.exchange")))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("OrderPlaced.input")))
        );
    }

    #[tokio::test]
    async fn fan_out_declares_topic_exchange_and_late_subscribers() {
        let broker = FakeBroker::new();
        let channel = broker.connection().create_channel().await.unwrap();
        let resolver = TopologyResolver::new();

        resolver
            .resolve_fan_out::<OrderPlaced>(&*channel, &["A", "B"])
            .await
            .unwrap();
        resolver
            .resolve_fan_out::<OrderPlaced>(&*channel, &["B", "C"])
            .await
            .unwrap();

        assert_eq!(broker.exchange_declares("topic.OrderPlaced.exchange"), 1);
        assert_eq!(broker.queue_declares("A.OrderPlaced.input"), 1);
        assert_eq!(broker.queue_declares("B.OrderPlaced.input"), 1);
        assert_eq!(broker.queue_declares("C.OrderPlaced.input"), 1);
        assert!(broker.ops().iter().any(|op| matches!(
            op,
            Op::QueueBind { queue, exchange, routing_key }
                if queue == "C.OrderPlaced.input"
                    && exchange == "topic.OrderPlaced.exchange"
                    && routing_key == "topic.C"
        )));
    }

    #[tokio::test]
    async fn delayed_fan_out_dead_letters_into_the_relay() {
        let broker = FakeBroker::new();
        let channel = broker.connection().create_channel().await.unwrap();
        let resolver = TopologyResolver::new();

        resolver
            .resolve_delayed_fan_out::<OrderPlaced>(&*channel, 1000, &["A", "B"])
            .await
            .unwrap();

        assert_eq!(broker.exchange_declares(RELAY_EXCHANGE), 1);
        assert_eq!(broker.queue_declares(RELAY_QUEUE), 1);
        let args = broker.queue_arguments("OrderPlaced.input.delay").unwrap();
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from(RELAY_EXCHANGE)))
        );
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from(RELAY_QUEUE)))
        );
    }

    #[tokio::test]
    async fn failed_declaration_is_retried() {
        let broker = FakeBroker::new();
        let channel = broker.connection().create_channel().await.unwrap();
        let resolver = TopologyResolver::new();

        broker
            .fail_queue_declare
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(resolver.resolve::<OrderPlaced>(&*channel).await.is_err());

        broker
            .fail_queue_declare
            .store(false, std::sync::atomic::Ordering::SeqCst);
        resolver.resolve::<OrderPlaced>(&*channel).await.unwrap();

        assert_eq!(broker.queue_declares("OrderPlaced.input"), 1);
        assert_eq!(broker.exchange_declares("OrderPlaced.exchange"), 2);
    }
}
