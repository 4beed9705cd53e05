// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-process broker used by the unit tests. Every channel operation is
//! recorded, and deliveries can be pushed into any consumed queue.

use crate::{
    broker::{BrokerChannel, BrokerConnection, Delivery, DeliveryStream, PendingConfirm},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{future, stream, FutureExt, StreamExt};
use lapin::{types::FieldTable, BasicProperties};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub(crate) enum Op {
    ExchangeDeclare {
        name: String,
        kind: ExchangeKind,
    },
    QueueDeclare {
        name: String,
        arguments: FieldTable,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    ConfirmSelect {
        channel: u16,
    },
    Qos {
        channel: u16,
        prefetch_count: u16,
    },
    Publish {
        channel: u16,
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
        properties: BasicProperties,
    },
    Consume {
        channel: u16,
        queue: String,
    },
    Ack {
        channel: u16,
        delivery_tag: u64,
    },
    Nack {
        channel: u16,
        delivery_tag: u64,
        requeue: bool,
    },
}

#[derive(Default)]
pub(crate) struct FakeBroker {
    ops: Mutex<Vec<Op>>,
    next_channel: AtomicU16,
    consumers: Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
    pub nack_publishes: AtomicBool,
    pub hang_confirms: AtomicBool,
    pub fail_channels: AtomicBool,
    pub fail_queue_declare: AtomicBool,
    pub fail_publishes: AtomicBool,
}

impl FakeBroker {
    pub fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker::default())
    }

    pub fn connection(self: &Arc<Self>) -> Arc<dyn BrokerConnection> {
        Arc::new(FakeConnection {
            broker: self.clone(),
        })
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }

    pub fn channels_created(&self) -> u16 {
        self.next_channel.load(Ordering::SeqCst)
    }

    pub fn exchange_declares(&self, name: &str) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, Op::ExchangeDeclare { name: n, .. } if n == name))
            .count()
    }

    pub fn queue_declares(&self, name: &str) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, Op::QueueDeclare { name: n, .. } if n == name))
            .count()
    }

    pub fn queue_arguments(&self, name: &str) -> Option<FieldTable> {
        self.ops().into_iter().find_map(|op| match op {
            Op::QueueDeclare { name: n, arguments } if n == name => Some(arguments),
            _ => None,
        })
    }

    /// `(exchange, routing_key)` of every publish, in order.
    pub fn publishes(&self) -> Vec<(String, String)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Publish {
                    exchange,
                    routing_key,
                    ..
                } => Some((exchange, routing_key)),
                _ => None,
            })
            .collect()
    }

    pub fn published_messages(&self) -> Vec<(Vec<u8>, BasicProperties)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Publish {
                    payload,
                    properties,
                    ..
                } => Some((payload, properties)),
                _ => None,
            })
            .collect()
    }

    pub fn consumes(&self, queue: &str) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, Op::Consume { queue: q, .. } if q == queue))
            .count()
    }

    /// Pushes a delivery into the consumer of `queue`.
    pub fn deliver(&self, queue: &str, delivery: Delivery) -> bool {
        match self.consumers.lock().unwrap().get(queue) {
            Some(tx) => tx.send(delivery).is_ok(),
            None => false,
        }
    }

    /// Ends the delivery stream of the consumer of `queue`.
    pub fn cancel(&self, queue: &str) -> bool {
        self.consumers.lock().unwrap().remove(queue).is_some()
    }

    /// Polls the recorded operations until `cond` holds or two seconds pass.
    pub async fn wait_for(&self, cond: impl Fn(&[Op]) -> bool) -> bool {
        let waited = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if cond(self.ops().as_slice()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        waited.is_ok()
    }
}

struct FakeConnection {
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.broker.fail_channels.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError);
        }

        let id = self.broker.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(FakeChannel {
            id,
            open: AtomicBool::new(true),
            broker: self.broker.clone(),
        }))
    }
}

struct FakeChannel {
    id: u16,
    open: AtomicBool,
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.broker.record(Op::ExchangeDeclare {
            name: def.name().to_owned(),
            kind: def.kind(),
        });
        Ok(())
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if self.broker.fail_queue_declare.load(Ordering::SeqCst) {
            // channel errors close the channel
            self.open.store(false, Ordering::SeqCst);
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }

        self.broker.record(Op::QueueDeclare {
            name: def.name().to_owned(),
            arguments: def.arguments(),
        });
        Ok(())
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.broker.record(Op::QueueBind {
            queue: binding.queue_name().to_owned(),
            exchange: binding.exchange_name().to_owned(),
            routing_key: binding.key().to_owned(),
        });
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.broker.record(Op::ConfirmSelect { channel: self.id });
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.broker.record(Op::Qos {
            channel: self.id,
            prefetch_count,
        });
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, AmqpError> {
        if !self.is_open() || self.broker.fail_publishes.load(Ordering::SeqCst) {
            return Err(AmqpError::PublishingError);
        }

        self.broker.record(Op::Publish {
            channel: self.id,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
            properties,
        });

        if self.broker.hang_confirms.load(Ordering::SeqCst) {
            return Ok(future::pending::<Result<bool, AmqpError>>().boxed());
        }

        let acked = !self.broker.nack_publishes.load(Ordering::SeqCst);
        Ok(future::ready(Ok(acked)).boxed())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        self.broker.record(Op::Consume {
            channel: self.id,
            queue: queue.to_owned(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        self.broker
            .consumers
            .lock()
            .unwrap()
            .insert(queue.to_owned(), tx);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.broker.record(Op::Ack {
            channel: self.id,
            delivery_tag,
        });
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.broker.record(Op::Nack {
            channel: self.id,
            delivery_tag,
            requeue,
        });
        Ok(())
    }
}
