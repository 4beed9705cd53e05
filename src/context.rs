// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatch Context
//!
//! Everything the publish and consume paths share lives in one
//! [`DispatchContext`]: the broker connection, the topology cache, the channel
//! pools, the dedup guard and the handler registry. Build one per process (or
//! per test) and hand it to a [`Publisher`] and a [`Dispatcher`].

use crate::{
    broker::BrokerConnection,
    channel::new_amqp_connection,
    configs::{Configs, DispatchConfigs},
    dedup::{DedupGuard, DedupStore},
    dispatcher::Dispatcher,
    errors::AmqpError,
    pool::ChannelPools,
    publisher::Publisher,
    relay,
    topology::TopologyResolver,
};
use std::{
    any::TypeId,
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle};

pub struct DispatchContext {
    pub(crate) connection: Arc<dyn BrokerConnection>,
    pub(crate) configs: DispatchConfigs,
    pub(crate) topology: TopologyResolver,
    pub(crate) pools: ChannelPools,
    pub(crate) dedup: DedupGuard,
    handlers: Mutex<HashSet<TypeId>>,
    relay: AsyncMutex<Option<JoinHandle<()>>>,
}

impl DispatchContext {
    /// Builds a context over an open connection.
    ///
    /// # Parameters
    /// * `connection` - The broker connection every channel is opened on
    /// * `store` - Durable store of publish identities
    /// * `configs` - Pool, window, prefetch and confirm settings
    ///
    /// # Returns
    /// The shared context, ready to hand out publishers and dispatchers
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        store: Arc<dyn DedupStore>,
        configs: DispatchConfigs,
    ) -> Arc<DispatchContext> {
        Arc::new(DispatchContext {
            pools: ChannelPools::new(connection.clone(), configs.pool_capacity),
            dedup: DedupGuard::new(store, configs.recency_capacity),
            topology: TopologyResolver::new(),
            handlers: Mutex::new(HashSet::new()),
            relay: AsyncMutex::new(None),
            connection,
            configs,
        })
    }

    /// Connects to the broker described by `cfg` and builds the context on top.
    ///
    /// # Returns
    /// * `Err(AmqpError::ConnectionError)` - The broker is unreachable
    pub async fn connect(
        cfg: &Configs,
        store: Arc<dyn DedupStore>,
    ) -> Result<Arc<DispatchContext>, AmqpError> {
        let connection = new_amqp_connection(&cfg.rabbitmq).await?;
        Ok(DispatchContext::new(
            Arc::new(connection),
            store,
            cfg.dispatch.clone(),
        ))
    }

    /// A [`Publisher`] bound to this context.
    pub fn publisher(self: &Arc<Self>) -> Publisher {
        Publisher::new(self.clone())
    }

    /// A [`Dispatcher`] bound to this context.
    pub fn dispatcher(self: &Arc<Self>) -> Dispatcher {
        Dispatcher::new(self.clone())
    }

    pub fn configs(&self) -> &DispatchConfigs {
        &self.configs
    }

    pub fn topology(&self) -> &TopologyResolver {
        &self.topology
    }

    pub fn pools(&self) -> &ChannelPools {
        &self.pools
    }

    pub fn dedup(&self) -> &DedupGuard {
        &self.dedup
    }

    /// Claims the handler slot of `M`; `false` when it is already taken.
    pub(crate) fn claim_handler<M: 'static>(&self) -> bool {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<M>())
    }

    pub(crate) fn release_handler<M: 'static>(&self) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&TypeId::of::<M>());
    }

    pub fn is_registered<M: 'static>(&self) -> bool {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&TypeId::of::<M>())
    }

    /// Starts the delay relay the first time a delayed fan-out needs it, and
    /// again whenever the previous relay consumer has stopped.
    pub(crate) async fn ensure_relay(&self) -> Result<(), AmqpError> {
        let mut running = self.relay.lock().await;
        if running.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        *running = Some(relay::spawn_relay(self.connection.clone()).await?);
        Ok(())
    }

    /// Closes the channel pools; publishes waiting for a channel fail.
    pub fn shutdown(&self) {
        self.pools.close();
    }
}
