// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish Channel Pools
//!
//! One bounded pool of confirm-mode channels per message type. A checked-out
//! [`PooledChannel`] is exclusive to its holder and goes back to the idle list
//! when dropped; the channel itself stays open for the next publish. A channel
//! the broker closed meanwhile is discarded instead, and its slot opens a fresh
//! channel on the next checkout.

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    errors::AmqpError,
};
use std::{
    any::TypeId,
    collections::HashMap,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Fixed-capacity pool of publish channels.
pub struct ChannelPool {
    connection: Arc<dyn BrokerConnection>,
    capacity: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Arc<dyn BrokerChannel>>>,
}

impl ChannelPool {
    pub fn new(connection: Arc<dyn BrokerConnection>, capacity: usize) -> Arc<ChannelPool> {
        Arc::new(ChannelPool {
            connection,
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(Vec::with_capacity(capacity)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Channels currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Checks a channel out, waiting while all `capacity` channels are in use.
    ///
    /// Idle channels closed in the meantime are dropped and a fresh one is
    /// opened in confirm mode instead.
    ///
    /// # Returns
    /// * `Ok(PooledChannel)` - Returned to the pool when dropped
    /// * `Err(AmqpError::PoolClosed)` - The pool was closed before or while waiting
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledChannel, AmqpError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AmqpError::PoolClosed)?;

        let idle = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            idle.retain(|channel| channel.is_open());
            idle.pop()
        };

        let channel = match idle {
            Some(channel) => channel,
            None => {
                let channel = self.connection.create_channel().await?;
                channel.confirm_select().await?;
                debug!(channel = channel.id(), "pooled channel created");
                channel
            }
        };

        Ok(PooledChannel {
            channel: Some(channel),
            pool: self.clone(),
            _permit: permit,
        })
    }

    /// Shuts the pool: waiting and future acquires fail with `PoolClosed`.
    pub fn close(&self) {
        self.permits.close();
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn release(&self, channel: Arc<dyn BrokerChannel>) {
        if self.permits.is_closed() {
            return;
        }

        if !channel.is_open() {
            debug!(channel = channel.id(), "closed channel discarded");
            return;
        }

        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(channel);
    }
}

/// A channel checked out of a [`ChannelPool`], returned on drop.
pub struct PooledChannel {
    channel: Option<Arc<dyn BrokerChannel>>,
    pool: Arc<ChannelPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledChannel {
    pub fn channel(&self) -> &dyn BrokerChannel {
        &**self
    }
}

impl Deref for PooledChannel {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        match &self.channel {
            Some(channel) => channel.as_ref(),
            None => unreachable!("pooled channel used after release"),
        }
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.pool.release(channel);
        }
    }
}

/// Lazily created pools, one per message type.
pub struct ChannelPools {
    connection: Arc<dyn BrokerConnection>,
    capacity: usize,
    closed: AtomicBool,
    pools: Mutex<HashMap<TypeId, Arc<ChannelPool>>>,
}

impl ChannelPools {
    pub fn new(connection: Arc<dyn BrokerConnection>, capacity: usize) -> ChannelPools {
        ChannelPools {
            connection,
            capacity,
            closed: AtomicBool::new(false),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The pool of message type `M`.
    pub fn pool<M: 'static>(&self) -> Arc<ChannelPool> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools
            .entry(TypeId::of::<M>())
            .or_insert_with(|| {
                let pool = ChannelPool::new(self.connection.clone(), self.capacity);
                if self.closed.load(Ordering::SeqCst) {
                    pool.close();
                }
                pool
            })
            .clone()
    }

    /// Checks a channel out of the pool of `M`, creating the pool on first use.
    pub async fn acquire<M: 'static>(&self) -> Result<PooledChannel, AmqpError> {
        self.pool::<M>().acquire().await
    }

    /// Closes every pool, including the ones created afterwards.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for pool in self
            .pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            pool.close();
        }
    }
}
