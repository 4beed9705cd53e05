// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Duplicate Publish Suppression
//!
//! The [`DedupGuard`] decides whether a publish request is new. It first checks
//! a bounded window of recently seen identity hashes, then a durable
//! [`DedupStore`] so duplicates are caught across restarts as well.
//!
//! The window check and the durable lookup/insert are separate steps: two
//! concurrent first publishes of the same identity can both pass the window and
//! race on the store. Suppression is best effort under normal concurrency, not
//! an exactly-once guarantee.
//!
//! A failing store call takes the hash back out of the window, so the caller
//! can retry the same publish.

use crate::{errors::AmqpError, message::Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};
use tracing::debug;

const KNUTH_SEED: u64 = 3_074_457_345_618_258_791;
const KNUTH_MULTIPLIER: u64 = 3_074_457_345_618_258_799;

/// Stable identity of a message source: the same content always hashes the same.
pub fn identity_hash(source: &str) -> String {
    source
        .as_bytes()
        .iter()
        .fold(KNUTH_SEED, |hash, byte| {
            hash.wrapping_add(u64::from(*byte))
                .wrapping_mul(KNUTH_MULTIPLIER)
        })
        .to_string()
}

/// Durable trace of an admitted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub identity_hash: String,
    pub can_be_removed: bool,
    pub created_time: DateTime<Utc>,
    pub execute_count: u32,
    pub last_execute_time: DateTime<Utc>,
    pub raw_content: String,
}

impl DedupRecord {
    pub fn new(identity_hash: &str, raw_content: &str) -> DedupRecord {
        let now = Utc::now();
        DedupRecord {
            identity_hash: identity_hash.to_owned(),
            can_be_removed: false,
            created_time: now,
            execute_count: 0,
            last_execute_time: now,
            raw_content: raw_content.to_owned(),
        }
    }
}

/// Durable storage of dedup records. Records are never removed by this crate.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn lookup(&self, identity_hash: &str) -> Result<Option<DedupRecord>, AmqpError>;

    async fn insert(&self, record: DedupRecord) -> Result<(), AmqpError>;
}

/// Process-local store, mostly useful for tests and single-instance setups.
#[derive(Default)]
pub struct InMemoryDedupStore {
    records: Mutex<HashMap<String, DedupRecord>>,
}

impl InMemoryDedupStore {
    pub fn new() -> InMemoryDedupStore {
        InMemoryDedupStore::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn lookup(&self, identity_hash: &str) -> Result<Option<DedupRecord>, AmqpError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity_hash)
            .cloned())
    }

    async fn insert(&self, record: DedupRecord) -> Result<(), AmqpError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.identity_hash.clone(), record);
        Ok(())
    }
}

/// Ring of the most recently seen identity hashes.
pub struct RecencyWindow {
    capacity: usize,
    inner: Mutex<Ring>,
}

#[derive(Default)]
struct Ring {
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl RecencyWindow {
    pub fn new(capacity: usize) -> RecencyWindow {
        RecencyWindow {
            capacity: capacity.max(1),
            inner: Mutex::new(Ring::default()),
        }
    }

    pub fn contains(&self, identity_hash: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .contains(identity_hash)
    }

    /// Remembers `identity_hash`, evicting the oldest entry once full.
    pub fn record(&self, identity_hash: &str) {
        let mut ring = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if ring.members.contains(identity_hash) {
            return;
        }

        if ring.order.len() >= self.capacity {
            if let Some(oldest) = ring.order.pop_front() {
                ring.members.remove(&oldest);
            }
        }

        ring.order.push_back(identity_hash.to_owned());
        ring.members.insert(identity_hash.to_owned());
    }

    /// Drops `identity_hash` from the window, if present.
    pub fn forget(&self, identity_hash: &str) {
        let mut ring = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if ring.members.remove(identity_hash) {
            ring.order.retain(|hash| hash != identity_hash);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a dedup check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub identity_hash: String,
    pub admitted: bool,
}

pub struct DedupGuard {
    window: RecencyWindow,
    store: Arc<dyn DedupStore>,
}

impl DedupGuard {
    pub fn new(store: Arc<dyn DedupStore>, window_capacity: usize) -> DedupGuard {
        DedupGuard {
            window: RecencyWindow::new(window_capacity),
            store,
        }
    }

    pub fn window(&self) -> &RecencyWindow {
        &self.window
    }

    /// Decides whether `message` is seen for the first time.
    ///
    /// A message that already carries an id keeps it; otherwise the id is the
    /// hash of its source. Admission inserts the durable record.
    ///
    /// # Parameters
    /// * `message` - The message about to be published
    ///
    /// # Returns
    /// * `Ok(Admission)` - Whether to publish, and the id to stamp on success
    /// * `Err(AmqpError::DedupStoreError)` - The store failed; the hash leaves the window again
    pub async fn try_admit<M: Message>(&self, message: &M) -> Result<Admission, AmqpError> {
        let identity_hash = if message.id().trim().is_empty() {
            identity_hash(message.source())
        } else {
            message.id().to_owned()
        };

        if self.window.contains(&identity_hash) {
            debug!(identity = identity_hash.as_str(), "duplicate in recency window");
            return Ok(Admission {
                identity_hash,
                admitted: false,
            });
        }

        self.window.record(&identity_hash);

        let found = match self.store.lookup(&identity_hash).await {
            Ok(found) => found,
            Err(err) => {
                self.window.forget(&identity_hash);
                return Err(err);
            }
        };

        if found.is_some() {
            debug!(identity = identity_hash.as_str(), "duplicate in dedup store");
            return Ok(Admission {
                identity_hash,
                admitted: false,
            });
        }

        if let Err(err) = self
            .store
            .insert(DedupRecord::new(&identity_hash, message.source()))
            .await
        {
            self.window.forget(&identity_hash);
            return Err(err);
        }

        Ok(Admission {
            identity_hash,
            admitted: true,
        })
    }
}
