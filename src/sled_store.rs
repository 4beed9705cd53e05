// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Dedup records persisted in a `sled` tree, keyed by identity hash and
//! stored as JSON.

use crate::{
    dedup::{DedupRecord, DedupStore},
    errors::AmqpError,
};
use async_trait::async_trait;
use sled::{Db, Tree};
use tracing::error;

const RECORDS_TREE: &str = "dedup_records";

#[derive(Clone)]
pub struct SledDedupStore {
    tree: Tree,
}

impl SledDedupStore {
    /// Opens or creates the database at `path`.
    pub fn open(path: &str) -> Result<SledDedupStore, AmqpError> {
        let db = sled::open(path).map_err(|err| {
            error!(error = err.to_string(), path, "failure to open dedup store");
            AmqpError::DedupStoreError(err.to_string())
        })?;

        SledDedupStore::with_db(&db)
    }

    pub fn with_db(db: &Db) -> Result<SledDedupStore, AmqpError> {
        let tree = db
            .open_tree(RECORDS_TREE)
            .map_err(|err| AmqpError::DedupStoreError(err.to_string()))?;

        Ok(SledDedupStore { tree })
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl std::fmt::Debug for SledDedupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledDedupStore")
            .field("tree", &RECORDS_TREE)
            .finish()
    }
}

#[async_trait]
impl DedupStore for SledDedupStore {
    async fn lookup(&self, identity_hash: &str) -> Result<Option<DedupRecord>, AmqpError> {
        let Some(raw) = self
            .tree
            .get(identity_hash.as_bytes())
            .map_err(|err| AmqpError::DedupStoreError(err.to_string()))?
        else {
            return Ok(None);
        };

        serde_json::from_slice(&raw).map(Some).map_err(|err| {
            error!(error = err.to_string(), "corrupted dedup record");
            AmqpError::DedupStoreError(err.to_string())
        })
    }

    async fn insert(&self, record: DedupRecord) -> Result<(), AmqpError> {
        let serialized = serde_json::to_vec(&record)
            .map_err(|err| AmqpError::DedupStoreError(err.to_string()))?;

        self.tree
            .insert(record.identity_hash.as_bytes(), serialized)
            .map_err(|err| {
                error!(error = err.to_string(), "failure to store dedup record");
                AmqpError::DedupStoreError(err.to_string())
            })?;

        Ok(())
    }
}
