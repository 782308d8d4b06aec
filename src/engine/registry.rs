//! Pool registry: pool id -> pair and share-token identity.

use crate::domain::{BlockHeight, EventPosition, PoolCreated, PoolId, PoolMeta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("pool {pool} already registered at {existing}")]
pub struct DuplicatePool {
    pub pool: PoolId,
    pub existing: EventPosition,
}

/// Registered pools keyed by id. Entries are never overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRegistry {
    pools: BTreeMap<PoolId, PoolMeta>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool from its creation event at `position`.
    ///
    /// # Errors
    /// Returns `DuplicatePool` if the id is already registered; the first entry is kept.
    pub fn register(
        &mut self,
        created: &PoolCreated,
        position: EventPosition,
    ) -> Result<&PoolMeta, DuplicatePool> {
        if let Some(existing) = self.pools.get(&created.pool) {
            return Err(DuplicatePool {
                pool: created.pool.clone(),
                existing: existing.created_at,
            });
        }
        let meta = PoolMeta {
            pool: created.pool.clone(),
            token0: created.token0.clone(),
            token1: created.token1.clone(),
            share_token: created.share_token.clone(),
            created_at: position,
        };
        Ok(self.pools.entry(created.pool.clone()).or_insert(meta))
    }

    /// Pool metadata if the pool was created at or before `as_of`.
    pub fn lookup(&self, pool: &PoolId, as_of: BlockHeight) -> Option<&PoolMeta> {
        self.lookup_at(pool, EventPosition::end_of(as_of))
    }

    /// Pool metadata if the pool was created at or before `position`.
    ///
    /// Used when admitting events: an event in the same block as the creation is accepted
    /// only if it comes after the creation within the block.
    pub fn lookup_at(&self, pool: &PoolId, position: EventPosition) -> Option<&PoolMeta> {
        self.pools
            .get(pool)
            .filter(|meta| meta.created_at <= position)
    }

    /// Pool metadata regardless of creation height.
    pub fn get(&self, pool: &PoolId) -> Option<&PoolMeta> {
        self.pools.get(pool)
    }

    pub fn contains(&self, pool: &PoolId) -> bool {
        self.pools.contains_key(pool)
    }
}
