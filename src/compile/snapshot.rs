//! Immutable engine snapshots and their atomic publication.

use crate::domain::{
    BlockHeight, ChainId, OwnerShareState, PoolId, PoolMeta, TokenDecimals, UnixSecs,
};
use crate::engine::{
    compute_yields, reclose_last, IntervalClose, PoolFault, PoolProjection, PoolRegistry,
    PoolSummary, PriceBook, Valuer, YieldSnapshot,
};
use arc_swap::ArcSwap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A pool's projection together with everything derived from it at the high-water mark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolView {
    pub projection: PoolProjection,
    pub faults: Vec<PoolFault>,
    pub yields: Vec<YieldSnapshot>,
    pub summary: PoolSummary,
}

impl PoolView {
    /// Derive faults, yields and summary from scratch.
    pub fn derive(projection: PoolProjection, valuer: Valuer<'_>, close: IntervalClose) -> Self {
        let faults = projection.faults();
        let yields = compute_yields(&projection, valuer, close);
        let summary = projection.summary(valuer, close.height, Some(close.time), !faults.is_empty());
        PoolView {
            projection,
            faults,
            yields,
            summary,
        }
    }

    /// Move an unchanged projection to a new high-water mark: only the open yield row and
    /// the summary depend on it.
    pub fn reclose(&self, valuer: Valuer<'_>, close: IntervalClose) -> Self {
        let mut yields = self.yields.clone();
        reclose_last(&mut yields, &self.projection, valuer, close);
        let summary =
            self.projection
                .summary(valuer, close.height, Some(close.time), !self.faults.is_empty());
        PoolView {
            projection: self.projection.clone(),
            faults: self.faults.clone(),
            yields,
            summary,
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.faults.is_empty()
    }

    pub fn meta(&self) -> &PoolMeta {
        self.projection.meta()
    }
}

/// Everything the query surface reads, frozen at one high-water mark.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub chain_id: ChainId,
    pub high_water: Option<BlockHeight>,
    pub high_water_time: Option<UnixSecs>,
    pub registry: Arc<PoolRegistry>,
    pub prices: Arc<PriceBook>,
    pub decimals: Arc<TokenDecimals>,
    pub pools: BTreeMap<PoolId, Arc<PoolView>>,
    /// SHA-256 of [`EngineSnapshot::canonical_json`], hex encoded.
    pub digest: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalSnapshot<'a> {
    chain_id: &'a ChainId,
    high_water: Option<BlockHeight>,
    high_water_time: Option<UnixSecs>,
    pools: Vec<CanonicalPool<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalPool<'a> {
    meta: &'a PoolMeta,
    summary: &'a PoolSummary,
    faults: &'a [PoolFault],
    owners: Vec<OwnerShareState>,
    yields: &'a [YieldSnapshot],
}

impl EngineSnapshot {
    /// Snapshot before the first refresh.
    pub fn empty(chain_id: ChainId, decimals: TokenDecimals) -> Self {
        let mut snapshot = EngineSnapshot {
            chain_id,
            high_water: None,
            high_water_time: None,
            registry: Arc::new(PoolRegistry::new()),
            prices: Arc::new(PriceBook::new()),
            decimals: Arc::new(decimals),
            pools: BTreeMap::new(),
            digest: String::new(),
        };
        snapshot.digest = snapshot.compute_digest().unwrap_or_default();
        snapshot
    }

    /// Serialization of every published output; identical inputs give identical bytes.
    ///
    /// Bookkeeping that depends on batch boundaries (applied-event keys) is left out.
    pub fn canonical_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let height = self.high_water.unwrap_or_default();
        let pools = self
            .pools
            .values()
            .map(|view| CanonicalPool {
                meta: view.meta(),
                summary: &view.summary,
                faults: &view.faults,
                owners: view
                    .projection
                    .shares()
                    .owners()
                    .map(|(owner, _)| view.projection.owner_at(owner, height))
                    .collect(),
                yields: &view.yields,
            })
            .collect();
        serde_json::to_vec(&CanonicalSnapshot {
            chain_id: &self.chain_id,
            high_water: self.high_water,
            high_water_time: self.high_water_time,
            pools,
        })
    }

    pub fn compute_digest(&self) -> Result<String, serde_json::Error> {
        let bytes = self.canonical_json()?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn pool(&self, pool: &PoolId) -> Option<&Arc<PoolView>> {
        self.pools.get(pool)
    }
}

/// Shared, atomically swappable pointer to the latest snapshot.
///
/// Readers get an `Arc` to a complete snapshot and never observe a half-applied refresh.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    inner: Arc<ArcSwap<EngineSnapshot>>,
}

impl SnapshotHandle {
    pub fn new(initial: EngineSnapshot) -> Self {
        SnapshotHandle {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    pub fn load(&self) -> Arc<EngineSnapshot> {
        self.inner.load_full()
    }

    pub fn publish(&self, snapshot: EngineSnapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}
