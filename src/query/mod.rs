//! Read-only query surface over the published snapshot.
//!
//! Reads at or below the snapshot's high-water mark come straight from the snapshot. Reads
//! above it replay the pool's stored events on top of the snapshot projection, or from the
//! pool's creation when the snapshot has not seen the pool yet.

use crate::compile::{EngineSnapshot, SnapshotHandle};
use crate::datasource::{EventSource, EventSourceError};
use crate::domain::{
    Address, BlockHeight, EventKind, EventKindTag, OwnerShareState, PoolId, PoolState, UnixSecs,
    Valuation,
};
use crate::engine::{
    daily_yields, DailyYield, PoolFault, PoolProjection, PoolRegistry, PoolSummary, Valuer,
    YieldSnapshot,
};
use serde::Serialize;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueryWarning {
    /// The snapshot's high-water block is older than the freshness threshold.
    #[serde(rename_all = "camelCase")]
    StaleSnapshot {
        high_water: Option<BlockHeight>,
        high_water_time: Option<UnixSecs>,
        threshold_secs: i64,
    },
}

/// A query result with the high-water mark it was read at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer<T> {
    pub value: T,
    pub high_water: Option<BlockHeight>,
    pub warnings: Vec<QueryWarning>,
}

impl<T> Answer<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Answer<U> {
        Answer {
            value: f(self.value),
            high_water: self.high_water,
            warnings: self.warnings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolBalance {
    #[serde(flatten)]
    pub state: PoolState,
    pub liquidity_usd: Valuation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolPage {
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub pools: Vec<PoolSummary>,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("pool {0} is not registered at the requested height")]
    UnregisteredPool(PoolId),
    #[error("pool {pool} is degraded")]
    PoolDegraded { pool: PoolId, faults: Vec<PoolFault> },
    #[error("invalid page {page} with size {page_size} (max page size {max})")]
    InvalidPage {
        page: usize,
        page_size: usize,
        max: usize,
    },
    #[error("invalid height range {from}..={to}")]
    InvalidRange { from: BlockHeight, to: BlockHeight },
    #[error(transparent)]
    Source(#[from] EventSourceError),
}

#[derive(Debug, Clone)]
pub struct QuerySurface {
    snapshots: SnapshotHandle,
    events: Arc<dyn EventSource>,
    freshness_threshold_secs: i64,
    max_page_size: usize,
    clock: fn() -> UnixSecs,
}

impl QuerySurface {
    pub fn new(
        snapshots: SnapshotHandle,
        events: Arc<dyn EventSource>,
        freshness_threshold_secs: i64,
        max_page_size: usize,
    ) -> Self {
        QuerySurface {
            snapshots,
            events,
            freshness_threshold_secs,
            max_page_size,
            clock: UnixSecs::now,
        }
    }

    /// Replace the wall clock used for staleness checks.
    pub fn with_clock(mut self, clock: fn() -> UnixSecs) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.snapshots.load()
    }

    /// Reserves, share supply and liquidity at the high-water mark.
    pub async fn current_pool_balance(
        &self,
        pool: &PoolId,
    ) -> Result<Answer<PoolBalance>, QueryError> {
        let snapshot = self.snapshots.load();
        let height = snapshot
            .high_water
            .ok_or_else(|| QueryError::UnregisteredPool(pool.clone()))?;
        self.balance_in(&snapshot, pool, height).await
    }

    /// Reserves, share supply and liquidity after every event at or below `height`.
    pub async fn pool_balance_as_of(
        &self,
        pool: &PoolId,
        height: BlockHeight,
    ) -> Result<Answer<PoolBalance>, QueryError> {
        let snapshot = self.snapshots.load();
        self.balance_in(&snapshot, pool, height).await
    }

    /// An owner's total, staked and unstaked shares at the high-water mark.
    pub async fn owner_shares(
        &self,
        pool: &PoolId,
        owner: &Address,
    ) -> Result<Answer<OwnerShareState>, QueryError> {
        let snapshot = self.snapshots.load();
        let height = snapshot
            .high_water
            .ok_or_else(|| QueryError::UnregisteredPool(pool.clone()))?;
        self.owner_in(&snapshot, pool, owner, height).await
    }

    pub async fn owner_shares_as_of(
        &self,
        pool: &PoolId,
        owner: &Address,
        height: BlockHeight,
    ) -> Result<Answer<OwnerShareState>, QueryError> {
        let snapshot = self.snapshots.load();
        self.owner_in(&snapshot, pool, owner, height).await
    }

    /// Per-block yield rows with `from <= height <= to`.
    pub fn pool_yield(
        &self,
        pool: &PoolId,
        from: Option<BlockHeight>,
        to: Option<BlockHeight>,
    ) -> Result<Answer<Vec<YieldSnapshot>>, QueryError> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(QueryError::InvalidRange { from, to });
            }
        }
        let snapshot = self.snapshots.load();
        let view = snapshot
            .pool(pool)
            .ok_or_else(|| QueryError::UnregisteredPool(pool.clone()))?;
        if view.is_degraded() {
            return Err(QueryError::PoolDegraded {
                pool: pool.clone(),
                faults: view.faults.clone(),
            });
        }

        let rows = view
            .yields
            .iter()
            .filter(|row| from.map_or(true, |from| row.height >= from))
            .filter(|row| to.map_or(true, |to| row.height <= to))
            .cloned()
            .collect();
        Ok(self.answer(&snapshot, rows))
    }

    /// Yield rows rolled up per UTC day.
    pub fn pool_daily_yield(
        &self,
        pool: &PoolId,
        from: Option<BlockHeight>,
        to: Option<BlockHeight>,
    ) -> Result<Answer<Vec<DailyYield>>, QueryError> {
        Ok(self
            .pool_yield(pool, from, to)?
            .map(|rows| daily_yields(&rows)))
    }

    /// Healthy pools ordered by USD liquidity (unknown last), then pool id. Pages are 1-based.
    pub fn top_level_pools(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Answer<PoolPage>, QueryError> {
        if page == 0 || page_size == 0 || page_size > self.max_page_size {
            return Err(QueryError::InvalidPage {
                page,
                page_size,
                max: self.max_page_size,
            });
        }

        let snapshot = self.snapshots.load();
        let mut pools: Vec<&PoolSummary> = snapshot
            .pools
            .values()
            .filter(|view| !view.is_degraded())
            .map(|view| &view.summary)
            .collect();
        pools.sort_by(|a, b| compare_liquidity(a, b).then_with(|| a.pool.cmp(&b.pool)));

        let total = pools.len();
        let selected = pools
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .cloned()
            .collect();
        Ok(self.answer(
            &snapshot,
            PoolPage {
                page,
                page_size,
                total,
                pools: selected,
            },
        ))
    }

    async fn balance_in(
        &self,
        snapshot: &EngineSnapshot,
        pool: &PoolId,
        height: BlockHeight,
    ) -> Result<Answer<PoolBalance>, QueryError> {
        let projection = self.projection_at(snapshot, pool, height).await?;
        let valuer = Valuer::new(&snapshot.prices, &snapshot.decimals);
        let at = projection.clock().time_at(height);
        let balance = PoolBalance {
            state: projection.state_at(height, &snapshot.decimals),
            liquidity_usd: projection.liquidity_at(valuer, height, at),
        };
        Ok(self.answer(snapshot, balance))
    }

    async fn owner_in(
        &self,
        snapshot: &EngineSnapshot,
        pool: &PoolId,
        owner: &Address,
        height: BlockHeight,
    ) -> Result<Answer<OwnerShareState>, QueryError> {
        let projection = self.projection_at(snapshot, pool, height).await?;
        Ok(self.answer(snapshot, projection.owner_at(owner, height)))
    }

    /// The pool's projection covering every event at or below `height`.
    async fn projection_at<'a>(
        &self,
        snapshot: &'a EngineSnapshot,
        pool: &PoolId,
        height: BlockHeight,
    ) -> Result<Cow<'a, PoolProjection>, QueryError> {
        let unregistered = || QueryError::UnregisteredPool(pool.clone());
        let Some(view) = snapshot.pool(pool) else {
            let projection = self.replay_from_creation(snapshot, pool, height).await?;
            return checked(projection).map(Cow::Owned);
        };
        let high_water = snapshot.high_water.ok_or_else(unregistered)?;
        if snapshot.registry.lookup(pool, height).is_none() {
            return Err(unregistered());
        }

        if height <= high_water {
            if view.is_degraded() {
                return Err(QueryError::PoolDegraded {
                    pool: pool.clone(),
                    faults: view.faults.clone(),
                });
            }
            return Ok(Cow::Borrowed(&view.projection));
        }

        let mut projection = view.projection.clone();
        for event in self.events.events_for_pool_above(pool, high_water).await? {
            if event.height() > height {
                break;
            }
            projection.apply(&event);
        }
        checked(projection).map(Cow::Owned)
    }

    /// Projection of a pool created above the high-water mark, built from the store alone.
    async fn replay_from_creation(
        &self,
        snapshot: &EngineSnapshot,
        pool: &PoolId,
        height: BlockHeight,
    ) -> Result<PoolProjection, QueryError> {
        let unregistered = || QueryError::UnregisteredPool(pool.clone());
        let from = snapshot
            .high_water
            .map_or(BlockHeight::new(0), |hw| BlockHeight::new(hw.as_i64() + 1));
        if height < from || snapshot.registry.contains(pool) {
            return Err(unregistered());
        }

        let creations = self
            .events
            .events_of_kind_in_range(EventKindTag::PoolCreated, from, height)
            .await?;
        let (event, created) = creations
            .iter()
            .find_map(|event| match &event.kind {
                EventKind::PoolCreated(created) if &created.pool == pool => Some((event, created)),
                _ => None,
            })
            .ok_or_else(unregistered)?;
        let mut registry = PoolRegistry::new();
        let meta = registry
            .register(created, event.position())
            .map_err(|_| unregistered())?
            .clone();

        let mut projection = PoolProjection::new(meta, event);
        let stored = self
            .events
            .events_for_pool_above(pool, event.height().saturating_sub(1))
            .await?;
        for later in stored {
            if later.height() > height {
                break;
            }
            // Events positioned before the creation stay quarantined.
            if later.position() > event.position() {
                projection.apply(&later);
            }
        }
        Ok(projection)
    }

    fn answer<T>(&self, snapshot: &EngineSnapshot, value: T) -> Answer<T> {
        let now = (self.clock)();
        let stale = match snapshot.high_water_time {
            Some(time) => now.as_i64().saturating_sub(time.as_i64()) > self.freshness_threshold_secs,
            None => true,
        };
        let warnings = if stale {
            vec![QueryWarning::StaleSnapshot {
                high_water: snapshot.high_water,
                high_water_time: snapshot.high_water_time,
                threshold_secs: self.freshness_threshold_secs,
            }]
        } else {
            Vec::new()
        };
        Answer {
            value,
            high_water: snapshot.high_water,
            warnings,
        }
    }
}

fn checked(projection: PoolProjection) -> Result<PoolProjection, QueryError> {
    let faults = projection.faults();
    if faults.is_empty() {
        Ok(projection)
    } else {
        Err(QueryError::PoolDegraded {
            pool: projection.pool().clone(),
            faults,
        })
    }
}

/// Known values descending, unknown values after all known ones.
fn compare_liquidity(a: &PoolSummary, b: &PoolSummary) -> Ordering {
    match (a.liquidity_usd.usd(), b.liquidity_usd.usd()) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
