//! Batched, resumable refresh of the engine state.
//!
//! Each batch reads the heights above the high-water mark (plus a lookback window), together
//! with every event stored since the previous batch at any height, folds them into the
//! per-pool projections, recomputes the affected pools in parallel, commits everything in one
//! transaction and then publishes a new snapshot.

use super::snapshot::{EngineSnapshot, PoolView, SnapshotHandle};
use super::{RefreshCheckpoint, COMPILE_VERSION};
use crate::datasource::{BatchWindow, EventSource, EventSourceError, PriceSource, RejectedEvent};
use crate::db::repo::{BatchCommit, YieldWrite};
use crate::db::Repository;
use crate::domain::{
    sort_events_deterministic, BlockHeight, ChainId, EventKey, EventKind, LedgerEvent, PoolId,
    PoolMeta, TokenDecimals, UnixSecs,
};
use crate::engine::{IntervalClose, PoolProjection, PoolRegistry, PriceBook, Valuer};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Price observations are re-read this far behind the last priced time, so observations
/// stored slightly late still reach the book.
pub const PRICE_LOOKBACK_SECS: i64 = 3_600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSettings {
    /// Heights folded into one committed batch.
    pub batch_blocks: i64,
    /// Heights below the high-water mark re-read on every batch.
    pub lookback_blocks: i64,
    /// Pools recomputed in parallel.
    pub concurrency: usize,
    pub decimals: TokenDecimals,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        RefreshSettings {
            batch_blocks: 10_000,
            lookback_blocks: 100,
            concurrency: 4,
            decimals: TokenDecimals::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Source(#[from] EventSourceError),
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
    #[error("engine state serialization failed: {0}")]
    State(#[from] serde_json::Error),
    #[error("pool recomputation task failed: {0}")]
    Join(String),
}

/// Summary of one refresh or rebuild run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub run_id: Uuid,
    pub batches: usize,
    pub high_water: Option<BlockHeight>,
    pub digest: String,
    pub cancelled: bool,
    /// Events still quarantined after the run.
    pub quarantined: usize,
}

/// What one committed batch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub from: BlockHeight,
    pub to: BlockHeight,
    pub events: usize,
    pub applied: usize,
    pub recomputed: usize,
    pub reclosed: usize,
    pub quarantined: usize,
    pub released: usize,
    /// Stored rows that failed to decode.
    pub rejected: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedState {
    registry: PoolRegistry,
    prices: PriceBook,
    projections: Vec<PoolProjection>,
    pending: Vec<LedgerEvent>,
    prices_through: Option<UnixSecs>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedStateRef<'a> {
    registry: &'a PoolRegistry,
    prices: &'a PriceBook,
    projections: Vec<&'a PoolProjection>,
    pending: Vec<&'a LedgerEvent>,
    prices_through: Option<UnixSecs>,
}

#[derive(Debug, Clone)]
struct EngineState {
    checkpoint: RefreshCheckpoint,
    registry: Arc<PoolRegistry>,
    prices: Arc<PriceBook>,
    pools: BTreeMap<PoolId, Arc<PoolView>>,
    /// Quarantined events, retried on every batch until their pool admits them.
    pending: BTreeMap<EventKey, LedgerEvent>,
    prices_through: Option<UnixSecs>,
}

impl EngineState {
    fn fresh(chain_id: ChainId) -> Self {
        EngineState {
            checkpoint: RefreshCheckpoint::new(chain_id),
            registry: Arc::new(PoolRegistry::new()),
            prices: Arc::new(PriceBook::new()),
            pools: BTreeMap::new(),
            pending: BTreeMap::new(),
            prices_through: None,
        }
    }
}

enum RecomputeJob {
    Derive(PoolProjection),
    Reclose(Arc<PoolView>),
}

/// Owns the engine state for one chain and advances it batch by batch.
#[derive(Debug)]
pub struct Refresher {
    repo: Repository,
    events: Arc<dyn EventSource>,
    prices: Arc<dyn PriceSource>,
    snapshots: SnapshotHandle,
    settings: RefreshSettings,
    decimals: Arc<TokenDecimals>,
    state: EngineState,
}

impl Refresher {
    /// Restore the state committed with the last checkpoint and publish it.
    ///
    /// A checkpoint written by another compile version is discarded together with all
    /// derived rows; the next refresh rebuilds from the event store.
    pub async fn load(
        repo: Repository,
        events: Arc<dyn EventSource>,
        prices: Arc<dyn PriceSource>,
        snapshots: SnapshotHandle,
        settings: RefreshSettings,
    ) -> Result<Self, RefreshError> {
        let decimals = Arc::new(settings.decimals.clone());
        let state = EngineState::fresh(repo.chain_id().clone());
        let mut refresher = Refresher {
            repo,
            events,
            prices,
            snapshots,
            settings,
            decimals,
            state,
        };

        match refresher.repo.load_checkpoint().await? {
            Some(stored) if stored.checkpoint.is_current_version() => {
                let persisted: PersistedState = serde_json::from_str(&stored.state_json)?;
                refresher.restore(stored.checkpoint, persisted).await?;
            }
            Some(stored) => {
                warn!(
                    stored_version = stored.checkpoint.compile_version,
                    current_version = COMPILE_VERSION,
                    "Compile version changed, discarding derived state"
                );
                refresher.repo.clear_derived().await?;
            }
            None => info!(chain = %refresher.repo.chain_id(), "No checkpoint, starting empty"),
        }

        let snapshot = refresher.build_snapshot()?;
        refresher.snapshots.publish(snapshot);
        Ok(refresher)
    }

    pub fn checkpoint(&self) -> &RefreshCheckpoint {
        &self.state.checkpoint
    }

    pub fn snapshots(&self) -> &SnapshotHandle {
        &self.snapshots
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    /// Number of events currently quarantined.
    pub fn quarantined_len(&self) -> usize {
        self.state.pending.len()
    }

    /// Run batches until caught up with the event store or `cancel` is set.
    ///
    /// Cancellation is checked between batches; committed batches are never redone.
    pub async fn refresh(
        &mut self,
        cancel: &watch::Receiver<bool>,
    ) -> Result<RefreshOutcome, RefreshError> {
        self.run(Uuid::new_v4(), cancel, true).await
    }

    /// Drop all derived state and recompute it from the event store.
    ///
    /// The previously published snapshot keeps serving queries until the rebuild catches up.
    pub async fn rebuild(
        &mut self,
        cancel: &watch::Receiver<bool>,
    ) -> Result<RefreshOutcome, RefreshError> {
        let run_id = Uuid::new_v4();
        info!(run_id = %run_id, chain = %self.repo.chain_id(), "Full rebuild started");
        self.repo.clear_derived().await?;
        self.state = EngineState::fresh(self.repo.chain_id().clone());

        let outcome = self.run(run_id, cancel, false).await?;
        if !outcome.cancelled {
            let snapshot = self.build_snapshot()?;
            self.snapshots.publish(snapshot);
        }
        Ok(outcome)
    }

    /// Fold and commit one batch, then publish its snapshot.
    ///
    /// Returns `None` when the state is at the store's latest height and nothing was stored
    /// since the last batch.
    pub async fn run_batch(&mut self, run_id: Uuid) -> Result<Option<BatchReport>, RefreshError> {
        self.run_batch_inner(run_id, true).await
    }

    async fn run(
        &mut self,
        run_id: Uuid,
        cancel: &watch::Receiver<bool>,
        publish_each: bool,
    ) -> Result<RefreshOutcome, RefreshError> {
        info!(
            run_id = %run_id,
            high_water = ?self.state.checkpoint.high_water,
            "Refresh started"
        );

        let mut batches = 0usize;
        let mut cancelled = false;
        loop {
            if *cancel.borrow() {
                info!(run_id = %run_id, batches, "Refresh cancelled between batches");
                cancelled = true;
                break;
            }
            match self.run_batch_inner(run_id, publish_each).await? {
                Some(_) => batches += 1,
                None => break,
            }
        }

        let outcome = RefreshOutcome {
            run_id,
            batches,
            high_water: self.state.checkpoint.high_water,
            digest: self.state.checkpoint.snapshot_digest.clone(),
            cancelled,
            quarantined: self.state.pending.len(),
        };
        info!(
            run_id = %run_id,
            batches,
            high_water = ?outcome.high_water,
            digest = %outcome.digest,
            quarantined = outcome.quarantined,
            "Refresh finished"
        );
        Ok(outcome)
    }

    async fn run_batch_inner(
        &mut self,
        run_id: Uuid,
        publish: bool,
    ) -> Result<Option<BatchReport>, RefreshError> {
        // Sequence first: a row stored after this read waits for the next batch.
        let stored_through = self.events.latest_sequence().await?;
        let Some(latest) = self.events.latest_height().await? else {
            return Ok(None);
        };
        let seen_through = self.state.checkpoint.stored_through;
        let stored_since = stored_through > seen_through;
        let high_water = self.state.checkpoint.high_water;
        let base = match high_water {
            Some(hw) if latest <= hw && !stored_since => return Ok(None),
            Some(hw) => hw,
            None => match self.events.earliest_height().await? {
                Some(first) => first.saturating_sub(1),
                None => return Ok(None),
            },
        };
        let to = if latest > base {
            BlockHeight::new(
                base.as_i64()
                    .saturating_add(self.settings.batch_blocks.max(1))
                    .min(latest.as_i64()),
            )
        } else {
            base
        };
        let from = self
            .state
            .checkpoint
            .next_read_from(self.settings.lookback_blocks);
        let window = BatchWindow {
            from,
            to,
            stored_after: seen_through,
            stored_through,
        };

        let stored = self.events.events_in_window(window).await?;
        let rejected: Vec<RejectedEvent> = stored.rejected;
        for row in &rejected {
            warn!(event = %row.key, pool = ?row.pool, reason = %row.reason, "Undecodable event quarantined");
        }
        let mut by_key = self.state.pending.clone();
        for event in stored.events {
            if event.height() < from {
                debug!(event = %event.key, "Late event below the lookback window");
            }
            by_key.entry(event.key.clone()).or_insert(event);
        }
        let mut events: Vec<LedgerEvent> = by_key.into_values().collect();
        sort_events_deterministic(&mut events);

        let close_time = match events.last().map(|e| e.height()) {
            Some(top) if high_water.map_or(true, |hw| top > hw) => events
                .iter()
                .filter(|e| e.height() == top)
                .map(|e| e.timestamp)
                .max(),
            _ => self.state.checkpoint.high_water_time,
        };

        // Prices
        let mut prices = Arc::clone(&self.state.prices);
        let mut prices_changed = false;
        let mut prices_through = self.state.prices_through;
        if let Some(close_time) = close_time {
            let read_from = prices_through
                .map(|t| UnixSecs::new(t.as_i64().saturating_sub(PRICE_LOOKBACK_SECS)))
                .unwrap_or(UnixSecs::new(0));
            let observations = self.prices.prices_between(read_from, close_time).await?;
            if !observations.is_empty() {
                let book = Arc::make_mut(&mut prices);
                for observation in &observations {
                    prices_changed |= book.record(observation);
                }
            }
            prices_through = Some(prices_through.map_or(close_time, |t| t.max(close_time)));
        }
        for event in &events {
            if let EventKind::PriceObserved(observation) = &event.kind {
                prices_changed |= Arc::make_mut(&mut prices).record(observation);
            }
        }

        // Events
        let mut registry = Arc::clone(&self.state.registry);
        let mut pending = self.state.pending.clone();
        let mut touched: BTreeMap<PoolId, PoolProjection> = BTreeMap::new();
        let mut dirty: BTreeSet<PoolId> = BTreeSet::new();
        let mut registered: Vec<PoolMeta> = Vec::new();
        let mut quarantined: Vec<(LedgerEvent, String)> = Vec::new();
        let mut released: Vec<EventKey> = Vec::new();
        let mut applied = 0usize;

        for event in &events {
            match &event.kind {
                EventKind::PriceObserved(_) => {}
                EventKind::PoolCreated(created) => {
                    if registry
                        .get(&created.pool)
                        .is_some_and(|meta| meta.created_at == event.position())
                    {
                        continue;
                    }
                    match Arc::make_mut(&mut registry).register(created, event.position()) {
                        Ok(meta) => {
                            let meta = meta.clone();
                            info!(pool = %meta.pool, at = %meta.created_at, "Pool registered");
                            touched.insert(
                                meta.pool.clone(),
                                PoolProjection::new(meta.clone(), event),
                            );
                            dirty.insert(meta.pool.clone());
                            registered.push(meta);
                        }
                        Err(duplicate) => {
                            if high_water.map_or(true, |hw| event.height() > hw) {
                                warn!(
                                    pool = %duplicate.pool,
                                    at = %event.position(),
                                    existing = %duplicate.existing,
                                    "Duplicate pool creation ignored"
                                );
                            }
                        }
                    }
                }
                _ => {
                    let Some(pool) = event.pool() else { continue };
                    if registry.lookup_at(pool, event.position()).is_none() {
                        if !pending.contains_key(&event.key) {
                            let reason = if registry.contains(pool) {
                                "event precedes pool creation"
                            } else {
                                "pool not registered"
                            };
                            warn!(event = %event.key, pool = %pool, reason, "Event quarantined");
                            pending.insert(event.key.clone(), event.clone());
                            quarantined.push((event.clone(), reason.to_string()));
                        }
                        continue;
                    }

                    let projection = match touched.entry(pool.clone()) {
                        Entry::Occupied(entry) => entry.into_mut(),
                        Entry::Vacant(entry) => match self.state.pools.get(pool) {
                            Some(view) => entry.insert(view.projection.clone()),
                            None => {
                                warn!(pool = %pool, "Registered pool has no projection, skipping event");
                                continue;
                            }
                        },
                    };
                    if projection.apply(event) {
                        applied += 1;
                        dirty.insert(pool.clone());
                    }
                    if pending.remove(&event.key).is_some() {
                        debug!(event = %event.key, pool = %pool, "Quarantined event released");
                        released.push(event.key.clone());
                    }
                }
            }
        }

        // Recompute
        let close = IntervalClose {
            height: to,
            time: close_time.unwrap_or(UnixSecs::new(0)),
        };
        let prune_at = to.saturating_sub(self.settings.lookback_blocks);
        let pool_ids: BTreeSet<PoolId> = self
            .state
            .pools
            .keys()
            .chain(touched.keys())
            .cloned()
            .collect();
        let mut jobs = Vec::with_capacity(pool_ids.len());
        for pool in pool_ids {
            if prices_changed || dirty.contains(&pool) {
                let projection = match touched.remove(&pool) {
                    Some(projection) => Some(projection),
                    None => self.state.pools.get(&pool).map(|v| v.projection.clone()),
                };
                if let Some(mut projection) = projection {
                    projection.prune_applied(prune_at);
                    jobs.push(RecomputeJob::Derive(projection));
                }
            } else if let Some(view) = self.state.pools.get(&pool) {
                jobs.push(RecomputeJob::Reclose(Arc::clone(view)));
            }
        }

        let results = self.recompute(Arc::clone(&prices), jobs, close).await?;
        let mut pools: BTreeMap<PoolId, Arc<PoolView>> = BTreeMap::new();
        let mut recomputed: BTreeSet<PoolId> = BTreeSet::new();
        for (view, full) in results {
            let pool = view.meta().pool.clone();
            let was_degraded = self
                .state
                .pools
                .get(&pool)
                .is_some_and(|old| old.is_degraded());
            if view.is_degraded() && !was_degraded {
                warn!(pool = %pool, faults = ?view.faults, "Pool degraded");
            } else if was_degraded && !view.is_degraded() {
                info!(pool = %pool, "Pool recovered");
            }
            if full {
                recomputed.insert(pool.clone());
            }
            pools.insert(pool, Arc::new(view));
        }

        // Commit
        let state_json = serde_json::to_string(&PersistedStateRef {
            registry: &registry,
            prices: &prices,
            projections: pools.values().map(|v| &v.projection).collect(),
            pending: pending.values().collect(),
            prices_through,
        })?;

        let mut snapshot = EngineSnapshot {
            chain_id: self.repo.chain_id().clone(),
            high_water: Some(to),
            high_water_time: close_time,
            registry: Arc::clone(&registry),
            prices: Arc::clone(&prices),
            decimals: Arc::clone(&self.decimals),
            pools: pools.clone(),
            digest: String::new(),
        };
        snapshot.digest = snapshot.compute_digest()?;

        let mut checkpoint = self.state.checkpoint.clone();
        checkpoint.advance(
            to,
            close_time,
            stored_through,
            snapshot.digest.clone(),
            run_id,
        );

        let yields = pools
            .iter()
            .filter_map(|(pool, view)| {
                if recomputed.contains(pool) {
                    Some(YieldWrite::Replace(pool, &view.yields))
                } else {
                    view.yields.last().map(YieldWrite::Upsert)
                }
            })
            .collect();
        self.repo
            .commit_batch(&BatchCommit {
                checkpoint: &checkpoint,
                state_json: &state_json,
                registered: &registered,
                quarantined: &quarantined,
                rejected: &rejected,
                released: &released,
                yields,
            })
            .await?;

        let report = BatchReport {
            from,
            to,
            events: events.len(),
            applied,
            recomputed: recomputed.len(),
            reclosed: pools.len() - recomputed.len(),
            quarantined: quarantined.len(),
            released: released.len(),
            rejected: rejected.len(),
        };
        info!(
            run_id = %run_id,
            from = %report.from,
            to = %report.to,
            events = report.events,
            applied = report.applied,
            recomputed = report.recomputed,
            reclosed = report.reclosed,
            quarantined = report.quarantined,
            released = report.released,
            rejected = report.rejected,
            digest = %checkpoint.snapshot_digest,
            "Refresh batch committed"
        );

        self.state = EngineState {
            checkpoint,
            registry,
            prices,
            pools,
            pending,
            prices_through,
        };
        if publish {
            self.snapshots.publish(snapshot);
        }
        Ok(Some(report))
    }

    async fn restore(
        &mut self,
        checkpoint: RefreshCheckpoint,
        persisted: PersistedState,
    ) -> Result<(), RefreshError> {
        let prices = Arc::new(persisted.prices);
        let pools = match checkpoint.high_water {
            Some(height) => {
                let close = IntervalClose {
                    height,
                    time: checkpoint.high_water_time.unwrap_or(UnixSecs::new(0)),
                };
                let jobs = persisted
                    .projections
                    .into_iter()
                    .map(RecomputeJob::Derive)
                    .collect();
                self.recompute(Arc::clone(&prices), jobs, close)
                    .await?
                    .into_iter()
                    .map(|(view, _)| (view.meta().pool.clone(), Arc::new(view)))
                    .collect()
            }
            None => BTreeMap::new(),
        };

        self.state = EngineState {
            checkpoint,
            registry: Arc::new(persisted.registry),
            prices,
            pools,
            pending: persisted
                .pending
                .into_iter()
                .map(|e| (e.key.clone(), e))
                .collect(),
            prices_through: persisted.prices_through,
        };

        let digest = self.build_snapshot()?.digest;
        if digest != self.state.checkpoint.snapshot_digest {
            warn!(
                stored = %self.state.checkpoint.snapshot_digest,
                restored = %digest,
                "Restored state digest differs from checkpoint"
            );
        }
        info!(
            high_water = ?self.state.checkpoint.high_water,
            pools = self.state.pools.len(),
            quarantined = self.state.pending.len(),
            "Engine state restored from checkpoint"
        );
        Ok(())
    }

    async fn recompute(
        &self,
        prices: Arc<PriceBook>,
        jobs: Vec<RecomputeJob>,
        close: IntervalClose,
    ) -> Result<Vec<(PoolView, bool)>, RefreshError> {
        let tasks = jobs.into_iter().map(|job| {
            let prices = Arc::clone(&prices);
            let decimals = Arc::clone(&self.decimals);
            tokio::task::spawn_blocking(move || {
                let valuer = Valuer::new(&prices, &decimals);
                match job {
                    RecomputeJob::Derive(projection) => {
                        (PoolView::derive(projection, valuer, close), true)
                    }
                    RecomputeJob::Reclose(view) => (view.reclose(valuer, close), false),
                }
            })
        });

        let results: Vec<_> = stream::iter(tasks)
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;
        results
            .into_iter()
            .map(|r| r.map_err(|e| RefreshError::Join(e.to_string())))
            .collect()
    }

    fn build_snapshot(&self) -> Result<EngineSnapshot, RefreshError> {
        let mut snapshot = EngineSnapshot {
            chain_id: self.repo.chain_id().clone(),
            high_water: self.state.checkpoint.high_water,
            high_water_time: self.state.checkpoint.high_water_time,
            registry: Arc::clone(&self.state.registry),
            prices: Arc::clone(&self.state.prices),
            decimals: Arc::clone(&self.decimals),
            pools: self.state.pools.clone(),
            digest: String::new(),
        };
        snapshot.digest = snapshot.compute_digest()?;
        Ok(snapshot)
    }
}
