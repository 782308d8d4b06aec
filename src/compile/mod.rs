//! Refresh pipeline: turns newly stored events into a published engine snapshot.
//!
//! This module provides:
//! - High-water-mark checkpoints persisted once per batch
//! - Batched, resumable, cancellable refresh with late-event lookback
//! - Quarantine and retry of events for unregistered pools
//! - Immutable snapshots published atomically for the query surface

use crate::domain::{BlockHeight, ChainId, UnixSecs};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod refresh;
pub mod snapshot;

pub use refresh::{RefreshError, RefreshOutcome, RefreshSettings, Refresher};
pub use snapshot::{EngineSnapshot, PoolView, SnapshotHandle};

/// Version of the derived-state format. A stored checkpoint with another version is
/// discarded and the state rebuilt from the event store.
pub const COMPILE_VERSION: i64 = 2;

/// Refresh progress for one chain, stored after every committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshCheckpoint {
    pub chain_id: ChainId,
    /// Highest height whose events are folded into the state.
    pub high_water: Option<BlockHeight>,
    /// Block time of the high-water mark.
    pub high_water_time: Option<UnixSecs>,
    /// Storage sequence of the newest stored event the state has seen, at any height.
    #[serde(default)]
    pub stored_through: i64,
    pub compile_version: i64,
    /// Digest of the snapshot published with this checkpoint.
    pub snapshot_digest: String,
    pub run_id: Uuid,
}

impl RefreshCheckpoint {
    /// Create an empty checkpoint for a chain.
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            high_water: None,
            high_water_time: None,
            stored_through: 0,
            compile_version: COMPILE_VERSION,
            snapshot_digest: String::new(),
            run_id: Uuid::nil(),
        }
    }

    pub fn is_current_version(&self) -> bool {
        self.compile_version == COMPILE_VERSION
    }

    /// First height the next batch must read, given the late-event lookback.
    pub fn next_read_from(&self, lookback_blocks: i64) -> BlockHeight {
        match self.high_water {
            Some(hw) => BlockHeight::new(hw.as_i64() + 1).saturating_sub(lookback_blocks),
            None => BlockHeight::new(0),
        }
    }

    /// Move the high-water mark after a committed batch.
    pub fn advance(
        &mut self,
        high_water: BlockHeight,
        high_water_time: Option<UnixSecs>,
        stored_through: i64,
        snapshot_digest: String,
        run_id: Uuid,
    ) {
        self.high_water = Some(high_water);
        self.high_water_time = high_water_time;
        self.stored_through = self.stored_through.max(stored_through);
        self.snapshot_digest = snapshot_digest;
        self.run_id = run_id;
        self.compile_version = COMPILE_VERSION;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_new_is_empty() {
        let checkpoint = RefreshCheckpoint::new(ChainId::new("phoenix-1"));
        assert!(checkpoint.high_water.is_none());
        assert_eq!(checkpoint.stored_through, 0);
        assert!(checkpoint.is_current_version());
        assert_eq!(checkpoint.next_read_from(100), BlockHeight::new(0));
    }

    #[test]
    fn test_checkpoint_advance() {
        let mut checkpoint = RefreshCheckpoint::new(ChainId::new("phoenix-1"));
        let run_id = Uuid::new_v4();
        checkpoint.advance(
            BlockHeight::new(500),
            Some(UnixSecs::new(1_700_000_000)),
            42,
            "abc".to_string(),
            run_id,
        );

        assert_eq!(checkpoint.high_water, Some(BlockHeight::new(500)));
        assert_eq!(checkpoint.stored_through, 42);
        assert_eq!(checkpoint.snapshot_digest, "abc");
        assert_eq!(checkpoint.run_id, run_id);
    }

    #[test]
    fn test_stored_through_never_moves_back() {
        let mut checkpoint = RefreshCheckpoint::new(ChainId::new("phoenix-1"));
        checkpoint.advance(BlockHeight::new(10), None, 9, String::new(), Uuid::nil());
        checkpoint.advance(BlockHeight::new(20), None, 4, String::new(), Uuid::nil());
        assert_eq!(checkpoint.stored_through, 9);
        assert_eq!(checkpoint.high_water, Some(BlockHeight::new(20)));
    }

    #[test]
    fn test_next_read_from_applies_lookback() {
        let mut checkpoint = RefreshCheckpoint::new(ChainId::new("phoenix-1"));
        checkpoint.advance(BlockHeight::new(500), None, 0, String::new(), Uuid::nil());
        assert_eq!(checkpoint.next_read_from(100), BlockHeight::new(401));
        assert_eq!(checkpoint.next_read_from(0), BlockHeight::new(501));
        assert_eq!(checkpoint.next_read_from(10_000), BlockHeight::new(0));
    }
}
