//! Stable event ordering for deterministic processing.

use crate::domain::{BlockHeight, LedgerEvent};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of an event on the logical clock.
///
/// Ordering: height -> tx_index -> event_index. Arrival order never participates.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct EventPosition {
    /// Block height (primary sort).
    pub height: BlockHeight,
    /// Transaction index within the block (secondary sort).
    pub tx_index: u32,
    /// Event index within the transaction (tertiary sort).
    pub event_index: u32,
}

impl EventPosition {
    pub fn new(height: BlockHeight, tx_index: u32, event_index: u32) -> Self {
        EventPosition {
            height,
            tx_index,
            event_index,
        }
    }

    /// The greatest position inside `height`.
    ///
    /// Predecessor lookups with this bound see every event of the block, which is what
    /// "as of height H" means.
    pub fn end_of(height: BlockHeight) -> Self {
        EventPosition {
            height,
            tx_index: u32::MAX,
            event_index: u32::MAX,
        }
    }

    /// The smallest position inside `height`.
    pub fn start_of(height: BlockHeight) -> Self {
        EventPosition {
            height,
            tx_index: 0,
            event_index: 0,
        }
    }
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.height, self.tx_index, self.event_index)
    }
}

/// Sort events deterministically by (height, tx_index, event_index, chain_id).
pub fn sort_events_deterministic(events: &mut [LedgerEvent]) {
    events.sort_by(|a, b| {
        a.position()
            .cmp(&b.position())
            .then_with(|| a.key.chain_id.cmp(&b.key.chain_id))
    });
}
