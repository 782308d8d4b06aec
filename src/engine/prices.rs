//! Price join: token prices over time and block-height -> timestamp clocks.

use super::step::StepFunction;
use crate::domain::{BlockHeight, Decimal, Denom, PriceObservation, UnixSecs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maps block heights to block timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockClock {
    times: StepFunction<BlockHeight, UnixSecs>,
}

impl BlockClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the timestamp of `height`. Conflicting reports keep the later time.
    pub fn record(&mut self, height: BlockHeight, time: UnixSecs) {
        let time = match self.times.get(&height) {
            Some(existing) => (*existing).max(time),
            None => time,
        };
        self.times.set(height, time);
    }

    /// Timestamp of the greatest known block at or before `height`.
    pub fn time_at(&self, height: BlockHeight) -> Option<UnixSecs> {
        self.times.value_at(&height).copied()
    }

    /// Recorded heights in ascending order.
    pub fn heights(&self) -> impl Iterator<Item = &BlockHeight> {
        self.times.keys()
    }
}

/// Price time series per token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBook {
    series: BTreeMap<Denom, StepFunction<UnixSecs, Decimal>>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an observation; returns whether the book changed.
    ///
    /// Two observations for the same token and second resolve to the higher price, so the
    /// result does not depend on which one arrived first.
    pub fn record(&mut self, observation: &PriceObservation) -> bool {
        let series = self.series.entry(observation.token.clone()).or_default();
        match series.get(&observation.observed_at) {
            Some(existing) if *existing >= observation.price => false,
            _ => {
                series.set(observation.observed_at, observation.price);
                true
            }
        }
    }

    /// Most recent price of `token` observed at or before `at`.
    pub fn price_at(&self, token: &Denom, at: UnixSecs) -> Option<Decimal> {
        self.series.get(token)?.value_at(&at).copied()
    }
}
