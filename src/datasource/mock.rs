//! Mock data source for testing without a database or network.

use super::{
    BatchWindow, EventFeed, EventSource, EventSourceError, PriceSource, RejectedEvent,
    StoredEvents,
};
use crate::domain::{
    sort_events_deterministic, BlockHeight, EventKindTag, EventPosition, LedgerEvent, PoolId,
    PriceObservation, UnixSecs,
};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
enum MockRow {
    Event(LedgerEvent),
    Undecodable(RejectedEvent),
}

impl MockRow {
    fn position(&self) -> EventPosition {
        match self {
            MockRow::Event(event) => event.position(),
            MockRow::Undecodable(rejected) => rejected.position(),
        }
    }

    fn same_key(&self, other: &MockRow) -> bool {
        let key = |row: &MockRow| match row {
            MockRow::Event(event) => event.key.clone(),
            MockRow::Undecodable(rejected) => rejected.key.clone(),
        };
        key(self) == key(other)
    }
}

/// In-memory event store that returns predefined test data.
///
/// Clones share storage, so a test can keep appending (late) events after handing the mock
/// to a refresher. Rows keep insertion order; a row's storage sequence is its index plus one.
#[derive(Debug, Clone, Default)]
pub struct MockEventSource {
    rows: Arc<RwLock<Vec<MockRow>>>,
    prices: Arc<RwLock<Vec<PriceObservation>>>,
}

impl MockEventSource {
    /// Create a new mock data source with empty data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event to the mock data source.
    pub fn with_event(self, event: LedgerEvent) -> Self {
        self.push_event(event);
        self
    }

    /// Add multiple events to the mock data source.
    pub fn with_events(self, events: Vec<LedgerEvent>) -> Self {
        for event in events {
            self.push_event(event);
        }
        self
    }

    /// Add a price observation to the mock data source.
    pub fn with_price(self, price: PriceObservation) -> Self {
        self.push_price(price);
        self
    }

    /// Append an event after construction. Duplicate keys are ignored like the real store.
    pub fn push_event(&self, event: LedgerEvent) {
        self.push_row(MockRow::Event(event));
    }

    /// Append a row whose payload does not decode.
    pub fn push_undecodable(&self, rejected: RejectedEvent) {
        self.push_row(MockRow::Undecodable(rejected));
    }

    fn push_row(&self, row: MockRow) {
        if let Ok(mut rows) = self.rows.write() {
            if !rows.iter().any(|r| r.same_key(&row)) {
                rows.push(row);
            }
        }
    }

    pub fn push_price(&self, price: PriceObservation) {
        if let Ok(mut prices) = self.prices.write() {
            prices.push(price);
        }
    }

    fn sequenced(&self) -> Result<Vec<(i64, MockRow)>, EventSourceError> {
        let rows = self
            .rows
            .read()
            .map_err(|e| EventSourceError::Storage(e.to_string()))?;
        let mut sequenced: Vec<(i64, MockRow)> = rows
            .iter()
            .cloned()
            .zip(1_i64..)
            .map(|(row, seq)| (seq, row))
            .collect();
        sequenced.sort_by_key(|(_, row)| row.position());
        Ok(sequenced)
    }

    fn snapshot(&self) -> Result<Vec<LedgerEvent>, EventSourceError> {
        let mut events: Vec<LedgerEvent> = self
            .sequenced()?
            .into_iter()
            .filter_map(|(_, row)| match row {
                MockRow::Event(event) => Some(event),
                MockRow::Undecodable(_) => None,
            })
            .collect();
        sort_events_deterministic(&mut events);
        Ok(events)
    }
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn events_for_pool_above(
        &self,
        pool: &PoolId,
        height: BlockHeight,
    ) -> Result<Vec<LedgerEvent>, EventSourceError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|e| e.pool() == Some(pool) && e.height() > height)
            .collect())
    }

    async fn events_of_kind_in_range(
        &self,
        kind: EventKindTag,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<LedgerEvent>, EventSourceError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|e| e.tag() == kind && e.height() >= from && e.height() <= to)
            .collect())
    }

    async fn events_in_window(
        &self,
        window: BatchWindow,
    ) -> Result<StoredEvents, EventSourceError> {
        let mut stored = StoredEvents::default();
        for (seq, row) in self.sequenced()? {
            if !window.contains(row.position().height, seq) {
                continue;
            }
            match row {
                MockRow::Event(event) => stored.events.push(event),
                MockRow::Undecodable(rejected) => stored.rejected.push(rejected),
            }
        }
        sort_events_deterministic(&mut stored.events);
        Ok(stored)
    }

    async fn latest_height(&self) -> Result<Option<BlockHeight>, EventSourceError> {
        Ok(self
            .sequenced()?
            .last()
            .map(|(_, row)| row.position().height))
    }

    async fn earliest_height(&self) -> Result<Option<BlockHeight>, EventSourceError> {
        Ok(self
            .sequenced()?
            .first()
            .map(|(_, row)| row.position().height))
    }

    async fn latest_sequence(&self) -> Result<i64, EventSourceError> {
        let rows = self
            .rows
            .read()
            .map_err(|e| EventSourceError::Storage(e.to_string()))?;
        Ok(rows.len() as i64)
    }
}

#[async_trait]
impl PriceSource for MockEventSource {
    async fn prices_between(
        &self,
        from: UnixSecs,
        to: UnixSecs,
    ) -> Result<Vec<PriceObservation>, EventSourceError> {
        let prices = self
            .prices
            .read()
            .map_err(|e| EventSourceError::Storage(e.to_string()))?;
        let mut selected: Vec<PriceObservation> = prices
            .iter()
            .filter(|p| p.observed_at >= from && p.observed_at <= to)
            .cloned()
            .collect();
        selected.sort_by(|a, b| {
            a.observed_at
                .cmp(&b.observed_at)
                .then_with(|| a.token.cmp(&b.token))
                .then_with(|| a.price.cmp(&b.price))
        });
        Ok(selected)
    }
}

#[async_trait]
impl EventFeed for MockEventSource {
    async fn fetch_events_after(
        &self,
        after: EventPosition,
        limit: usize,
    ) -> Result<Vec<LedgerEvent>, EventSourceError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|e| e.position() > after)
            .take(limit)
            .collect())
    }
}
