//! Data source abstraction for reading events and prices.
//!
//! The engine only reads through these traits; the SQLite repository, the in-memory mock and
//! the remote feeds all sit behind them.

use crate::domain::{
    BlockHeight, EventKey, EventKindTag, EventPosition, LedgerEvent, PoolId, PriceObservation,
    UnixSecs,
};
use async_trait::async_trait;
use std::fmt;

pub mod http_feed;
pub mod mock;
pub mod price_feed;

pub use http_feed::HttpEventFeed;
pub use mock::MockEventSource;
pub use price_feed::{parse_price_csv, HttpPriceFeed, PriceFeedError};

/// Events one refresh batch reads from the store.
///
/// Every stored event carries a storage sequence that grows with each insert. A batch reads
/// the events visible up to `stored_through` that either sit in `from..=to` or were stored
/// after `stored_after` at any height up to `to`. The second half is how events stored late,
/// below the high-water mark, reach the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub from: BlockHeight,
    pub to: BlockHeight,
    pub stored_after: i64,
    pub stored_through: i64,
}

impl BatchWindow {
    pub fn contains(&self, height: BlockHeight, sequence: i64) -> bool {
        sequence <= self.stored_through
            && height <= self.to
            && (height >= self.from || sequence > self.stored_after)
    }
}

/// A stored row whose payload no longer decodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEvent {
    pub key: EventKey,
    pub pool: Option<PoolId>,
    pub payload: String,
    pub reason: String,
}

impl RejectedEvent {
    pub fn position(&self) -> EventPosition {
        self.key.position()
    }
}

/// Result of a batch read: decoded events plus rows set aside as undecodable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredEvents {
    pub events: Vec<LedgerEvent>,
    pub rejected: Vec<RejectedEvent>,
}

/// Read access to the append-only event store.
///
/// Every method returns events ordered by (height, tx_index, event_index).
#[async_trait]
pub trait EventSource: Send + Sync + fmt::Debug {
    /// Events touching `pool` with height strictly above `height`.
    async fn events_for_pool_above(
        &self,
        pool: &PoolId,
        height: BlockHeight,
    ) -> Result<Vec<LedgerEvent>, EventSourceError>;

    /// Events of one kind with `from <= height <= to`.
    async fn events_of_kind_in_range(
        &self,
        kind: EventKindTag,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<LedgerEvent>, EventSourceError>;

    /// Events selected by `window`.
    async fn events_in_window(&self, window: BatchWindow)
        -> Result<StoredEvents, EventSourceError>;

    /// Highest stored height, or `None` for an empty store.
    async fn latest_height(&self) -> Result<Option<BlockHeight>, EventSourceError>;

    /// Lowest stored height, or `None` for an empty store.
    async fn earliest_height(&self) -> Result<Option<BlockHeight>, EventSourceError>;

    /// Storage sequence of the most recently stored event; zero for an empty store.
    async fn latest_sequence(&self) -> Result<i64, EventSourceError>;
}

/// Read access to the price time series.
#[async_trait]
pub trait PriceSource: Send + Sync + fmt::Debug {
    /// Observations with `from <= observed_at <= to`, ordered by time then token.
    async fn prices_between(
        &self,
        from: UnixSecs,
        to: UnixSecs,
    ) -> Result<Vec<PriceObservation>, EventSourceError>;
}

/// A remote feed of normalized events, mirrored into the local store.
#[async_trait]
pub trait EventFeed: Send + Sync + fmt::Debug {
    /// Up to `limit` events positioned strictly after `after`, in order.
    async fn fetch_events_after(
        &self,
        after: EventPosition,
        limit: usize,
    ) -> Result<Vec<LedgerEvent>, EventSourceError>;
}

/// Error type for data source operations.
#[derive(Debug, Clone)]
pub enum EventSourceError {
    /// Network error (e.g., connection timeout, DNS failure)
    NetworkError(String),
    /// HTTP error (e.g., 429 rate limit, 5xx server error)
    HttpError { status: u16, message: String },
    /// Stored or fetched payload could not be decoded
    ParseError(String),
    /// Rate limit exceeded (caller should implement backoff)
    RateLimited,
    /// Storage failure
    Storage(String),
}

impl fmt::Display for EventSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSourceError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            EventSourceError::HttpError { status, message } => {
                write!(f, "HTTP error {}: {}", status, message)
            }
            EventSourceError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            EventSourceError::RateLimited => write!(f, "Rate limited"),
            EventSourceError::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for EventSourceError {}

impl From<sqlx::Error> for EventSourceError {
    fn from(err: sqlx::Error) -> Self {
        EventSourceError::Storage(err.to_string())
    }
}
