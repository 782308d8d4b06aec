use crate::datasource::{EventFeed, EventSource, EventSourceError, HttpPriceFeed, PriceFeedError};
use crate::db::Repository;
use crate::domain::{BlockHeight, EventPosition};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Events requested per feed page.
pub const FEED_PAGE_SIZE: usize = 1_000;

/// Mirrors remote event and price feeds into the local store.
#[derive(Debug, Clone)]
pub struct FeedSync {
    feed: Option<Arc<dyn EventFeed>>,
    prices: Option<HttpPriceFeed>,
    repo: Repository,
    lookback_blocks: i64,
    page_size: usize,
}

impl FeedSync {
    pub fn new(repo: Repository, lookback_blocks: i64) -> Self {
        Self {
            feed: None,
            prices: None,
            repo,
            lookback_blocks,
            page_size: FEED_PAGE_SIZE,
        }
    }

    pub fn with_event_feed(mut self, feed: Arc<dyn EventFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_price_feed(mut self, prices: HttpPriceFeed) -> Self {
        self.prices = Some(prices);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Pull every feed event above the local latest height minus the lookback.
    ///
    /// Re-fetched events are ignored by the idempotent insert.
    pub async fn sync_events(&self) -> Result<SyncResult, SyncError> {
        let Some(feed) = &self.feed else {
            return Ok(SyncResult::default());
        };

        let local_latest = self.repo.latest_height().await?;
        let fetch_above = local_latest
            .map(|h| h.saturating_sub(self.lookback_blocks))
            .unwrap_or(BlockHeight::new(0));

        info!(
            local_latest = ?local_latest,
            fetch_above = %fetch_above,
            lookback = self.lookback_blocks,
            "Syncing events from feed"
        );

        let mut result = SyncResult {
            fetch_above: Some(fetch_above),
            ..SyncResult::default()
        };
        // Pages resume after the last event's full position, so a page ending inside a
        // height picks up the rest of that height.
        let mut cursor = EventPosition::end_of(fetch_above);
        loop {
            let events = feed.fetch_events_after(cursor, self.page_size).await?;
            let Some(last) = events.last().map(|e| e.position()) else {
                break;
            };
            if last <= cursor {
                debug!(cursor = %cursor, "Feed page did not advance, stopping");
                break;
            }

            result.pages += 1;
            result.events_fetched += events.len();
            result.events_new += self.repo.insert_events_batch(&events).await?;

            if events.len() < self.page_size {
                break;
            }
            cursor = last;
        }

        Ok(result)
    }

    /// Download the price file and store its observations.
    pub async fn sync_prices(&self) -> Result<usize, SyncError> {
        let Some(prices) = &self.prices else {
            return Ok(0);
        };
        let observations = prices.fetch_prices().await?;
        let inserted = self.repo.insert_prices_batch(&observations).await?;
        info!(
            url = %prices.url(),
            fetched = observations.len(),
            inserted,
            "Price feed synced"
        );
        Ok(inserted)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub fetch_above: Option<BlockHeight>,
    pub pages: usize,
    pub events_fetched: usize,
    pub events_new: usize,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Feed(#[from] EventSourceError),
    #[error(transparent)]
    Prices(#[from] PriceFeedError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::MockEventSource;
    use crate::db::migrations::init_db;
    use crate::domain::{
        Address, ChainId, Decimal, EventKey, EventKind, LedgerEvent, PoolId, StakeChange,
        UnixSecs,
    };
    use tempfile::TempDir;

    async fn setup_repo() -> (Repository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (Repository::new(pool, ChainId::new("phoenix-1")), temp_dir)
    }

    fn stake(height: i64, tx: u32) -> LedgerEvent {
        stake_at(height, tx, 0)
    }

    fn stake_at(height: i64, tx: u32, event: u32) -> LedgerEvent {
        LedgerEvent::new(
            EventKey::new(ChainId::new("phoenix-1"), BlockHeight::new(height), tx, event),
            UnixSecs::new(1_700_000_000 + height),
            EventKind::Stake(StakeChange {
                pool: PoolId::new("pool-a"),
                owner: Address::new("terra1owner"),
                share_amount: Decimal::from_i64(1),
            }),
        )
    }

    #[tokio::test]
    async fn test_sync_events_pages_and_is_idempotent() {
        let feed = MockEventSource::new().with_events(vec![
            stake(1, 0),
            stake(2, 0),
            stake(2, 1),
            stake(3, 0),
            stake(4, 0),
        ]);
        let (repo, _temp) = setup_repo().await;
        let sync = FeedSync::new(repo.clone(), 0)
            .with_event_feed(Arc::new(feed))
            .with_page_size(2);

        let result = sync.sync_events().await.unwrap();
        assert_eq!(result.events_new, 5);
        assert!(result.pages >= 3);
        assert_eq!(repo.count_events().await.unwrap(), 5);

        let again = sync.sync_events().await.unwrap();
        assert_eq!(again.events_new, 0);
    }

    #[tokio::test]
    async fn test_sync_pages_through_a_single_crowded_height() {
        let mut events = vec![stake(1, 0)];
        for tx in 0..3 {
            for event in 0..2 {
                events.push(stake_at(7, tx, event));
            }
        }
        events.push(stake(8, 0));
        let feed = MockEventSource::new().with_events(events);
        let (repo, _temp) = setup_repo().await;
        let sync = FeedSync::new(repo.clone(), 0)
            .with_event_feed(Arc::new(feed))
            .with_page_size(2);

        let result = sync.sync_events().await.unwrap();
        assert_eq!(result.events_new, 8);
        assert_eq!(result.events_fetched, 8);
        assert_eq!(repo.count_events().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_sync_applies_lookback() {
        let feed = MockEventSource::new().with_events(vec![stake(10, 0)]);
        let (repo, _temp) = setup_repo().await;
        repo.insert_events_batch(&[stake(50, 0)]).await.unwrap();

        let sync = FeedSync::new(repo, 45).with_event_feed(Arc::new(feed));
        let result = sync.sync_events().await.unwrap();
        assert_eq!(result.fetch_above, Some(BlockHeight::new(5)));
        assert_eq!(result.events_new, 1);
    }

    #[tokio::test]
    async fn test_sync_without_feeds_is_noop() {
        let (repo, _temp) = setup_repo().await;
        let sync = FeedSync::new(repo, 100);
        assert_eq!(sync.sync_events().await.unwrap(), SyncResult::default());
        assert_eq!(sync.sync_prices().await.unwrap(), 0);
    }
}
