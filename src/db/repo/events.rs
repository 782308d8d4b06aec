//! Event store operations for the repository.

use crate::datasource::{BatchWindow, EventSource, EventSourceError, RejectedEvent, StoredEvents};
use crate::domain::{BlockHeight, ChainId, EventKey, EventKindTag, LedgerEvent, PoolId, UnixSecs};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::warn;

use super::Repository;

impl Repository {
    /// Insert events in a single transaction, ignoring keys already stored.
    ///
    /// Events of another chain are skipped. Returns the number of newly inserted events.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn insert_events_batch(&self, events: &[LedgerEvent]) -> Result<usize, sqlx::Error> {
        if events.is_empty() {
            return Ok(0);
        }

        let created_at = UnixSecs::now().as_i64();
        let mut total_inserted = 0usize;
        let mut tx = self.pool.begin().await?;

        for event in events {
            if event.key.chain_id != self.chain_id {
                warn!(
                    event = %event.key,
                    chain = %self.chain_id,
                    "Skipping event of another chain"
                );
                continue;
            }
            let payload = serde_json::to_string(event)
                .map_err(|e| sqlx::Error::Protocol(format!("event payload: {}", e)))?;

            let result = sqlx::query(
                r#"
                INSERT INTO events (
                    chain_id, height, tx_index, event_index, kind, pool, timestamp,
                    payload, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chain_id, height, tx_index, event_index) DO NOTHING
                "#,
            )
            .bind(self.chain_id.as_str())
            .bind(event.key.height.as_i64())
            .bind(i64::from(event.key.tx_index))
            .bind(i64::from(event.key.event_index))
            .bind(event.tag().as_str())
            .bind(event.pool().map(|p| p.as_str()))
            .bind(event.timestamp.as_i64())
            .bind(payload)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                total_inserted += 1;
            }
        }

        tx.commit().await?;
        Ok(total_inserted)
    }

    /// Events touching `pool` strictly above `height`, in log order.
    ///
    /// Rows whose payload does not decode are skipped with a warning; the refresher keeps
    /// them in quarantine.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_events_for_pool_above(
        &self,
        pool: &PoolId,
        height: BlockHeight,
    ) -> Result<Vec<LedgerEvent>, EventSourceError> {
        let rows = sqlx::query(
            r#"
            SELECT height, tx_index, event_index, pool, payload
            FROM events
            WHERE chain_id = ? AND pool = ? AND height > ?
            ORDER BY height ASC, tx_index ASC, event_index ASC
            "#,
        )
        .bind(self.chain_id.as_str())
        .bind(pool.as_str())
        .bind(height.as_i64())
        .fetch_all(&self.pool)
        .await?;

        let decoded = decode_events(&self.chain_id, &rows);
        for row in &decoded.rejected {
            warn!(event = %row.key, reason = %row.reason, "Skipping undecodable stored event");
        }
        Ok(decoded.events)
    }

    /// Events of one kind with `from <= height <= to`, in log order.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_events_of_kind(
        &self,
        kind: EventKindTag,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<LedgerEvent>, EventSourceError> {
        let rows = sqlx::query(
            r#"
            SELECT height, tx_index, event_index, pool, payload
            FROM events
            WHERE chain_id = ? AND kind = ? AND height >= ? AND height <= ?
            ORDER BY height ASC, tx_index ASC, event_index ASC
            "#,
        )
        .bind(self.chain_id.as_str())
        .bind(kind.as_str())
        .bind(from.as_i64())
        .bind(to.as_i64())
        .fetch_all(&self.pool)
        .await?;

        let decoded = decode_events(&self.chain_id, &rows);
        for row in &decoded.rejected {
            warn!(event = %row.key, reason = %row.reason, "Skipping undecodable stored event");
        }
        Ok(decoded.events)
    }

    /// Events selected by a refresh batch window, in log order.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_events_in_window(
        &self,
        window: BatchWindow,
    ) -> Result<StoredEvents, EventSourceError> {
        let rows = sqlx::query(
            r#"
            SELECT height, tx_index, event_index, pool, payload
            FROM events
            WHERE chain_id = ? AND id <= ? AND height <= ? AND (height >= ? OR id > ?)
            ORDER BY height ASC, tx_index ASC, event_index ASC
            "#,
        )
        .bind(self.chain_id.as_str())
        .bind(window.stored_through)
        .bind(window.to.as_i64())
        .bind(window.from.as_i64())
        .bind(window.stored_after)
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_events(&self.chain_id, &rows))
    }

    /// Storage sequence of the newest event row for this chain, or zero.
    pub async fn latest_sequence(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS seq FROM events WHERE chain_id = ?")
            .bind(self.chain_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("seq"))
    }

    /// Number of stored events for this chain.
    pub async fn count_events(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events WHERE chain_id = ?")
            .bind(self.chain_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    async fn height_bound(&self, aggregate: &str) -> Result<Option<BlockHeight>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {}(height) AS h FROM events WHERE chain_id = ?",
            aggregate
        ))
        .bind(self.chain_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<Option<i64>, _>("h").map(BlockHeight::new))
    }
}

fn decode_events(chain_id: &ChainId, rows: &[SqliteRow]) -> StoredEvents {
    let mut stored = StoredEvents::default();
    for row in rows {
        let payload: String = row.get("payload");
        match serde_json::from_str::<LedgerEvent>(&payload) {
            Ok(event) => stored.events.push(event),
            Err(e) => stored.rejected.push(RejectedEvent {
                key: EventKey::new(
                    chain_id.clone(),
                    BlockHeight::new(row.get("height")),
                    u32::try_from(row.get::<i64, _>("tx_index")).unwrap_or(0),
                    u32::try_from(row.get::<i64, _>("event_index")).unwrap_or(0),
                ),
                pool: row.get::<Option<String>, _>("pool").map(PoolId::new),
                payload,
                reason: format!("stored event: {}", e),
            }),
        }
    }
    stored
}

#[async_trait]
impl EventSource for Repository {
    async fn events_for_pool_above(
        &self,
        pool: &PoolId,
        height: BlockHeight,
    ) -> Result<Vec<LedgerEvent>, EventSourceError> {
        self.query_events_for_pool_above(pool, height).await
    }

    async fn events_of_kind_in_range(
        &self,
        kind: EventKindTag,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<LedgerEvent>, EventSourceError> {
        self.query_events_of_kind(kind, from, to).await
    }

    async fn events_in_window(
        &self,
        window: BatchWindow,
    ) -> Result<StoredEvents, EventSourceError> {
        self.query_events_in_window(window).await
    }

    async fn latest_height(&self) -> Result<Option<BlockHeight>, EventSourceError> {
        Ok(self.height_bound("MAX").await?)
    }

    async fn earliest_height(&self) -> Result<Option<BlockHeight>, EventSourceError> {
        Ok(self.height_bound("MIN").await?)
    }

    async fn latest_sequence(&self) -> Result<i64, EventSourceError> {
        Ok(Repository::latest_sequence(self).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::init_db;
    use crate::domain::{Address, ChainId, Decimal, EventKey, EventKind, StakeChange};
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

    fn stake(chain: &str, height: i64, tx: u32, pool: &str) -> LedgerEvent {
        LedgerEvent::new(
            EventKey::new(ChainId::new(chain), BlockHeight::new(height), tx, 0),
            UnixSecs::new(1_700_000_000 + height),
            EventKind::Stake(StakeChange {
                pool: PoolId::new(pool),
                owner: Address::new("terra1owner"),
                share_amount: Decimal::from_i64(10),
            }),
        )
    }

    #[tokio::test]
    async fn test_insert_events_batch_is_idempotent() {
        let (repo, _temp) = setup_repo().await;
        let events = vec![stake("phoenix-1", 10, 0, "pool-a"), stake("phoenix-1", 11, 0, "pool-a")];

        assert_eq!(repo.insert_events_batch(&events).await.unwrap(), 2);
        assert_eq!(repo.insert_events_batch(&events).await.unwrap(), 0);
        assert_eq!(repo.count_events().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_insert_skips_other_chains() {
        let (repo, _temp) = setup_repo().await;
        let events = vec![stake("phoenix-1", 10, 0, "pool-a"), stake("columbus-5", 10, 0, "pool-a")];
        assert_eq!(repo.insert_events_batch(&events).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reads_are_ordered_and_bounded() {
        let (repo, _temp) = setup_repo().await;
        let events = vec![
            stake("phoenix-1", 12, 1, "pool-a"),
            stake("phoenix-1", 12, 0, "pool-a"),
            stake("phoenix-1", 10, 0, "pool-b"),
            stake("phoenix-1", 15, 0, "pool-a"),
        ];
        repo.insert_events_batch(&events).await.unwrap();

        let above = repo
            .events_for_pool_above(&PoolId::new("pool-a"), BlockHeight::new(12))
            .await
            .unwrap();
        assert_eq!(above.len(), 1);
        assert_eq!(above[0].height(), BlockHeight::new(15));

        let window = BatchWindow {
            from: BlockHeight::new(10),
            to: BlockHeight::new(12),
            stored_after: repo.latest_sequence().await.unwrap(),
            stored_through: repo.latest_sequence().await.unwrap(),
        };
        let in_range = repo.events_in_window(window).await.unwrap().events;
        let positions: Vec<String> = in_range.iter().map(|e| e.position().to_string()).collect();
        assert_eq!(positions, vec!["10/0/0", "12/0/0", "12/1/0"]);

        let stakes = repo
            .events_of_kind_in_range(EventKindTag::Stake, BlockHeight::new(12), BlockHeight::new(15))
            .await
            .unwrap();
        let positions: Vec<String> = stakes.iter().map(|e| e.position().to_string()).collect();
        assert_eq!(positions, vec!["12/0/0", "12/1/0", "15/0/0"]);
        let swaps = repo
            .events_of_kind_in_range(EventKindTag::Swap, BlockHeight::new(0), BlockHeight::new(99))
            .await
            .unwrap();
        assert!(swaps.is_empty());

        assert_eq!(repo.latest_height().await.unwrap(), Some(BlockHeight::new(15)));
        assert_eq!(repo.earliest_height().await.unwrap(), Some(BlockHeight::new(10)));
    }

    #[tokio::test]
    async fn test_empty_store_has_no_heights() {
        let (repo, _temp) = setup_repo().await;
        assert_eq!(repo.latest_height().await.unwrap(), None);
        assert_eq!(repo.earliest_height().await.unwrap(), None);
        assert_eq!(EventSource::latest_sequence(&repo).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_window_reads_rows_stored_late_below_range() {
        let (repo, _temp) = setup_repo().await;
        repo.insert_events_batch(&[stake("phoenix-1", 400, 0, "pool-a")])
            .await
            .unwrap();
        let seen = repo.latest_sequence().await.unwrap();

        repo.insert_events_batch(&[
            stake("phoenix-1", 150, 0, "pool-a"),
            stake("phoenix-1", 410, 0, "pool-a"),
        ])
        .await
        .unwrap();
        let window = BatchWindow {
            from: BlockHeight::new(301),
            to: BlockHeight::new(410),
            stored_after: seen,
            stored_through: repo.latest_sequence().await.unwrap(),
        };
        let heights: Vec<i64> = repo
            .events_in_window(window)
            .await
            .unwrap()
            .events
            .iter()
            .map(|e| e.height().as_i64())
            .collect();
        assert_eq!(heights, vec![150, 400, 410]);

        // The same window one batch later no longer sees the late row
        let next = BatchWindow {
            stored_after: window.stored_through,
            ..window
        };
        let heights: Vec<i64> = repo
            .events_in_window(next)
            .await
            .unwrap()
            .events
            .iter()
            .map(|e| e.height().as_i64())
            .collect();
        assert_eq!(heights, vec![400, 410]);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_rejected_not_fatal() {
        let (repo, _temp) = setup_repo().await;
        repo.insert_events_batch(&[stake("phoenix-1", 10, 0, "pool-a")])
            .await
            .unwrap();
        sqlx::query(
            r#"
            INSERT INTO events (
                chain_id, height, tx_index, event_index, kind, pool, timestamp, payload, created_at
            ) VALUES ('phoenix-1', 11, 0, 0, 'stake', 'pool-b', 0, '{"kind":', 0)
            "#,
        )
        .execute(repo.pool())
        .await
        .unwrap();

        let window = BatchWindow {
            from: BlockHeight::new(0),
            to: BlockHeight::new(20),
            stored_after: 0,
            stored_through: repo.latest_sequence().await.unwrap(),
        };
        let stored = repo.events_in_window(window).await.unwrap();
        assert_eq!(stored.events.len(), 1);
        assert_eq!(stored.rejected.len(), 1);
        assert_eq!(stored.rejected[0].key.height, BlockHeight::new(11));
        assert_eq!(stored.rejected[0].pool, Some(PoolId::new("pool-b")));
        assert_eq!(stored.rejected[0].payload, r#"{"kind":"#);

        let pool_b = repo
            .events_for_pool_above(&PoolId::new("pool-b"), BlockHeight::new(0))
            .await
            .unwrap();
        assert!(pool_b.is_empty());
    }
}
