//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by domain:
//! - `events.rs` - Event store inserts and ordered reads
//! - `prices.rs` - Price observation inserts and range reads
//!
//! Derived state (checkpoint, registry mirror, yield rows, quarantine) lives here.

mod events;
mod prices;

use crate::compile::RefreshCheckpoint;
use crate::datasource::RejectedEvent;
use crate::domain::{
    BlockHeight, ChainId, Denom, EventKey, EventPosition, LedgerEvent, PoolId, PoolMeta,
    TokenMeta, UnixSecs,
};
use crate::engine::YieldSnapshot;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::warn;
use uuid::Uuid;

/// Checkpoint row together with the serialized engine state committed with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCheckpoint {
    pub checkpoint: RefreshCheckpoint,
    pub state_json: String,
}

/// Event excluded from aggregation, with the reason it was set aside.
///
/// `event` is `None` when the stored payload itself does not decode; `payload` keeps the raw
/// text either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantinedEvent {
    pub key: EventKey,
    pub pool: Option<PoolId>,
    pub event: Option<LedgerEvent>,
    pub payload: String,
    pub reason: String,
    pub first_seen_at: UnixSecs,
}

/// Yield rows written by one batch.
#[derive(Debug, Clone, Copy)]
pub enum YieldWrite<'a> {
    /// Every row of the pool was recomputed.
    Replace(&'a PoolId, &'a [YieldSnapshot]),
    /// Only the open tail row moved.
    Upsert(&'a YieldSnapshot),
}

/// Everything one refresh batch persists, written in a single transaction.
#[derive(Debug, Clone)]
pub struct BatchCommit<'a> {
    pub checkpoint: &'a RefreshCheckpoint,
    pub state_json: &'a str,
    pub registered: &'a [PoolMeta],
    pub quarantined: &'a [(LedgerEvent, String)],
    /// Stored rows whose payload does not decode.
    pub rejected: &'a [RejectedEvent],
    pub released: &'a [EventKey],
    pub yields: Vec<YieldWrite<'a>>,
}

/// Repository for database operations, scoped to one chain.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
    chain_id: ChainId,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool, chain_id: ChainId) -> Self {
        Repository { pool, chain_id }
    }

    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Checkpoint operations
    // =========================================================================

    /// Load the last committed checkpoint for this chain.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn load_checkpoint(&self) -> Result<Option<StoredCheckpoint>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT high_water, high_water_time, stored_through, compile_version, state_json,
                   snapshot_digest, run_id
            FROM refresh_checkpoint
            WHERE chain_id = ?
            "#,
        )
        .bind(self.chain_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let run_id_str: String = r.get("run_id");
            let run_id = Uuid::parse_str(&run_id_str).unwrap_or_else(|e| {
                warn!(run_id = %run_id_str, error = %e, "Failed to parse checkpoint run id, using nil");
                Uuid::nil()
            });
            StoredCheckpoint {
                checkpoint: RefreshCheckpoint {
                    chain_id: self.chain_id.clone(),
                    high_water: r.get::<Option<i64>, _>("high_water").map(BlockHeight::new),
                    high_water_time: r
                        .get::<Option<i64>, _>("high_water_time")
                        .map(UnixSecs::new),
                    stored_through: r.get("stored_through"),
                    compile_version: r.get("compile_version"),
                    snapshot_digest: r.get("snapshot_digest"),
                    run_id,
                },
                state_json: r.get("state_json"),
            }
        }))
    }

    /// Persist one refresh batch atomically: checkpoint, engine state, registry additions,
    /// quarantine changes and yield rows either all land or none do.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn commit_batch(&self, batch: &BatchCommit<'_>) -> Result<(), sqlx::Error> {
        let now = UnixSecs::now().as_i64();
        let chain = self.chain_id.as_str();
        let mut tx = self.pool.begin().await?;

        for meta in batch.registered {
            sqlx::query(
                r#"
                INSERT INTO pool_registry (
                    chain_id, pool, token0, token0_decimals, token1, token1_decimals,
                    share_token, created_height, created_tx_index, created_event_index
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chain_id, pool) DO NOTHING
                "#,
            )
            .bind(chain)
            .bind(meta.pool.as_str())
            .bind(meta.token0.denom.as_str())
            .bind(meta.token0.decimals.map(i64::from))
            .bind(meta.token1.denom.as_str())
            .bind(meta.token1.decimals.map(i64::from))
            .bind(meta.share_token.as_str())
            .bind(meta.created_at.height.as_i64())
            .bind(i64::from(meta.created_at.tx_index))
            .bind(i64::from(meta.created_at.event_index))
            .execute(&mut *tx)
            .await?;
        }

        for (event, reason) in batch.quarantined {
            let payload = serde_json::to_string(event)
                .map_err(|e| sqlx::Error::Protocol(format!("quarantine payload: {}", e)))?;
            upsert_quarantine_row(&mut tx, chain, &event.key, event.pool(), reason, &payload, now)
                .await?;
        }

        for row in batch.rejected {
            upsert_quarantine_row(
                &mut tx,
                chain,
                &row.key,
                row.pool.as_ref(),
                &row.reason,
                &row.payload,
                now,
            )
            .await?;
        }

        for key in batch.released {
            sqlx::query(
                r#"
                DELETE FROM quarantine
                WHERE chain_id = ? AND height = ? AND tx_index = ? AND event_index = ?
                "#,
            )
            .bind(chain)
            .bind(key.height.as_i64())
            .bind(i64::from(key.tx_index))
            .bind(i64::from(key.event_index))
            .execute(&mut *tx)
            .await?;
        }

        for write in &batch.yields {
            match write {
                YieldWrite::Replace(pool, rows) => {
                    sqlx::query("DELETE FROM yield_snapshots WHERE chain_id = ? AND pool = ?")
                        .bind(chain)
                        .bind(pool.as_str())
                        .execute(&mut *tx)
                        .await?;
                    for row in rows.iter() {
                        upsert_yield_row(&mut tx, chain, row).await?;
                    }
                }
                YieldWrite::Upsert(row) => upsert_yield_row(&mut tx, chain, row).await?,
            }
        }

        let checkpoint = batch.checkpoint;
        sqlx::query(
            r#"
            INSERT INTO refresh_checkpoint (
                chain_id, high_water, high_water_time, stored_through, compile_version,
                state_json, snapshot_digest, run_id, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chain_id) DO UPDATE SET
                high_water = excluded.high_water,
                high_water_time = excluded.high_water_time,
                stored_through = excluded.stored_through,
                compile_version = excluded.compile_version,
                state_json = excluded.state_json,
                snapshot_digest = excluded.snapshot_digest,
                run_id = excluded.run_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(chain)
        .bind(checkpoint.high_water.map(|h| h.as_i64()))
        .bind(checkpoint.high_water_time.map(|t| t.as_i64()))
        .bind(checkpoint.stored_through)
        .bind(checkpoint.compile_version)
        .bind(batch.state_json)
        .bind(checkpoint.snapshot_digest.as_str())
        .bind(checkpoint.run_id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Drop every derived row for this chain. The event and price stores are untouched.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn clear_derived(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "refresh_checkpoint",
            "pool_registry",
            "yield_snapshots",
            "quarantine",
        ] {
            sqlx::query(&format!("DELETE FROM {} WHERE chain_id = ?", table))
                .bind(self.chain_id.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Derived table reads
    // =========================================================================

    /// Quarantined events, oldest position first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_quarantine(&self) -> Result<Vec<QuarantinedEvent>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT height, tx_index, event_index, pool, reason, payload, first_seen_at
            FROM quarantine
            WHERE chain_id = ?
            ORDER BY height ASC, tx_index ASC, event_index ASC
            "#,
        )
        .bind(self.chain_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let payload: String = row.get("payload");
                let event = serde_json::from_str::<LedgerEvent>(&payload).ok();
                QuarantinedEvent {
                    key: EventKey::new(
                        self.chain_id.clone(),
                        BlockHeight::new(row.get("height")),
                        u32::try_from(row.get::<i64, _>("tx_index")).unwrap_or(0),
                        u32::try_from(row.get::<i64, _>("event_index")).unwrap_or(0),
                    ),
                    pool: row.get::<Option<String>, _>("pool").map(PoolId::new),
                    event,
                    payload,
                    reason: row.get("reason"),
                    first_seen_at: UnixSecs::new(row.get("first_seen_at")),
                }
            })
            .collect())
    }

    /// Stored yield rows for a pool with `from <= height <= to`.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_yield_snapshots(
        &self,
        pool: &PoolId,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<YieldSnapshot>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT row_json
            FROM yield_snapshots
            WHERE chain_id = ? AND pool = ? AND height >= ? AND height <= ?
            ORDER BY height ASC
            "#,
        )
        .bind(self.chain_id.as_str())
        .bind(pool.as_str())
        .bind(from.as_i64())
        .bind(to.as_i64())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.get("row_json");
            match serde_json::from_str::<YieldSnapshot>(&json) {
                Ok(snapshot) => out.push(snapshot),
                Err(e) => warn!(pool = %pool, error = %e, "Failed to decode yield row, skipping"),
            }
        }
        Ok(out)
    }

    /// Pools mirrored into `pool_registry`, ordered by pool id.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn registered_pools(&self) -> Result<Vec<PoolMeta>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT pool, token0, token0_decimals, token1, token1_decimals, share_token,
                   created_height, created_tx_index, created_event_index
            FROM pool_registry
            WHERE chain_id = ?
            ORDER BY pool ASC
            "#,
        )
        .bind(self.chain_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let decimals = |column: &str| {
                    r.get::<Option<i64>, _>(column)
                        .and_then(|d| u32::try_from(d).ok())
                };
                PoolMeta {
                    pool: PoolId::new(r.get::<String, _>("pool")),
                    token0: TokenMeta::new(
                        Denom::new(r.get::<String, _>("token0")),
                        decimals("token0_decimals"),
                    ),
                    token1: TokenMeta::new(
                        Denom::new(r.get::<String, _>("token1")),
                        decimals("token1_decimals"),
                    ),
                    share_token: Denom::new(r.get::<String, _>("share_token")),
                    created_at: EventPosition::new(
                        BlockHeight::new(r.get("created_height")),
                        u32::try_from(r.get::<i64, _>("created_tx_index")).unwrap_or(0),
                        u32::try_from(r.get::<i64, _>("created_event_index")).unwrap_or(0),
                    ),
                }
            })
            .collect())
    }
}

async fn upsert_quarantine_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    chain: &str,
    key: &EventKey,
    pool: Option<&PoolId>,
    reason: &str,
    payload: &str,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO quarantine (
            chain_id, height, tx_index, event_index, pool, reason, payload, first_seen_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chain_id, height, tx_index, event_index) DO UPDATE SET
            reason = excluded.reason
        "#,
    )
    .bind(chain)
    .bind(key.height.as_i64())
    .bind(i64::from(key.tx_index))
    .bind(i64::from(key.event_index))
    .bind(pool.map(|p| p.as_str()))
    .bind(reason)
    .bind(payload)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_yield_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    chain: &str,
    row: &YieldSnapshot,
) -> Result<(), sqlx::Error> {
    let json = serde_json::to_string(row)
        .map_err(|e| sqlx::Error::Protocol(format!("yield row: {}", e)))?;
    sqlx::query(
        r#"
        INSERT INTO yield_snapshots (
            chain_id, pool, height, timestamp, liquidity_usd, cumulative_usd, row_json
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chain_id, pool, height) DO UPDATE SET
            timestamp = excluded.timestamp,
            liquidity_usd = excluded.liquidity_usd,
            cumulative_usd = excluded.cumulative_usd,
            row_json = excluded.row_json
        "#,
    )
    .bind(chain)
    .bind(row.pool.as_str())
    .bind(row.height.as_i64())
    .bind(row.timestamp.as_i64())
    .bind(row.liquidity_usd.usd().map(|d| d.to_canonical_string()))
    .bind(row.cumulative_usd.usd().map(|d| d.to_canonical_string()))
    .bind(json)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::init_db;
    use crate::domain::{Decimal, EventKind, StakeChange};
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

    fn orphan_stake(height: i64) -> LedgerEvent {
        LedgerEvent::new(
            EventKey::new(ChainId::new("phoenix-1"), BlockHeight::new(height), 0, 0),
            UnixSecs::new(1_700_000_000 + height),
            EventKind::Stake(StakeChange {
                pool: PoolId::new("pool-x"),
                owner: crate::domain::Address::new("terra1owner"),
                share_amount: Decimal::from_i64(5),
            }),
        )
    }

    fn meta() -> PoolMeta {
        PoolMeta {
            pool: PoolId::new("pool-a"),
            token0: TokenMeta::new(Denom::new("uluna"), Some(6)),
            token1: TokenMeta::new(Denom::new("uusd"), None),
            share_token: Denom::new("lp-a"),
            created_at: EventPosition::new(BlockHeight::new(100), 2, 1),
        }
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip_and_registry_mirror() {
        let (repo, _temp) = setup_repo().await;
        assert!(repo.load_checkpoint().await.unwrap().is_none());

        let mut checkpoint = RefreshCheckpoint::new(ChainId::new("phoenix-1"));
        let run_id = Uuid::new_v4();
        checkpoint.advance(
            BlockHeight::new(120),
            Some(UnixSecs::new(1_700_000_120)),
            7,
            "digest".to_string(),
            run_id,
        );
        let registered = vec![meta()];
        repo.commit_batch(&BatchCommit {
            checkpoint: &checkpoint,
            state_json: "{}",
            registered: &registered,
            quarantined: &[],
            rejected: &[],
            released: &[],
            yields: Vec::new(),
        })
        .await
        .unwrap();

        let stored = repo.load_checkpoint().await.unwrap().unwrap();
        assert_eq!(stored.checkpoint, checkpoint);
        assert_eq!(stored.state_json, "{}");
        assert_eq!(repo.registered_pools().await.unwrap(), registered);
    }

    #[tokio::test]
    async fn test_quarantine_insert_and_release() {
        let (repo, _temp) = setup_repo().await;
        let checkpoint = RefreshCheckpoint::new(ChainId::new("phoenix-1"));
        let event = orphan_stake(105);

        let quarantined = vec![(event.clone(), "pool not registered".to_string())];
        repo.commit_batch(&BatchCommit {
            checkpoint: &checkpoint,
            state_json: "{}",
            registered: &[],
            quarantined: &quarantined,
            rejected: &[],
            released: &[],
            yields: Vec::new(),
        })
        .await
        .unwrap();

        let listed = repo.list_quarantine().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].event.as_ref(), Some(&event));
        assert_eq!(listed[0].key, event.key);
        assert_eq!(listed[0].reason, "pool not registered");

        let released = vec![event.key.clone()];
        repo.commit_batch(&BatchCommit {
            checkpoint: &checkpoint,
            state_json: "{}",
            registered: &[],
            quarantined: &[],
            rejected: &[],
            released: &released,
            yields: Vec::new(),
        })
        .await
        .unwrap();
        assert!(repo.list_quarantine().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_row_is_listed_with_raw_payload() {
        let (repo, _temp) = setup_repo().await;
        let checkpoint = RefreshCheckpoint::new(ChainId::new("phoenix-1"));
        let rejected = vec![RejectedEvent {
            key: EventKey::new(ChainId::new("phoenix-1"), BlockHeight::new(90), 3, 1),
            pool: Some(PoolId::new("pool-a")),
            payload: "{\"kind\":".to_string(),
            reason: "stored event: EOF while parsing".to_string(),
        }];
        repo.commit_batch(&BatchCommit {
            checkpoint: &checkpoint,
            state_json: "{}",
            registered: &[],
            quarantined: &[],
            rejected: &rejected,
            released: &[],
            yields: Vec::new(),
        })
        .await
        .unwrap();

        let listed = repo.list_quarantine().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, rejected[0].key);
        assert_eq!(listed[0].pool, Some(PoolId::new("pool-a")));
        assert!(listed[0].event.is_none());
        assert_eq!(listed[0].payload, "{\"kind\":");
    }

    #[tokio::test]
    async fn test_clear_derived_keeps_other_chains() {
        let (repo, _temp) = setup_repo().await;
        let other = Repository::new(repo.pool().clone(), ChainId::new("columbus-5"));

        for r in [&repo, &other] {
            let checkpoint = RefreshCheckpoint::new(r.chain_id().clone());
            r.commit_batch(&BatchCommit {
                checkpoint: &checkpoint,
                state_json: "{}",
                registered: &[],
                quarantined: &[],
                rejected: &[],
                released: &[],
                yields: Vec::new(),
            })
            .await
            .unwrap();
        }

        repo.clear_derived().await.unwrap();
        assert!(repo.load_checkpoint().await.unwrap().is_none());
        assert!(other.load_checkpoint().await.unwrap().is_some());
    }
}
