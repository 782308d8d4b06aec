//! Price observation operations for the repository.

use crate::datasource::{EventSourceError, PriceSource};
use crate::domain::{Decimal, Denom, PriceObservation, UnixSecs};
use async_trait::async_trait;
use sqlx::Row;
use std::str::FromStr;
use tracing::warn;

use super::Repository;

impl Repository {
    /// Insert price observations in a single transaction, ignoring exact duplicates.
    ///
    /// Returns the number of newly inserted observations.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn insert_prices_batch(
        &self,
        prices: &[PriceObservation],
    ) -> Result<usize, sqlx::Error> {
        if prices.is_empty() {
            return Ok(0);
        }

        let created_at = UnixSecs::now().as_i64();
        let mut total_inserted = 0usize;
        let mut tx = self.pool.begin().await?;

        for price in prices {
            let result = sqlx::query(
                r#"
                INSERT INTO price_observations (token, observed_at, price, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(token, observed_at, price) DO NOTHING
                "#,
            )
            .bind(price.token.as_str())
            .bind(price.observed_at.as_i64())
            .bind(price.price.to_canonical_string())
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

    /// Observations with `from <= observed_at <= to`, ordered by time then token.
    ///
    /// Rows whose price does not parse are logged and skipped.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_prices_between(
        &self,
        from: UnixSecs,
        to: UnixSecs,
    ) -> Result<Vec<PriceObservation>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT token, observed_at, price
            FROM price_observations
            WHERE observed_at >= ? AND observed_at <= ?
            ORDER BY observed_at ASC, token ASC, price ASC
            "#,
        )
        .bind(from.as_i64())
        .bind(to.as_i64())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let token: String = row.get("token");
            let price_str: String = row.get("price");
            match Decimal::from_str(&price_str) {
                Ok(price) => out.push(PriceObservation::new(
                    Denom::new(token),
                    price,
                    UnixSecs::new(row.get("observed_at")),
                )),
                Err(e) => {
                    warn!(token = %token, price = %price_str, error = %e, "Failed to parse price decimal, skipping");
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl PriceSource for Repository {
    async fn prices_between(
        &self,
        from: UnixSecs,
        to: UnixSecs,
    ) -> Result<Vec<PriceObservation>, EventSourceError> {
        Ok(self.query_prices_between(from, to).await?)
    }
}
