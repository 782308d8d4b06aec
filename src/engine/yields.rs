//! Per-block yield rows and their daily roll-up.
//!
//! One row per distinct height touching the pool. Row `i` covers the interval
//! `(h_i, h_{i+1}]`; the last row stays open and closes at the refresh high-water mark.
//! The first row also includes events at the creation height itself.

use super::projection::{PoolProjection, Valuer};
use crate::domain::{
    BlockHeight, Decimal, Denom, PoolId, TokenRole, UnixSecs, Valuation,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveValue {
    pub token: Denom,
    pub amount: Decimal,
    pub value: Valuation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YieldSnapshot {
    pub pool: PoolId,
    pub height: BlockHeight,
    pub timestamp: UnixSecs,
    /// Height closing this row's accrual interval.
    pub interval_end: BlockHeight,
    pub interval_end_time: UnixSecs,
    pub reserve0: ReserveValue,
    pub reserve1: ReserveValue,
    pub liquidity_usd: Valuation,
    /// Commission by token, base units.
    pub fees: BTreeMap<Denom, Decimal>,
    pub fees_usd: Valuation,
    /// Incentive emissions by reward token, base units.
    pub incentives: BTreeMap<Denom, Decimal>,
    pub incentives_usd: Valuation,
    pub cumulative: BTreeMap<Denom, Decimal>,
    pub cumulative_usd: Valuation,
}

/// Upper bound of the open interval: the refresh high-water mark and its block time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalClose {
    pub height: BlockHeight,
    pub time: UnixSecs,
}

/// Build every yield row for a pool.
pub fn compute_yields(
    projection: &PoolProjection,
    valuer: Valuer<'_>,
    close: IntervalClose,
) -> Vec<YieldSnapshot> {
    let heights = projection.event_heights();
    let mut rows: Vec<YieldSnapshot> = Vec::with_capacity(heights.len());
    for i in 0..heights.len() {
        let row = build_row(
            projection,
            valuer,
            &heights,
            i,
            close,
            rows.last().map(|r| (&r.cumulative, &r.cumulative_usd)),
        );
        rows.push(row);
    }
    rows
}

/// Recompute only the open last row against a new high-water mark.
///
/// Valid when the projection has not changed since `rows` was built.
pub fn reclose_last(
    rows: &mut Vec<YieldSnapshot>,
    projection: &PoolProjection,
    valuer: Valuer<'_>,
    close: IntervalClose,
) {
    let heights = projection.event_heights();
    if rows.len() != heights.len() || heights.is_empty() {
        *rows = compute_yields(projection, valuer, close);
        return;
    }
    let last = heights.len() - 1;
    let prev = if last == 0 {
        None
    } else {
        rows.get(last - 1)
            .map(|r| (r.cumulative.clone(), r.cumulative_usd.clone()))
    };
    let row = build_row(
        projection,
        valuer,
        &heights,
        last,
        close,
        prev.as_ref().map(|(c, u)| (c, u)),
    );
    rows[last] = row;
}

fn build_row(
    projection: &PoolProjection,
    valuer: Valuer<'_>,
    heights: &[BlockHeight],
    index: usize,
    close: IntervalClose,
    prev: Option<(&BTreeMap<Denom, Decimal>, &Valuation)>,
) -> YieldSnapshot {
    let meta = projection.meta();
    let clock = projection.clock();
    let height = heights[index];
    let timestamp = clock.time_at(height).unwrap_or_default();

    let (interval_end, interval_end_time) = match heights.get(index + 1) {
        Some(next) => (*next, clock.time_at(*next).unwrap_or(timestamp)),
        None if close.height > height => (close.height, close.time.max(timestamp)),
        None => (height, timestamp),
    };

    let reserve = |role: TokenRole| {
        let token = meta.token(role);
        let amount = projection.balances().balance_at(role, height);
        ReserveValue {
            token: token.denom.clone(),
            amount,
            value: valuer.value(token, amount, Some(timestamp)),
        }
    };
    let reserve0 = reserve(TokenRole::Token0);
    let reserve1 = reserve(TokenRole::Token1);
    let liquidity_usd = reserve0.value.add(&reserve1.value);

    // Fees: commission of swaps inside the interval, valued at each swap's block.
    let first = index == 0;
    let mut fees: BTreeMap<Denom, Decimal> = BTreeMap::new();
    let mut fees_usd = Valuation::zero();
    for fee in projection.fees().iter().filter(|f| {
        let h = f.position.height;
        (h > height || (first && h == height)) && h <= interval_end
    }) {
        let entry = fees.entry(fee.token.clone()).or_default();
        *entry = entry.saturating_add(fee.amount);
        let at = clock.time_at(fee.position.height);
        fees_usd = fees_usd.add(&valuer.value(&meta.meta_for(&fee.token), fee.amount, at));
    }

    // Incentives: schedules announced by the interval end, overlapping its time span,
    // valued at the last known price at the interval end.
    let mut incentives: BTreeMap<Denom, Decimal> = BTreeMap::new();
    for record in projection
        .schedules()
        .iter()
        .filter(|r| r.position.height <= interval_end)
    {
        let schedule = &record.schedule;
        let overlap = schedule.overlap_secs(timestamp, interval_end_time);
        if overlap == 0 {
            continue;
        }
        let Some(amount) = schedule
            .rate_per_second
            .checked_mul(Decimal::from_i64(overlap))
        else {
            continue;
        };
        let entry = incentives.entry(schedule.reward_token.clone()).or_default();
        *entry = entry.saturating_add(amount);
    }
    let incentives_usd: Valuation = incentives
        .iter()
        .map(|(token, amount)| {
            valuer.value(&meta.meta_for(token), *amount, Some(interval_end_time))
        })
        .sum();

    let (mut cumulative, prev_usd) = match prev {
        Some((c, u)) => (c.clone(), u.clone()),
        None => (BTreeMap::new(), Valuation::zero()),
    };
    for (token, amount) in fees.iter().chain(incentives.iter()) {
        let entry = cumulative.entry(token.clone()).or_default();
        *entry = entry.saturating_add(*amount);
    }
    let cumulative_usd = prev_usd.add(&fees_usd).add(&incentives_usd);

    YieldSnapshot {
        pool: meta.pool.clone(),
        height,
        timestamp,
        interval_end,
        interval_end_time,
        reserve0,
        reserve1,
        liquidity_usd,
        fees,
        fees_usd,
        incentives,
        incentives_usd,
        cumulative,
        cumulative_usd,
    }
}

/// Yield rows rolled up per UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyYield {
    pub pool: PoolId,
    pub day: NaiveDate,
    pub first_height: BlockHeight,
    pub last_height: BlockHeight,
    pub rows: usize,
    pub fees_usd: Valuation,
    pub incentives_usd: Valuation,
    pub avg_liquidity_usd: Valuation,
    /// `(fees + incentives) / avg_liquidity * 365`; absent when any input is unknown or
    /// liquidity is zero.
    pub apr: Option<Decimal>,
}

pub fn daily_yields(rows: &[YieldSnapshot]) -> Vec<DailyYield> {
    let mut days: BTreeMap<NaiveDate, Vec<&YieldSnapshot>> = BTreeMap::new();
    for row in rows {
        if let Some(day) = DateTime::<Utc>::from_timestamp(row.timestamp.as_i64(), 0) {
            days.entry(day.date_naive()).or_default().push(row);
        }
    }

    days.into_iter()
        .filter_map(|(day, rows)| {
            let first = rows.first()?;
            let last = rows.last()?;
            let fees_usd: Valuation = rows.iter().map(|r| r.fees_usd.clone()).sum();
            let incentives_usd: Valuation = rows.iter().map(|r| r.incentives_usd.clone()).sum();
            let liquidity_sum: Valuation = rows.iter().map(|r| r.liquidity_usd.clone()).sum();
            let avg_liquidity_usd = match liquidity_sum {
                Valuation::Known(sum) => sum
                    .checked_div(Decimal::from_i64(rows.len() as i64))
                    .map(Valuation::Known)
                    .unwrap_or_else(Valuation::zero),
                unknown => unknown,
            };
            let apr = match (fees_usd.add(&incentives_usd), &avg_liquidity_usd) {
                (Valuation::Known(earned), Valuation::Known(avg)) => earned
                    .checked_div(*avg)
                    .and_then(|r| r.checked_mul(Decimal::days_per_year())),
                _ => None,
            };
            Some(DailyYield {
                pool: first.pool.clone(),
                day,
                first_height: first.height,
                last_height: last.height,
                rows: rows.len(),
                fees_usd,
                incentives_usd,
                avg_liquidity_usd,
                apr,
            })
        })
        .collect()
}
