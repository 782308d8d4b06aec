use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::api::{parse_height, parse_pool, AppState};
use crate::domain::{Decimal, Valuation};
use crate::engine::{DailyYield, YieldSnapshot};
use crate::error::AppError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Block,
    Daily,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    Csv,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YieldQuery {
    pub from_height: Option<i64>,
    pub to_height: Option<i64>,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default)]
    pub format: Format,
}

pub async fn get_pool_yield(
    Path(pool): Path<String>,
    Query(params): Query<YieldQuery>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let pool = parse_pool(&pool)?;
    let from = parse_height("fromHeight", params.from_height)?;
    let to = parse_height("toHeight", params.to_height)?;

    let response = match params.granularity {
        Granularity::Block => {
            let answer = state.query.pool_yield(&pool, from, to)?;
            match params.format {
                Format::Json => Json(answer).into_response(),
                Format::Csv => csv_response(block_csv(&answer.value)?),
            }
        }
        Granularity::Daily => {
            let answer = state.query.pool_daily_yield(&pool, from, to)?;
            match params.format {
                Format::Json => Json(answer).into_response(),
                Format::Csv => csv_response(daily_csv(&answer.value)?),
            }
        }
    };
    Ok(response)
}

fn csv_response(body: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], body).into_response()
}

/// Unknown USD values export as empty cells.
fn usd_cell(value: &Valuation) -> String {
    value
        .usd()
        .map(|usd| usd.to_canonical_string())
        .unwrap_or_default()
}

fn block_csv(rows: &[YieldSnapshot]) -> Result<Vec<u8>, AppError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "pool",
            "height",
            "timestamp",
            "intervalEnd",
            "intervalEndTime",
            "reserve0Token",
            "reserve0Amount",
            "reserve0Usd",
            "reserve1Token",
            "reserve1Amount",
            "reserve1Usd",
            "liquidityUsd",
            "feesUsd",
            "incentivesUsd",
            "cumulativeUsd",
        ])
        .map_err(csv_error)?;

    for row in rows {
        writer
            .write_record([
                row.pool.to_string(),
                row.height.to_string(),
                row.timestamp.as_i64().to_string(),
                row.interval_end.to_string(),
                row.interval_end_time.as_i64().to_string(),
                row.reserve0.token.to_string(),
                row.reserve0.amount.to_canonical_string(),
                usd_cell(&row.reserve0.value),
                row.reserve1.token.to_string(),
                row.reserve1.amount.to_canonical_string(),
                usd_cell(&row.reserve1.value),
                usd_cell(&row.liquidity_usd),
                usd_cell(&row.fees_usd),
                usd_cell(&row.incentives_usd),
                usd_cell(&row.cumulative_usd),
            ])
            .map_err(csv_error)?;
    }

    writer
        .into_inner()
        .map_err(|e| AppError::Internal(e.to_string()))
}

fn daily_csv(days: &[DailyYield]) -> Result<Vec<u8>, AppError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "pool",
            "day",
            "firstHeight",
            "lastHeight",
            "rows",
            "feesUsd",
            "incentivesUsd",
            "avgLiquidityUsd",
            "apr",
        ])
        .map_err(csv_error)?;

    for day in days {
        writer
            .write_record([
                day.pool.to_string(),
                day.day.to_string(),
                day.first_height.to_string(),
                day.last_height.to_string(),
                day.rows.to_string(),
                usd_cell(&day.fees_usd),
                usd_cell(&day.incentives_usd),
                usd_cell(&day.avg_liquidity_usd),
                day.apr
                    .as_ref()
                    .map(Decimal::to_canonical_string)
                    .unwrap_or_default(),
            ])
            .map_err(csv_error)?;
    }

    writer
        .into_inner()
        .map_err(|e| AppError::Internal(e.to_string()))
}

fn csv_error(err: csv::Error) -> AppError {
    AppError::Internal(err.to_string())
}
