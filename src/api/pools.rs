use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::{parse_height, parse_pool, AppState};
use crate::error::AppError;
use crate::query::{Answer, PoolBalance, PoolPage};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolsQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

pub async fn list_pools(
    Query(params): Query<PoolsQuery>,
    State(state): State<AppState>,
) -> Result<Json<Answer<PoolPage>>, AppError> {
    let page = params.page.unwrap_or(1);
    let page_size = params
        .page_size
        .unwrap_or_else(|| state.query.max_page_size().min(20));
    Ok(Json(state.query.top_level_pools(page, page_size)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceQuery {
    pub height: Option<i64>,
}

pub async fn get_pool_balance(
    Path(pool): Path<String>,
    Query(params): Query<BalanceQuery>,
    State(state): State<AppState>,
) -> Result<Json<Answer<PoolBalance>>, AppError> {
    let pool = parse_pool(&pool)?;
    let answer = match parse_height("height", params.height)? {
        Some(height) => state.query.pool_balance_as_of(&pool, height).await?,
        None => state.query.current_pool_balance(&pool).await?,
    };
    Ok(Json(answer))
}
