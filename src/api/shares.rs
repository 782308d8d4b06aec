use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::{parse_height, parse_pool, AppState};
use crate::domain::{Address, OwnerShareState};
use crate::error::AppError;
use crate::query::Answer;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharesQuery {
    pub owner: String,
    pub height: Option<i64>,
}

pub async fn get_owner_shares(
    Path(pool): Path<String>,
    Query(params): Query<SharesQuery>,
    State(state): State<AppState>,
) -> Result<Json<Answer<OwnerShareState>>, AppError> {
    let pool = parse_pool(&pool)?;
    let owner = params
        .owner
        .trim()
        .parse::<Address>()
        .map_err(|_| AppError::BadRequest("Invalid owner address".to_string()))?;

    let answer = match parse_height("height", params.height)? {
        Some(height) => state.query.owner_shares_as_of(&pool, &owner, height).await?,
        None => state.query.owner_shares(&pool, &owner).await?,
    };
    Ok(Json(answer))
}
