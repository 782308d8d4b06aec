pub mod health;
pub mod pools;
pub mod shares;
pub mod yields;

use crate::domain::{BlockHeight, PoolId};
use crate::error::AppError;
use crate::query::QuerySurface;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Debug, Clone)]
pub struct AppState {
    pub query: Arc<QuerySurface>,
}

impl AppState {
    pub fn new(query: QuerySurface) -> Self {
        Self {
            query: Arc::new(query),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/pools", get(pools::list_pools))
        .route("/v1/pools/:pool/balance", get(pools::get_pool_balance))
        .route("/v1/pools/:pool/shares", get(shares::get_owner_shares))
        .route("/v1/pools/:pool/yield", get(yields::get_pool_yield))
        .layer(cors)
        .with_state(state)
}

fn parse_pool(input: &str) -> Result<PoolId, AppError> {
    input
        .trim()
        .parse::<PoolId>()
        .map_err(|_| AppError::BadRequest("Invalid pool id".to_string()))
}

fn parse_height(name: &str, raw: Option<i64>) -> Result<Option<BlockHeight>, AppError> {
    match raw {
        Some(h) if h < 0 => Err(AppError::BadRequest(format!("{} must be >= 0", name))),
        Some(h) => Ok(Some(BlockHeight::new(h))),
        None => Ok(None),
    }
}
