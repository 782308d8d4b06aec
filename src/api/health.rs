use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::AppState;
use crate::domain::{BlockHeight, UnixSecs};

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyResponse {
    pub status: &'static str,
    pub chain_id: String,
    pub high_water: Option<BlockHeight>,
    pub high_water_time: Option<UnixSecs>,
    pub pools: usize,
    pub digest: String,
}

/// Reports the published snapshot. `status` is `"warming"` until the first refresh lands.
pub async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    let snapshot = state.query.snapshot();
    Json(ReadyResponse {
        status: if snapshot.high_water.is_some() {
            "ready"
        } else {
            "warming"
        },
        chain_id: snapshot.chain_id.to_string(),
        high_water: snapshot.high_water,
        high_water_time: snapshot.high_water_time,
        pools: snapshot.pools.len(),
        digest: snapshot.digest.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{EngineSnapshot, SnapshotHandle};
    use crate::datasource::MockEventSource;
    use crate::domain::{ChainId, TokenDecimals};
    use crate::query::QuerySurface;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_health_returns_ok() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_ready_reports_warming_snapshot() {
        let snapshot = EngineSnapshot::empty(ChainId::new("phoenix-1"), TokenDecimals::default());
        let digest = snapshot.digest.clone();
        let query = QuerySurface::new(
            SnapshotHandle::new(snapshot),
            Arc::new(MockEventSource::new()),
            600,
            100,
        );
        let Json(body) = ready(State(AppState::new(query))).await;
        assert_eq!(body.status, "warming");
        assert_eq!(body.high_water, None);
        assert_eq!(body.digest, digest);
    }
}
