use crate::query::QueryError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Internal server error: {0}")]
    Internal(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    /// The pool exists but its ledgers violate an invariant.
    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        faults: serde_json::Value,
    },
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::UnregisteredPool(_) => AppError::NotFound(err.to_string()),
            QueryError::PoolDegraded { ref faults, .. } => AppError::Conflict {
                faults: serde_json::to_value(faults).unwrap_or_default(),
                message: err.to_string(),
            },
            QueryError::InvalidPage { .. } | QueryError::InvalidRange { .. } => {
                AppError::BadRequest(err.to_string())
            }
            QueryError::Source(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": msg })),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": msg })),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::Conflict { message, faults } => (
                StatusCode::CONFLICT,
                json!({ "error": message, "faults": faults }),
            ),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BlockHeight, PoolId};

    #[test]
    fn test_query_errors_map_to_status() {
        let cases = vec![
            (
                QueryError::UnregisteredPool(PoolId::new("p")),
                StatusCode::NOT_FOUND,
            ),
            (
                QueryError::PoolDegraded {
                    pool: PoolId::new("p"),
                    faults: Vec::new(),
                },
                StatusCode::CONFLICT,
            ),
            (
                QueryError::InvalidRange {
                    from: BlockHeight::new(2),
                    to: BlockHeight::new(1),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                QueryError::InvalidPage {
                    page: 0,
                    page_size: 10,
                    max: 100,
                },
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).into_response().status(), status);
        }
    }
}
