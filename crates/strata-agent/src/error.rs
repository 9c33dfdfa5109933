//! Error type for the management API

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use strata_common::agent::ErrorBody;

use crate::backup::BackupError;
use crate::sql::SqlError;

/// Error returned by management API handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request is malformed or names something unacceptable
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// The request conflicts with work in progress
    #[error("{0}")]
    Conflict(String),

    /// The addressed record does not exist
    #[error("{0}")]
    NotFound(String),

    /// The database rejected or failed the statement
    #[error("{0}")]
    Database(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Database(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<SqlError> for ApiError {
    fn from(e: SqlError) -> Self {
        match e {
            e if e.is_invalid_input() => ApiError::BadRequest(e.to_string()),
            SqlError::Failed { .. } => ApiError::Database(e.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<BackupError> for ApiError {
    fn from(e: BackupError) -> Self {
        match e {
            BackupError::Conflict(_) => ApiError::Conflict(e.to_string()),
            BackupError::NotFound(_) => ApiError::NotFound(e.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn conflicts_map_to_409() {
        let response = ApiError::from(BackupError::Conflict(Uuid::nil())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn invalid_identifiers_are_client_errors() {
        let err = ApiError::from(SqlError::InvalidIdentifier("1x".to_string()));
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn psql_failures_are_database_errors() {
        let err = ApiError::from(SqlError::Failed {
            code: Some(3),
            stderr: "permission denied".to_string(),
        });
        assert_eq!(err.to_string(), "psql failed (Some(3)): permission denied");
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
