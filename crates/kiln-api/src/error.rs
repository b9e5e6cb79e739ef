//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<kiln_core::Error> for ApiError {
    fn from(err: kiln_core::Error) -> Self {
        use kiln_core::Error;
        let message = err.to_string();
        match err {
            Error::InvalidInput(_) => ApiError::BadRequest(message),
            Error::NotFound(_) => ApiError::NotFound(message),
            Error::AlreadyExists(_) | Error::Conflict(_) => ApiError::Conflict(message),
            Error::Transient(_) => ApiError::Unavailable(message),
            Error::Internal(_) => ApiError::Internal(message),
        }
    }
}

impl From<kiln_db::DbError> for ApiError {
    fn from(err: kiln_db::DbError) -> Self {
        kiln_core::Error::from(err).into()
    }
}
