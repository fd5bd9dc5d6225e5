//! API error handling, grounded on `buildit-api/src/error.rs`'s flat
//! `ApiError` + `IntoResponse` + `From<cinch_core::Error>` shape.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<cinch_core::Error> for ApiError {
    fn from(err: cinch_core::Error) -> Self {
        use cinch_core::Error::*;
        match err {
            NotFound(msg) => ApiError::NotFound(msg),
            InvalidInput(msg) => ApiError::BadRequest(msg),
            Unauthorized(msg) => ApiError::Unauthorized(msg),
            Forbidden(msg) => ApiError::Forbidden(msg),
            Conflict(msg) => ApiError::Conflict(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<cinch_core::event::NormalizeError> for ApiError {
    fn from(err: cinch_core::event::NormalizeError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}
