use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::store::StoreError;

/// Error surface shared by the orchestrator and the HTTP layer. Validation
/// and state errors never mutate state; execution failures still leave a
/// receipt and an audit event behind before surfacing here.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Authentication(String),
    #[error("{0}")]
    Authorization(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    State(String),
    #[error("{0}")]
    Integrity(String),
    #[error("{0}")]
    RateLimit(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn authentication(msg: impl Into<String>) -> Self {
        ApiError::Authentication(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        ApiError::Authorization(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ApiError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError::Conflict(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        ApiError::State(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        ApiError::Integrity(msg.into())
    }

    pub fn rate_limit(msg: impl Into<String>) -> Self {
        ApiError::RateLimit(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError::Internal(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Authentication(_) => "AUTHENTICATION",
            ApiError::Authorization(_) => "AUTHORIZATION",
            ApiError::Validation(_) => "VALIDATION",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::State(_) => "STATE",
            ApiError::Integrity(_) => "INTEGRITY",
            ApiError::RateLimit(_) => "RATE_LIMIT",
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ApiError::Authorization(_) => StatusCode::FORBIDDEN,
            ApiError::Validation(_) | ApiError::State(_) | ApiError::Integrity(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateName { name } => {
                ApiError::Conflict(format!("name already exists: {name}"))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<CryptoError> for ApiError {
    fn from(err: CryptoError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_status() {
        assert_eq!(
            ApiError::authentication("x").status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::authorization("x").status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::validation("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::conflict("x").status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::state("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::integrity("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::rate_limit("x").status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::internal("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ApiError::integrity("plan hash mismatch").code(), "INTEGRITY");
        assert_eq!(ApiError::state("not approved").code(), "STATE");
    }
}
