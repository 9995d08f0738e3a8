//! Typed failure conditions surfaced to callers of the auth engine

use std::fmt;
use std::time::Duration;

use axum::{
    extract::rejection::JsonRejection,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::auth::store::StoreError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Stable condition kind exposed to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Conflict,
    Unauthenticated,
    Forbidden,
    NotFound,
    RateLimited,
    Locked,
    Internal,
    InvalidRequest,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Locked => "locked",
            ErrorKind::Internal => "internal",
            ErrorKind::InvalidRequest => "invalid_request",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Too many requests")]
    RateLimited { retry_after: Duration },
    #[error("Too many failed login attempts")]
    Locked { retry_after: Duration },
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Conflict(_) => ErrorKind::Conflict,
            ApiError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            ApiError::Forbidden(_) => ErrorKind::Forbidden,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::RateLimited { .. } => ErrorKind::RateLimited,
            ApiError::Locked { .. } => ErrorKind::Locked,
            ApiError::Internal(_) => ErrorKind::Internal,
            ApiError::BadRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::RateLimited | ErrorKind::Locked => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        }
    }

    /// Message safe to show to a client. Internal detail is never included.
    pub fn client_message(&self) -> String {
        match self {
            ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after } | ApiError::Locked { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    pub fn invalid_token() -> Self {
        ApiError::Unauthenticated("Invalid or expired token".to_string())
    }

    pub fn invalid_refresh_token() -> Self {
        ApiError::Unauthenticated("Invalid refresh token".to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate => ApiError::Conflict("Resource already exists".to_string()),
            StoreError::Database(e) => ApiError::Internal(format!("database: {e}")),
            StoreError::Corrupt(detail) => ApiError::Internal(format!("corrupt record: {detail}")),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal(format!("database: {err}"))
    }
}

/// Round up so a client never retries a moment too early
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            tracing::error!(error = %detail, "Internal error while handling request");
        }

        let status = self.status();
        let kind = self.kind();
        let retry_after = self.retry_after().map(retry_after_secs);

        let mut body = json!({
            "success": false,
            "error": kind.as_str(),
            "message": self.client_message(),
        });
        if let Some(secs) = retry_after {
            body["retry_after_seconds"] = json!(secs);
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_map_to_stable_strings() {
        assert_eq!(ApiError::invalid_token().kind().as_str(), "unauthenticated");
        assert_eq!(ApiError::Conflict("x".into()).kind().as_str(), "conflict");
        assert_eq!(
            ApiError::Locked {
                retry_after: Duration::from_secs(3)
            }
            .kind()
            .as_str(),
            "locked"
        );
    }

    #[test]
    fn test_internal_detail_is_hidden() {
        let err = ApiError::Internal("connection refused to 10.0.0.3:5432".to_string());
        assert_eq!(err.client_message(), "Internal server error");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_locked_response_carries_retry_after() {
        let response = ApiError::Locked {
            retry_after: Duration::from_millis(2500),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("3")
        );
    }
}
