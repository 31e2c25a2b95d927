use crate::domain::DomainError;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::{header, HeaderValue, StatusCode};
use serde_json::json;
use tracing::{debug, error, warn};

/// Convert a domain error to an HTTP response.
///
/// Authentication failures share one body so callers cannot tell which check
/// failed; the reason is logged. Internal errors return a generic body.
pub fn domain_error_to_response(error: DomainError) -> Response {
    match error {
        DomainError::Unauthorized(reason) => {
            warn!(reason = %reason, "request unauthorized");
            unauthorized()
        }

        DomainError::InvalidToken(msg) => {
            debug!(error = %msg, "invalid caller token");
            unauthorized()
        }

        DomainError::RateLimited { retry_after_secs } => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "rate_limited", "retry_after": retry_after_secs })),
            )
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }

        DomainError::OriginNotAllowed(origin) => {
            warn!(origin = %origin, "origin not allowed");
            (StatusCode::FORBIDDEN, Json(json!({ "error": "origin_not_allowed" }))).into_response()
        }

        DomainError::PayloadTooLarge { limit, actual } => (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({ "error": "payload_too_large", "limit": limit, "actual": actual })),
        )
            .into_response(),

        DomainError::DeviceNotFound(_) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": "not_found" }))).into_response()
        }

        DomainError::PermissionDenied(msg) => {
            debug!(reason = %msg, "permission denied");
            (StatusCode::FORBIDDEN, Json(json!({ "error": "forbidden" }))).into_response()
        }

        DomainError::ValidationError(detail) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_request", "detail": detail })),
        )
            .into_response(),

        DomainError::BackupDestinationMissing | DomainError::ArchiveError(_) => {
            error!(error = %error, "unexpected job error in request path");
            internal_error()
        }

        DomainError::RepositoryError(err) => {
            error!(error = ?err, "request failed with repository error");
            internal_error()
        }
    }
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal_error" })),
    )
        .into_response()
}

/// Handler error wrapper so axum handlers can use `?` on `DomainResult`
#[derive(Debug)]
pub struct ApiError(pub DomainError);

impl From<DomainError> for ApiError {
    fn from(error: DomainError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        domain_error_to_response(self.0)
    }
}

/// HTTP status a domain error maps to, for metrics and logs
pub fn domain_error_status(error: &DomainError) -> StatusCode {
    match error {
        DomainError::Unauthorized(_) | DomainError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
        DomainError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        DomainError::OriginNotAllowed(_) | DomainError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        DomainError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        DomainError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
        DomainError::ValidationError(_) => StatusCode::BAD_REQUEST,
        DomainError::BackupDestinationMissing
        | DomainError::ArchiveError(_)
        | DomainError::RepositoryError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
