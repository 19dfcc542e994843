//! Typed-error-to-HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::core::AppError;
use crate::translate::TranslateError;

/// An error ready to leave the API: a status code plus a JSON `detail`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    /// 400 with a caller-facing message.
    #[must_use]
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    /// 401 with a caller-facing message.
    #[must_use]
    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            detail: detail.into(),
        }
    }

    /// 403.
    #[must_use]
    pub fn forbidden() -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            detail: "Forbidden".to_owned(),
        }
    }

    /// 404 with a caller-facing message.
    #[must_use]
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }

    /// 413 for oversized uploads.
    #[must_use]
    pub fn payload_too_large() -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            detail: "File too large".to_owned(),
        }
    }

    /// 500 with an opaque detail; the real error goes to the log.
    #[must_use]
    pub fn internal(err: &dyn std::fmt::Display) -> Self {
        tracing::error!(error = %err, "internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: "Internal Server Error".to_owned(),
        }
    }

    /// The mapped status code.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        let status = match &err {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Io(_) | AppError::Internal(_) => {
                return Self::internal(&err);
            }
        };
        Self {
            status,
            detail: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(&err)
    }
}

impl From<TranslateError> for ApiError {
    fn from(err: TranslateError) -> Self {
        let status = match err {
            TranslateError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            TranslateError::EmptyInput | TranslateError::BadInput => StatusCode::BAD_REQUEST,
            TranslateError::InvalidKey => StatusCode::UNAUTHORIZED,
            TranslateError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            TranslateError::Upstream => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            detail: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_mapping() {
        assert_eq!(
            ApiError::from(AppError::QueueFull).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::from(AppError::NotFound("job".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(AppError::UpstreamTimeout { stage: "ws_idle" }).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_translate_error_mapping() {
        assert_eq!(
            ApiError::from(TranslateError::InvalidKey).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(TranslateError::QuotaExceeded).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::from(TranslateError::NotConfigured).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_internal_errors_are_opaque() {
        let err = ApiError::from(anyhow::anyhow!("secret database path"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.detail, "Internal Server Error");
    }
}
