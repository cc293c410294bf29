use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hospital_common::http::UpstreamError;
use hospital_common::site_api::ErrorBody;
use tracing::error;

/// Startup and wiring failures.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),
}

/// Errors surfaced to HTTP callers.
///
/// Client mistakes carry their message to the caller. `Internal` keeps its detail in
/// the server log and answers with a generic message.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<UpstreamError> for ApiError {
    fn from(e: UpstreamError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, retry_after) = match &self {
            ApiError::Internal(detail) => {
                error!(error = %detail, "request failed");
                ("Internal server error".to_string(), None)
            }
            ApiError::Unauthorized => ("Unauthorized".to_string(), None),
            ApiError::RateLimited { retry_after_secs } => (
                "Too many requests. Please try again later.".to_string(),
                Some(*retry_after_secs),
            ),
            other => (other.to_string(), None),
        };

        let mut response = (
            status,
            Json(ErrorBody {
                error: message,
                retry_after,
            }),
        )
            .into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
