use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("no access to {0}")]
    FeatureNotAllowed(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("rate limit exceeded: {used} of {limit} requests used, retry after {retry_after_seconds}s")]
    RateLimited {
        limit: u64,
        used: u64,
        retry_after_seconds: u64,
    },

    // 不向调用方暴露拦截原因
    #[error("request blocked - if you think this is a mistake, please contact {contact} and reference this ID: {trace_id}")]
    Blocked { trace_id: String, contact: String },

    #[error("upstream provider unavailable, retry after {retry_after_seconds}s")]
    UpstreamUnavailable { retry_after_seconds: u64 },

    #[error("upstream provider returned status {0}")]
    UpstreamStatus(StatusCode),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) | GatewayError::Json(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::FeatureNotAllowed(_) | GatewayError::Blocked { .. } => {
                StatusCode::FORBIDDEN
            }
            GatewayError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamStatus(status) => *status,
            GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Db(_)
            | GatewayError::Io(_)
            | GatewayError::Config(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited {
                retry_after_seconds,
                ..
            }
            | GatewayError::UpstreamUnavailable {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// Message serialised to the caller. Server-side failures never leak their cause.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Http(_) => "upstream request failed".to_string(),
            GatewayError::UpstreamStatus(_) => "upstream provider error".to_string(),
            GatewayError::Db(_)
            | GatewayError::Io(_)
            | GatewayError::Config(_)
            | GatewayError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        }
        let body = Json(serde_json::json!({ "error": self.client_message() }));
        let mut response = (status, body).into_response();
        if let Some(secs) = self.retry_after_seconds()
            && let Ok(value) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
