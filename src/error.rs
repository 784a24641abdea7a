use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Upstream failure classes that feed credential cooling. Everything else
/// (bad request, unknown model, safety block) is terminal and never cools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    AuthRejected,
    QuotaExceeded,
    TransientUpstream,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::AuthRejected => "auth_rejected",
            FailureKind::QuotaExceeded => "quota_exceeded",
            FailureKind::TransientUpstream => "transient_upstream",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),

    #[error("model \"{0}\" was not found")]
    ModelNotFound(String),

    #[error("{0} was not found")]
    NotFound(String),

    /// Upstream rejected the request with a terminal status; passed through.
    #[error("upstream rejected request: {message}")]
    UpstreamRejected { status: u16, message: String },

    /// Every credential is cooling or disabled.
    #[error("no healthy upstream credential available")]
    NoHealthyCredential { retry_after_s: Option<u64> },

    /// Every allowed attempt failed; carries the last classified cause.
    #[error("all upstream attempts failed: {message}")]
    AllCredentialsExhausted { kind: FailureKind, message: String },

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for GatewayError {
    fn from(e: anyhow::Error) -> Self {
        GatewayError::Internal(e.to_string())
    }
}

impl GatewayError {
    fn status_type_code(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            GatewayError::Validation(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", "bad_request")
            }
            GatewayError::ModelNotFound(_) => {
                (StatusCode::NOT_FOUND, "invalid_request_error", "model_not_found")
            }
            GatewayError::NotFound(_) => {
                (StatusCode::NOT_FOUND, "invalid_request_error", "not_found")
            }
            GatewayError::UpstreamRejected { status, .. } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                "upstream_error",
                "upstream_rejected",
            ),
            GatewayError::NoHealthyCredential { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                "no_healthy_credential",
            ),
            GatewayError::AllCredentialsExhausted { .. } => (
                StatusCode::BAD_GATEWAY,
                "upstream_exhausted",
                "all_credentials_exhausted",
            ),
            GatewayError::DeadlineExceeded => {
                (StatusCode::GATEWAY_TIMEOUT, "timeout", "deadline_exceeded")
            }
            GatewayError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal_error",
            ),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_type, code) = self.status_type_code();

        let message = match &self {
            GatewayError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
            GatewayError::AllCredentialsExhausted { kind, message } => {
                tracing::warn!(kind = kind.as_str(), "all credentials exhausted: {message}");
                self.to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": { "message": message, "type": error_type, "code": code }
        }));

        let mut response = (status, body).into_response();
        if let GatewayError::NoHealthyCredential {
            retry_after_s: Some(secs),
        } = &self
        {
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
