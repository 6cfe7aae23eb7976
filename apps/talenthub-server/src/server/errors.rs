use axum::{http::StatusCode, response::IntoResponse, Json};
use talenthub_protocol::ApiEnvelope;

use super::metrics::record_auth_failure;

/// Failure of a request, rendered as `{ success: false, message }`.
///
/// Variants carrying a message name the violated rule for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ApiFailure {
    InvalidRequest(&'static str),
    Unauthorized,
    Forbidden(&'static str),
    NotFound(&'static str),
    Conflict(&'static str),
    PayloadTooLarge,
    Internal,
}

impl ApiFailure {
    pub(crate) const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) const fn message(&self) -> &'static str {
        match self {
            Self::InvalidRequest(message)
            | Self::Forbidden(message)
            | Self::NotFound(message)
            | Self::Conflict(message) => message,
            Self::Unauthorized => "Not authenticated",
            Self::PayloadTooLarge => "Payload too large",
            Self::Internal => "Internal server error",
        }
    }
}

impl std::fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status().as_u16(), self.message())
    }
}

impl From<sqlx::Error> for ApiFailure {
    fn from(error: sqlx::Error) -> Self {
        tracing::error!(event = "db.query", error = %error);
        Self::Internal
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::Unauthorized => record_auth_failure("unauthorized"),
            Self::Forbidden(_) => record_auth_failure("forbidden"),
            Self::InvalidRequest(_)
            | Self::NotFound(_)
            | Self::Conflict(_)
            | Self::PayloadTooLarge
            | Self::Internal => {}
        }

        (self.status(), Json(ApiEnvelope::failure(self.message()))).into_response()
    }
}

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .with_span_list(true)
        .init();
}
