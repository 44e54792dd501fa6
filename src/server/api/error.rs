//! API error types.
//!
//! The API boundary never surfaces internal exceptions as 500s: failures
//! a user can act on become `{success: false, error}` tuples (see the
//! handlers), authentication failures are 401s, and infrastructure
//! outages are 503s.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use serde::Serialize;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request is not authenticated or its credential is invalid.
    #[error("{0}")]
    Unauthorized(String),

    /// A backing service is unavailable.
    #[error("service unavailable")]
    Unavailable,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}
