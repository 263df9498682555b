//! Maps [`aoc_domain::Error`] onto HTTP responses at the gateway edge.
//!
//! `aoc_domain::Error` lives in a crate with no `axum` dependency, so the
//! `IntoResponse` impl has to live here (orphan rule) rather than next to
//! the enum itself.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub struct ApiError(pub aoc_domain::Error);

impl From<aoc_domain::Error> for ApiError {
    fn from(e: aoc_domain::Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // `Invariant` indicates a bug, not a user-facing condition; log it
        // but never echo its message verbatim to the caller.
        if matches!(self.0, aoc_domain::Error::Invariant(_)) {
            tracing::error!(error = %self.0, "invariant violated");
            return (status, Json(json!({ "error": "internal error" }))).into_response();
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
