//! Wire shape for failed requests.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{error, warn};

/// Serialized as `{"status": N, "err": "…"}` with the matching HTTP status.
#[derive(Debug, Serialize)]
struct ErrorMessage {
    status: u16,
    err: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    err: String,
}

impl ApiError {
    pub fn new(status: StatusCode, err: impl Into<String>) -> Self {
        Self {
            status,
            err: err.into(),
        }
    }

    pub fn not_found(err: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, err)
    }

    pub fn internal(err: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err)
    }

    pub fn unavailable(err: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = self.status.as_u16(), err = %self.err, "request failed");
        } else {
            warn!(status = self.status.as_u16(), err = %self.err, "request failed");
        }
        let body = ErrorMessage {
            status: self.status.as_u16(),
            err: self.err,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_carries_status_and_message() {
        let body = ErrorMessage {
            status: 404,
            err: "no doi found for id L1".to_string(),
        };
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(value["status"], 404);
        assert_eq!(value["err"], "no doi found for id L1");
    }
}
