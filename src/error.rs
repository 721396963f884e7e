use axum::response::Response;
use http::StatusCode;

use crate::protocol::problem::{
    problem_response, ProblemDetails, INVALID_JSON_TYPE, VALIDATION_ERROR_TYPE,
};

/// Terminal failure of a single chat stream.
///
/// Cancellation is deliberately absent: a cancelled stream closes without
/// ever producing one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream status={status} body={body:?}")]
    UpstreamStatus { status: u16, body: String },
    #[error("invalid json chunk payload: {0}")]
    MalformedFrame(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl StreamError {
    /// Transport-class errors: the upstream could not be reached, hung up
    /// abnormally, or answered with a non-success status.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::UpstreamStatus { .. })
    }
}

/// Client input errors, reported before any stream byte is written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Only POST is supported for this endpoint.")]
    MethodNotAllowed,
    #[error("Content-Type must be application/json.")]
    UnsupportedMediaType,
    #[error("{0}")]
    InvalidJson(String),
    #[error("{0}")]
    Validation(String),
    #[error("Streaming unsupported by server.")]
    StreamingUnavailable,
}

impl RequestError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::InvalidJson(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::StreamingUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[must_use]
    pub fn to_problem(&self) -> ProblemDetails {
        let detail = self.to_string();
        match self {
            Self::InvalidJson(_) => ProblemDetails::new(INVALID_JSON_TYPE, "Invalid JSON", detail),
            Self::Validation(_) => {
                ProblemDetails::new(VALIDATION_ERROR_TYPE, "Validation Error", detail)
            }
            Self::MethodNotAllowed | Self::UnsupportedMediaType | Self::StreamingUnavailable => {
                ProblemDetails::new("", "", detail)
            }
        }
    }

    /// Render as an `application/problem+json` response for `instance`.
    #[must_use]
    pub fn into_response(self, instance: &str) -> Response {
        problem_response(self.status(), self.to_problem(), instance)
    }
}
