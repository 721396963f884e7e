//! RFC 9457 problem details, the only error body this service emits.

use axum::body::Body;
use axum::response::Response;
use http::{header, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";
pub const ABOUT_BLANK: &str = "about:blank";
pub const INVALID_JSON_TYPE: &str = "https://example.com/problems/invalid-json";
pub const VALIDATION_ERROR_TYPE: &str = "https://example.com/problems/validation-error";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance: String,
}

impl ProblemDetails {
    #[must_use]
    pub fn new(kind: &str, title: &str, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.to_owned(),
            title: title.to_owned(),
            status: 0,
            detail: detail.into(),
            instance: String::new(),
        }
    }
}

/// Render a problem response for `status`, filling defaults the way clients
/// expect: a missing title becomes the canonical reason phrase and a missing
/// type becomes `about:blank`.
#[must_use]
pub fn problem_response(status: StatusCode, mut problem: ProblemDetails, instance: &str) -> Response {
    problem.status = status.as_u16();
    if problem.title.is_empty() {
        problem.title = status.canonical_reason().unwrap_or_default().to_owned();
    }
    if problem.kind.is_empty() {
        problem.kind = ABOUT_BLANK.to_owned();
    }
    problem.instance = instance.to_owned();

    let body = match serde_json::to_vec(&problem) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize problem details");
            Vec::new()
        }
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PROBLEM_CONTENT_TYPE),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}
