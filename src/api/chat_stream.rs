//! Downstream Stream Handler for `POST /v1/chat/stream`.
//!
//! All request checks run before the response head is produced; once the
//! `200 text/event-stream` head is out, failures can only end the stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;

use crate::api::request::decode_chat_request;
use crate::error::RequestError;
use crate::state::AppState;
use crate::stream::sse::encode_data_frame;
use crate::stream::ChatStream;

/// Handle one chat stream request.
pub async fn handler(
    state: Arc<AppState>,
    method: &Method,
    headers: &HeaderMap,
    path: &str,
    body: Body,
) -> Response {
    let request_id = state.next_request_id();
    let span = tracing::info_span!("chat_stream", %request_id);
    match start_stream(&state, method, headers, body, span.clone())
        .instrument(span.clone())
        .await
    {
        Ok(response) => response,
        Err(err) => {
            span.in_scope(|| tracing::debug!(status = %err.status(), error = %err, "rejected request"));
            err.into_response(path)
        }
    }
}

async fn start_stream(
    state: &AppState,
    method: &Method,
    headers: &HeaderMap,
    body: Body,
    span: tracing::Span,
) -> Result<Response, RequestError> {
    if method != Method::POST {
        return Err(RequestError::MethodNotAllowed);
    }
    if !content_type_acceptable(headers) {
        return Err(RequestError::UnsupportedMediaType);
    }

    let bytes = body::to_bytes(body, state.config.server.max_body_bytes)
        .await
        .map_err(|err| RequestError::InvalidJson(format!("Unable to read request body: {err}")))?;
    let request = decode_chat_request(&bytes)?;

    let Some(streamer) = state.streamer() else {
        return Err(RequestError::StreamingUnavailable);
    };

    let cancel = CancellationToken::new();
    let stream = streamer.stream_chat(cancel.clone(), request.into_streaming());
    tracing::debug!("stream started");

    let frames = futures_util::stream::unfold(
        ResponseFrames {
            stream,
            cancel: cancel.clone(),
            errors_open: true,
            _disconnect: cancel.drop_guard(),
            span,
        },
        |frames| {
            let span = frames.span.clone();
            frames.next_frame().instrument(span)
        },
    );
    Ok(sse_response(Body::from_stream(
        frames.map(Ok::<Bytes, Infallible>),
    )))
}

/// A missing Content-Type is accepted; a present one must be JSON.
fn content_type_acceptable(headers: &HeaderMap) -> bool {
    match headers.get(header::CONTENT_TYPE) {
        None => true,
        Some(value) => value
            .to_str()
            .is_ok_and(|value| value.starts_with("application/json")),
    }
}

fn sse_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// Response body state. The server drops it when the client goes away, and
/// the drop guard turns that into cancellation of every hop.
struct ResponseFrames {
    stream: ChatStream,
    cancel: CancellationToken,
    errors_open: bool,
    _disconnect: DropGuard,
    span: tracing::Span,
}

impl ResponseFrames {
    /// Produce the next `data:` frame, or `None` once the stream is over.
    async fn next_frame(mut self) -> Option<(Bytes, Self)> {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    tracing::info!("stream cancelled");
                    return None;
                }
                chunk = self.stream.chunks.recv() => {
                    let Some(chunk) = chunk else {
                        self.finish();
                        return None;
                    };
                    return match serde_json::to_vec(&chunk) {
                        Ok(json) => Some((encode_data_frame(&json), self)),
                        Err(err) => {
                            tracing::error!(error = %err, "failed to encode chunk");
                            None
                        }
                    };
                }
                err = self.stream.errors.recv(), if self.errors_open => match err {
                    Some(err) => {
                        tracing::error!(error = %err, "stream error");
                        return None;
                    }
                    None => self.errors_open = false,
                },
            }
        }
    }

    /// The chunk sequence closed. An error queued alongside the close still
    /// marks the stream as aborted.
    fn finish(&mut self) {
        if self.errors_open {
            if let Ok(err) = self.stream.errors.try_recv() {
                tracing::error!(error = %err, "stream error");
                return;
            }
        }
        tracing::debug!("stream completed");
    }
}
