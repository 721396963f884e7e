//! Streaming HTTP client for the upstream completion endpoint.
//!
//! One call issues a single POST, decodes the SSE body incrementally with
//! [`FrameDecoder`] and pushes chunks onto the request's [`ChatStream`] as
//! soon as each event is complete. Cancelling the request token drops the
//! in-flight response, which closes the upstream connection.

use futures_util::StreamExt;
use http::{header, HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::UpstreamConfig;
use crate::error::StreamError;
use crate::protocol::chat::CompletionRequest;
use crate::stream::sse::{parse_payload, FrameDecoder};
use crate::stream::{chat_stream_channel, ChatStream, ChatStreamSender, ChatStreamer};
use crate::transport::{build_extra_headers, build_upstream_client};

/// Cap on the error body kept for diagnostics on a non-success status.
pub const ERROR_BODY_PREFIX_BYTES: usize = 8 * 1024;

/// Upstream Streaming Client.
#[derive(Clone)]
pub struct UpstreamClient {
    url: url::Url,
    client: reqwest::Client,
    headers: HeaderMap,
}

impl UpstreamClient {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Transport`] when the URL, a header or the proxy
    /// setting is invalid.
    pub fn new(config: &UpstreamConfig) -> Result<Self, StreamError> {
        let client = build_upstream_client(config)?;
        let headers = build_extra_headers(&config.headers)?;
        Self::with_client(&config.url, client, headers)
    }

    /// Build a client around an existing `reqwest::Client`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Transport`] when `url` does not parse.
    pub fn with_client(
        url: &str,
        client: reqwest::Client,
        headers: HeaderMap,
    ) -> Result<Self, StreamError> {
        let url = url::Url::parse(url)
            .map_err(|e| StreamError::Transport(format!("Invalid upstream URL: {e}")))?;
        Ok(Self {
            url,
            client,
            headers,
        })
    }

    #[must_use]
    pub fn url(&self) -> &url::Url {
        &self.url
    }

    async fn run(self, cancel: CancellationToken, request: CompletionRequest, tx: ChatStreamSender) {
        let body = match serde_json::to_vec(&request) {
            Ok(body) => body,
            Err(err) => {
                tx.send_error(&cancel, StreamError::Decode(err.to_string()))
                    .await;
                return;
            }
        };

        let pending = self
            .client
            .post(self.url.clone())
            .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(header::ACCEPT, HeaderValue::from_static("text/event-stream"))
            .headers(self.headers.clone())
            .body(body)
            .send();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("upstream request cancelled before response headers");
                return;
            }
            response = pending => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                if cancel.is_cancelled() {
                    return;
                }
                tracing::warn!(error = %err, "upstream request failed");
                tx.send_error(&cancel, StreamError::Transport(err.to_string()))
                    .await;
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let Some(body) = read_body_prefix(response, &cancel, ERROR_BODY_PREFIX_BYTES).await
            else {
                return;
            };
            tx.send_error(
                &cancel,
                StreamError::UpstreamStatus {
                    status: status.as_u16(),
                    body,
                },
            )
            .await;
            return;
        }

        relay_events(response, &cancel, &tx).await;
    }
}

impl ChatStreamer for UpstreamClient {
    fn stream_chat(&self, cancel: CancellationToken, request: CompletionRequest) -> ChatStream {
        let (tx, stream) = chat_stream_channel();
        let call = self.clone();
        tokio::spawn(
            call.run(cancel, request.into_streaming(), tx)
                .in_current_span(),
        );
        stream
    }
}

/// Read the SSE body event by event until a terminal event, EOF, an error or
/// cancellation.
async fn relay_events(
    response: reqwest::Response,
    cancel: &CancellationToken,
    tx: &ChatStreamSender,
) {
    let mut body = response.bytes_stream();
    let mut decoder = FrameDecoder::new();

    loop {
        loop {
            let payload = match decoder.next_payload() {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(error = %err, "undecodable upstream frame");
                    tx.send_error(cancel, err).await;
                    return;
                }
            };
            match parse_payload(&payload) {
                Ok(None) => {}
                Ok(Some(event)) => {
                    if !tx.send_chunk(cancel, event.chunk).await {
                        return;
                    }
                    if event.terminal {
                        tracing::debug!("upstream stream finished");
                        return;
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "malformed upstream frame");
                    tx.send_error(cancel, err).await;
                    return;
                }
            }
        }

        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            next = body.next() => next,
        };
        match next {
            Some(Ok(bytes)) => decoder.feed(&bytes),
            Some(Err(err)) => {
                if cancel.is_cancelled() {
                    return;
                }
                tracing::warn!(error = %err, "upstream body read failed");
                tx.send_error(
                    cancel,
                    StreamError::Transport(format!("reading upstream body: {err}")),
                )
                .await;
                return;
            }
            None => {
                if decoder.has_partial_event() {
                    tracing::debug!("upstream closed mid-event; discarding partial event");
                }
                return;
            }
        }
    }
}

/// Read at most `limit` bytes of an error body. `None` means the request was
/// cancelled while reading.
async fn read_body_prefix(
    response: reqwest::Response,
    cancel: &CancellationToken,
    limit: usize,
) -> Option<String> {
    let mut body = response.bytes_stream();
    let mut prefix = Vec::with_capacity(limit.min(1024));
    while prefix.len() < limit {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            next = body.next() => next,
        };
        match next {
            Some(Ok(bytes)) => {
                let take = (limit - prefix.len()).min(bytes.len());
                prefix.extend_from_slice(&bytes[..take]);
            }
            Some(Err(_)) | None => break,
        }
    }
    Some(String::from_utf8_lossy(&prefix).into_owned())
}
