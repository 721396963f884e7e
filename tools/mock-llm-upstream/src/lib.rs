//! Scripted SSE upstream for exercising the relay without a model backend.
//!
//! Every POST gets the configured script, one frame per tick. The server
//! records what it was sent and exposes two signals: the stream started, and
//! the client went away before the script completed.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

type MockBody = UnsyncBoxBody<Bytes, Infallible>;

/// What the upstream sends back for each request.
#[derive(Debug, Clone)]
pub enum Script {
    /// One JSON chunk per part, then a finished chunk.
    Chunks(Vec<String>),
    /// Each payload written verbatim as its own `data:` event.
    Raw(Vec<String>),
    /// A plain non-streaming reply.
    Status { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub every: Duration,
    pub script: Script,
}

impl MockConfig {
    pub fn chunks<I, S>(every: Duration, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            every,
            script: Script::Chunks(parts.into_iter().map(Into::into).collect()),
        }
    }

    pub fn raw<I, S>(every: Duration, payloads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            every,
            script: Script::Raw(payloads.into_iter().map(Into::into).collect()),
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            every: Duration::from_millis(10),
            script: Script::Status {
                status,
                body: body.into(),
            },
        }
    }
}

impl Default for MockConfig {
    fn default() -> Self {
        Self::chunks(
            Duration::from_secs(1),
            ["This ", "is ", "a ", "mock ", "LLM ", "response."],
        )
    }
}

/// Request body as the upstream sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockRequest {
    pub messages: Vec<MockMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize)]
struct WireChunk<'a> {
    delta: &'a str,
    #[serde(rename = "isFinished")]
    is_finished: bool,
}

struct Shared {
    config: MockConfig,
    started: watch::Sender<bool>,
    disconnected: watch::Sender<bool>,
    last_request: Mutex<Option<MockRequest>>,
    request_count: AtomicUsize,
    write_times: Mutex<Vec<Instant>>,
}

/// A running mock upstream. Dropping it stops accepting connections.
pub struct MockUpstream {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl MockUpstream {
    /// Serve `config` on an ephemeral loopback port.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn start(config: MockConfig) -> std::io::Result<Self> {
        Self::start_on(SocketAddr::from(([127, 0, 0, 1], 0)), config).await
    }

    /// Serve `config` on `addr`.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn start_on(addr: SocketAddr, config: MockConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            config,
            started: watch::Sender::new(false),
            disconnected: watch::Sender::new(false),
            last_request: Mutex::new(None),
            request_count: AtomicUsize::new(0),
            write_times: Mutex::new(Vec::new()),
        });
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));
        Ok(Self {
            addr,
            shared,
            accept_task,
        })
    }

    /// Completion endpoint URL. Any path works; this one reads naturally.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}/v1/chat/completions", self.addr)
    }

    /// Resolves once a stream has started.
    pub async fn wait_started(&self) {
        let mut rx = self.shared.started.subscribe();
        let _ = rx.wait_for(|started| *started).await;
    }

    /// Resolves once a client has dropped a stream before its script ended.
    pub async fn wait_disconnected(&self) {
        let mut rx = self.shared.disconnected.subscribe();
        let _ = rx.wait_for(|gone| *gone).await;
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        *self.shared.disconnected.borrow()
    }

    /// Last decoded request and the number of requests decoded so far.
    #[must_use]
    pub fn last_request(&self) -> (Option<MockRequest>, usize) {
        let last = self.shared.last_request.lock().clone();
        (last, self.shared.request_count.load(Ordering::Acquire))
    }

    /// When each frame was handed to the connection, across all streams.
    #[must_use]
    pub fn write_times(&self) -> Vec<Instant> {
        self.shared.write_times.lock().clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let conn_builder = AutoBuilder::new(TokioExecutor::new());
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                eprintln!("mock upstream accept error: {err}");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let shared = Arc::clone(&shared);
        let service = service_fn(move |request: Request<Incoming>| {
            let shared = Arc::clone(&shared);
            async move { Ok::<_, Infallible>(handle_request(request, shared).await) }
        });
        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, service).await {
                eprintln!("mock upstream connection error from {remote_addr}: {err}");
            }
        });
    }
}

async fn handle_request(request: Request<Incoming>, shared: Arc<Shared>) -> Response<MockBody> {
    let (parts, body) = request.into_parts();
    if parts.method != Method::POST {
        return plain_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed".into());
    }

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => return plain_response(StatusCode::BAD_REQUEST, format!("bad body: {err}")),
    };
    let decoded: MockRequest = match serde_json::from_slice(&body) {
        Ok(decoded) => decoded,
        Err(err) => return plain_response(StatusCode::BAD_REQUEST, format!("bad json: {err}")),
    };
    *shared.last_request.lock() = Some(decoded);
    shared.request_count.fetch_add(1, Ordering::AcqRel);

    let frames = match &shared.config.script {
        Script::Status { status, body } => {
            let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return plain_response(status, body.clone());
        }
        Script::Chunks(parts) => chunk_frames(parts),
        Script::Raw(payloads) => payloads.iter().map(|p| data_frame(p.as_bytes())).collect(),
    };

    shared.started.send_replace(true);
    let (tx, mut rx) = mpsc::channel::<Bytes>(1);
    tokio::spawn(play_script(frames, tx, Arc::clone(&shared)));

    let stream = futures_util::stream::poll_fn(move |cx| {
        rx.poll_recv(cx)
            .map(|next| next.map(|bytes| Ok::<_, Infallible>(Frame::data(bytes))))
    });
    let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Write one frame per tick. The receiver lives inside the response body, so
/// a closed channel means the connection dropped the body.
async fn play_script(frames: Vec<Bytes>, tx: mpsc::Sender<Bytes>, shared: Arc<Shared>) {
    let every = shared.config.every;
    let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    for frame in frames {
        tokio::select! {
            () = tx.closed() => {
                shared.disconnected.send_replace(true);
                return;
            }
            _ = ticks.tick() => {}
        }
        if tx.send(frame).await.is_err() {
            shared.disconnected.send_replace(true);
            return;
        }
        shared.write_times.lock().push(Instant::now());
    }
}

fn chunk_frames(parts: &[String]) -> Vec<Bytes> {
    let mut frames: Vec<Bytes> = parts
        .iter()
        .map(|part| encode_chunk(part, false))
        .collect();
    frames.push(encode_chunk("", true));
    frames
}

fn encode_chunk(delta: &str, is_finished: bool) -> Bytes {
    let json = serde_json::to_vec(&WireChunk { delta, is_finished }).unwrap_or_default();
    data_frame(&json)
}

fn data_frame(payload: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(b"data: ");
    frame.extend_from_slice(payload);
    frame.extend_from_slice(b"\n\n");
    Bytes::from(frame)
}

fn plain_response(status: StatusCode, body: String) -> Response<MockBody> {
    let mut response = Response::new(Full::new(Bytes::from(body)).boxed_unsync());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_frames_end_with_finished_chunk() {
        let frames = chunk_frames(&["Hel".to_string()]);
        assert_eq!(
            frames[0],
            Bytes::from_static(b"data: {\"delta\":\"Hel\",\"isFinished\":false}\n\n")
        );
        assert_eq!(
            frames[1],
            Bytes::from_static(b"data: {\"delta\":\"\",\"isFinished\":true}\n\n")
        );
    }

    #[tokio::test]
    async fn test_fresh_mock_has_seen_nothing() {
        let mock = MockUpstream::start(MockConfig::default()).await.unwrap();
        let (last, count) = mock.last_request();
        assert!(last.is_none());
        assert_eq!(count, 0);
        assert!(!mock.is_disconnected());
    }
}
