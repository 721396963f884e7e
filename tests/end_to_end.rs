use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::Request;
use axum::Router;
use chat_relay::config::AppConfig;
use chat_relay::protocol::chat::CompletionChunk;
use chat_relay::relay::RelayService;
use chat_relay::routing::dispatch::dispatch_request;
use chat_relay::state::AppState;
use chat_relay::stream::sse::{parse_payload, FrameDecoder};
use chat_relay::upstream::UpstreamClient;
use futures_util::StreamExt;
use mock_llm_upstream::{MockConfig, MockUpstream};

const HELLO: &str = r#"{"messages":[{"role":"user","content":"hi"}],"stream":false}"#;

/// Serve the relay on an ephemeral port in front of `mock`.
async fn start_relay(mock: &MockUpstream) -> (String, tokio::task::JoinHandle<()>) {
    let config = AppConfig::with_upstream(mock.url());
    let upstream = UpstreamClient::new(&config.upstream).expect("build upstream client");
    let state = Arc::new(AppState::new(config, Arc::new(RelayService::new(upstream))));
    let base_path = Arc::<str>::from("");
    let app = Router::new().fallback(move |request: Request<Body>| {
        dispatch_request(Arc::clone(&state), Arc::clone(&base_path), request)
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/v1/chat/stream"), server)
}

async fn open_stream(url: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(url)
        .header("content-type", "application/json")
        .body(HELLO)
        .send()
        .await
        .expect("relay request")
}

/// Pull the next decoded chunk off a downstream SSE body.
async fn next_chunk<S>(body: &mut S, decoder: &mut FrameDecoder) -> Option<CompletionChunk>
where
    S: futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
{
    loop {
        if let Some(payload) = decoder.next_payload().expect("well-formed frame") {
            if let Some(event) = parse_payload(&payload).expect("well-formed payload") {
                return Some(event.chunk);
            }
            continue;
        }
        let bytes = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("downstream stalled")?
            .expect("downstream read");
        decoder.feed(&bytes);
    }
}

#[tokio::test]
async fn test_end_to_end_incremental_delivery() {
    let mock = MockUpstream::start(MockConfig::chunks(
        Duration::from_millis(50),
        ["Once ", "upon ", "a ", "time", "."],
    ))
    .await
    .expect("start mock");
    let (url, server) = start_relay(&mock).await;

    let response = open_stream(&url).await;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let mut body = response.bytes_stream();
    let mut decoder = FrameDecoder::new();
    let mut arrivals = Vec::new();
    let mut text = String::new();
    let mut finished = false;
    while let Some(chunk) = next_chunk(&mut body, &mut decoder).await {
        if chunk.is_finished {
            finished = true;
            continue;
        }
        arrivals.push(Instant::now());
        text.push_str(&chunk.delta);
    }

    assert!(finished);
    assert_eq!(text, "Once upon a time.");
    let written = mock.write_times();
    for (index, (arrived, sent)) in arrivals.iter().zip(&written).enumerate() {
        let latency = arrived.saturating_duration_since(*sent);
        assert!(
            latency < Duration::from_millis(100),
            "frame {index} took {latency:?} to cross the relay"
        );
    }
    assert!(arrivals[4].duration_since(arrivals[0]) >= Duration::from_millis(150));

    server.abort();
}

#[tokio::test]
async fn test_end_to_end_client_disconnect_reaches_upstream() {
    let parts: Vec<String> = (0..100).map(|i| format!("{i} ")).collect();
    let mock = MockUpstream::start(MockConfig::chunks(Duration::from_millis(10), parts))
        .await
        .expect("start mock");
    let (url, server) = start_relay(&mock).await;

    let response = open_stream(&url).await;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    tokio::time::timeout(Duration::from_secs(5), mock.wait_started())
        .await
        .expect("upstream stream should start");

    let mut body = response.bytes_stream();
    let mut decoder = FrameDecoder::new();
    for _ in 0..3 {
        next_chunk(&mut body, &mut decoder)
            .await
            .expect("chunk before disconnect");
    }
    drop(body);

    tokio::time::timeout(Duration::from_millis(800), mock.wait_disconnected())
        .await
        .expect("upstream should observe the downstream disconnect");

    server.abort();
}

#[tokio::test]
async fn test_end_to_end_upstream_failure_ends_stream_without_frames() {
    let mock = MockUpstream::start(MockConfig::status(503, "overloaded"))
        .await
        .expect("start mock");
    let (url, server) = start_relay(&mock).await;

    let response = open_stream(&url).await;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = tokio::time::timeout(Duration::from_secs(5), response.bytes())
        .await
        .expect("stream should end")
        .expect("read body");
    assert!(body.is_empty());

    server.abort();
}
