use std::time::Duration;

use chat_relay::config::UpstreamConfig;
use chat_relay::error::StreamError;
use chat_relay::protocol::chat::{ChatMessage, CompletionRequest, Role};
use chat_relay::relay::RelayService;
use chat_relay::stream::ChatStreamer;
use chat_relay::upstream::UpstreamClient;
use mock_llm_upstream::{MockConfig, MockUpstream};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn relay_for(mock: &MockUpstream) -> RelayService<UpstreamClient> {
    let upstream =
        UpstreamClient::new(&UpstreamConfig::new(mock.url())).expect("build upstream client");
    RelayService::new(upstream)
}

fn request() -> CompletionRequest {
    CompletionRequest {
        messages: vec![
            ChatMessage::new(Role::System, "be brief"),
            ChatMessage::new(Role::User, "hi"),
        ],
        stream: false,
    }
}

#[tokio::test]
async fn test_relay_forwards_upstream_chunks_in_order() {
    let mock = MockUpstream::start(MockConfig::chunks(
        Duration::from_millis(10),
        ["This ", "is ", "fine."],
    ))
    .await
    .expect("start mock");
    let relay = relay_for(&mock);
    let mut stream = relay.stream_chat(CancellationToken::new(), request());

    let mut deltas = Vec::new();
    let mut finished = 0;
    while let Some(chunk) = tokio::time::timeout(WAIT, stream.chunks.recv())
        .await
        .expect("relay stalled")
    {
        if chunk.is_finished {
            finished += 1;
        } else {
            deltas.push(chunk.delta);
        }
    }
    assert_eq!(deltas, ["This ", "is ", "fine."]);
    assert_eq!(finished, 1);
    assert!(stream.errors.recv().await.is_none());

    let (last, _) = mock.last_request();
    let last = last.expect("request recorded");
    assert!(last.stream);
    assert_eq!(last.messages.len(), 2);
    assert_eq!(last.messages[0].role, "system");
}

#[tokio::test]
async fn test_relay_cancellation_closes_outputs_and_upstream() {
    let parts: Vec<String> = (0..100).map(|i| i.to_string()).collect();
    let mock = MockUpstream::start(MockConfig::chunks(Duration::from_millis(10), parts))
        .await
        .expect("start mock");
    let relay = relay_for(&mock);
    let cancel = CancellationToken::new();
    let mut stream = relay.stream_chat(cancel.clone(), request());

    for _ in 0..3 {
        tokio::time::timeout(WAIT, stream.chunks.recv())
            .await
            .expect("relay stalled")
            .expect("chunk before cancel");
    }
    cancel.cancel();

    let drained = tokio::time::timeout(Duration::from_millis(300), async {
        let mut extra = 0;
        while stream.chunks.recv().await.is_some() {
            extra += 1;
        }
        extra
    })
    .await
    .expect("relay outputs should close promptly");
    assert!(drained <= 1);
    assert!(stream.errors.recv().await.is_none());

    tokio::time::timeout(Duration::from_millis(800), mock.wait_disconnected())
        .await
        .expect("upstream should observe the disconnect");
}

#[tokio::test]
async fn test_relay_forwards_upstream_error() {
    let mock = MockUpstream::start(MockConfig::status(503, "overloaded"))
        .await
        .expect("start mock");
    let relay = relay_for(&mock);
    let mut stream = relay.stream_chat(CancellationToken::new(), request());

    assert!(tokio::time::timeout(WAIT, stream.chunks.recv())
        .await
        .expect("relay stalled")
        .is_none());
    let err = tokio::time::timeout(WAIT, stream.errors.recv())
        .await
        .expect("relay stalled")
        .expect("forwarded error");
    assert_eq!(
        err,
        StreamError::UpstreamStatus {
            status: 503,
            body: "overloaded".to_string()
        }
    );
}
