//! Request-scoped chunk/error channel pairs shared by every streaming hop.
//!
//! Each hop owns the producer half of exactly one [`ChatStream`] and drops it
//! when it is done, which closes both sequences once. Consumers watch the
//! chunk and error receivers together with the request's
//! [`CancellationToken`].

pub mod sse;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::protocol::chat::{CompletionChunk, CompletionRequest};

/// Chunk channel depth. tokio has no rendezvous channel; one slot is the
/// tightest handoff it offers, so a slow consumer stalls the producer after a
/// single chunk.
pub const CHUNK_CHANNEL_CAPACITY: usize = 1;

/// Error channel depth. One slot keeps a terminal error from being lost when
/// the consumer is not yet listening.
pub const ERROR_CHANNEL_CAPACITY: usize = 1;

/// Consumer half of one stream.
#[derive(Debug)]
pub struct ChatStream {
    pub chunks: mpsc::Receiver<CompletionChunk>,
    pub errors: mpsc::Receiver<StreamError>,
}

/// Producer half of one stream.
#[derive(Debug)]
pub struct ChatStreamSender {
    chunks: mpsc::Sender<CompletionChunk>,
    errors: mpsc::Sender<StreamError>,
}

/// Create the channel pair for a single stream.
#[must_use]
pub fn chat_stream_channel() -> (ChatStreamSender, ChatStream) {
    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
    (
        ChatStreamSender {
            chunks: chunk_tx,
            errors: error_tx,
        },
        ChatStream {
            chunks: chunk_rx,
            errors: error_rx,
        },
    )
}

impl ChatStreamSender {
    /// Deliver a chunk unless the request is cancelled first.
    ///
    /// Returns `false` when the chunk was not delivered, either because the
    /// token fired (before or while waiting for room) or because the consumer
    /// went away. The producer must stop in both cases.
    pub async fn send_chunk(&self, cancel: &CancellationToken, chunk: CompletionChunk) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            sent = self.chunks.send(chunk) => sent.is_ok(),
        }
    }

    /// Report the stream's terminal error.
    ///
    /// Errors raised after cancellation are the expected fallout of tearing
    /// the request down and are dropped here.
    pub async fn send_error(&self, cancel: &CancellationToken, err: StreamError) {
        if cancel.is_cancelled() {
            tracing::debug!(error = %err, "dropping stream error after cancellation");
            return;
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => {}
            _ = self.errors.send(err) => {}
        }
    }
}

/// Anything that can turn a completion request into a chunk stream.
///
/// Implementations return immediately and produce asynchronously on a task
/// of their own. They must stop producing promptly once `cancel` fires and
/// close both sequences exactly once.
pub trait ChatStreamer: Send + Sync {
    fn stream_chat(&self, cancel: CancellationToken, request: CompletionRequest) -> ChatStream;
}

impl<T: ChatStreamer + ?Sized> ChatStreamer for std::sync::Arc<T> {
    fn stream_chat(&self, cancel: CancellationToken, request: CompletionRequest) -> ChatStream {
        (**self).stream_chat(cancel, request)
    }
}
