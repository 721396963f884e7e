//! Relay Service: the seam between the stream handler and whatever produces
//! chunks. It forwards the inner stream unchanged and owns the cancellation
//! contract, so the handler can be driven by the real upstream client or by
//! any other [`ChatStreamer`].

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::protocol::chat::CompletionRequest;
use crate::stream::{chat_stream_channel, ChatStream, ChatStreamSender, ChatStreamer};

pub struct RelayService<S> {
    inner: S,
}

impl<S: ChatStreamer> RelayService<S> {
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    #[cfg(test)]
    fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: ChatStreamer> ChatStreamer for RelayService<S> {
    fn stream_chat(&self, cancel: CancellationToken, request: CompletionRequest) -> ChatStream {
        let (tx, outer) = chat_stream_channel();
        let inner = self
            .inner
            .stream_chat(cancel.clone(), request.into_streaming());
        tokio::spawn(forward(inner, tx, cancel).in_current_span());
        outer
    }
}

/// Forward until the inner chunk sequence closes, an error has been passed
/// on, or the token fires. Dropping `tx` on return closes both outputs.
///
/// Chunks win over errors when both are ready, so a chunk produced before
/// the error is never overtaken by it. An error still queued when the chunk
/// sequence closes is forwarded rather than lost.
async fn forward(mut inner: ChatStream, tx: ChatStreamSender, cancel: CancellationToken) {
    let mut errors_open = true;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("relay cancelled");
                return;
            }
            chunk = inner.chunks.recv() => match chunk {
                Some(chunk) => {
                    if !tx.send_chunk(&cancel, chunk).await {
                        return;
                    }
                }
                None => break,
            },
            err = inner.errors.recv(), if errors_open => match err {
                Some(err) => {
                    tx.send_error(&cancel, err).await;
                    return;
                }
                None => errors_open = false,
            },
        }
    }

    // Only an error queued before the chunk close counts; waiting for one
    // would keep the outputs open past the inner close.
    if errors_open {
        if let Ok(err) = inner.errors.try_recv() {
            tx.send_error(&cancel, err).await;
        }
    }
}
