use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::stream::ChatStreamer;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    streamer: Option<Arc<dyn ChatStreamer>>,
    request_ids: RequestIds,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig, streamer: Arc<dyn ChatStreamer>) -> Self {
        Self {
            config,
            streamer: Some(streamer),
            request_ids: RequestIds::new(),
        }
    }

    /// State for a server that accepts requests but cannot stream; the chat
    /// endpoint answers 500 until a streamer is wired in.
    #[must_use]
    pub fn without_streamer(config: AppConfig) -> Self {
        Self {
            config,
            streamer: None,
            request_ids: RequestIds::new(),
        }
    }

    #[must_use]
    pub fn streamer(&self) -> Option<&Arc<dyn ChatStreamer>> {
        self.streamer.as_ref()
    }

    /// Unique id for the next inbound request.
    pub fn next_request_id(&self) -> uuid::Uuid {
        self.request_ids.next()
    }
}

/// Process-unique request ids: a random 128-bit seed xored with a counter,
/// so ids never repeat within a process and differ across restarts.
struct RequestIds {
    seed: u128,
    counter: AtomicU64,
}

impl RequestIds {
    fn new() -> Self {
        let seed = (u128::from(fastrand::u64(..)) << 64) | u128::from(fastrand::u64(..));
        Self {
            seed,
            counter: AtomicU64::new(1),
        }
    }

    fn next(&self) -> uuid::Uuid {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        uuid::Uuid::from_u128(self.seed ^ u128::from(seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_distinct() {
        let state = AppState::without_streamer(AppConfig::with_upstream("http://127.0.0.1:1/"));
        let first = state.next_request_id();
        let second = state.next_request_id();
        assert_ne!(first, second);
        assert!(state.streamer().is_none());
    }
}
