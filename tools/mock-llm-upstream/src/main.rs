use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use mock_llm_upstream::{MockConfig, MockUpstream};

const DEFAULT_UPSTREAM_PORT: u16 = 19_001;
const DEFAULT_EVERY_MS: u64 = 1_000;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let port = env_parse("UPSTREAM_PORT", DEFAULT_UPSTREAM_PORT);
    let every = Duration::from_millis(env_parse("MOCK_EVERY_MS", DEFAULT_EVERY_MS));
    let config = match env::var("MOCK_PARTS") {
        Ok(parts) if !parts.is_empty() => MockConfig::chunks(every, parts.split('|')),
        _ => MockConfig {
            every,
            ..MockConfig::default()
        },
    };

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let mock = MockUpstream::start_on(addr, config)
        .await
        .unwrap_or_else(|err| panic!("failed to bind mock upstream on {addr}: {err}"));
    println!("mock LLM upstream listening on {}", mock.url());

    std::future::pending::<()>().await;
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
