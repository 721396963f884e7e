pub mod api;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod relay;
pub mod routing;
pub mod state;
pub mod stream;
pub mod transport;
pub mod upstream;
