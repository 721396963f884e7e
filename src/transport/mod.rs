mod http_transport;

pub use http_transport::{build_extra_headers, build_upstream_client};
