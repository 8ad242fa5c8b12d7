//! WebSocket Proxy
//!
//! Accepts WebSocket upgrades and relays each session as a raw byte stream to a
//! TCP or Unix-socket destination chosen per request and checked against an allow-list.
//! Supports TLS termination and exposes Prometheus metrics on a side port.

pub mod allowlist;
pub mod config;
pub mod destination;
pub mod metrics;
pub mod proxy;
pub mod relay;
pub mod stream;
pub mod tls;

// Re-export commonly used types and functions
pub use allowlist::AllowList;
pub use config::{Config, DestinationConfig, ListenConfig, LoggingConfig, TlsConfig, load_config};
pub use destination::{Destination, DestinationRequest, Network, ResolveOptions, resolve};
pub use metrics::{Metrics, MetricsSnapshot, Source};
pub use proxy::{DENIED_MESSAGE, Proxy, ProxySettings, Rejection, parse_original_client_ip, serve};
pub use relay::{BUFFER_SIZE, RelayOptions, relay};
pub use stream::{ClientStream, UpstreamStream};
pub use tls::load_tls_acceptor;
