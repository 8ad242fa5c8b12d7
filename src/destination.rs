//! Destination resolution and dialing.
//!
//! A destination is derived from the upgrade request without any I/O. The
//! address comes from the `address` query parameter (`name` is accepted as a
//! legacy alias) or from the `Host` header, optionally with a fixed suffix
//! appended. A configured Unix socket path overrides everything.

use anyhow::{Context, Result};
use std::fmt;
use tokio::net::TcpStream;

use crate::stream::UpstreamStream;

/// Canonical query parameter carrying the destination address.
pub const ADDRESS_PARAM: &str = "address";
/// Older clients send the destination under this name.
pub const LEGACY_ADDRESS_PARAM: &str = "name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

impl Network {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub network: Network,
    pub address: String,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network.as_str(), self.address)
    }
}

impl Destination {
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            network: Network::Tcp,
            address: address.into(),
        }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            network: Network::Unix,
            address: path.into(),
        }
    }

    /// Dials the destination. There is no retry; a failed dial ends the session.
    pub async fn connect(&self) -> Result<UpstreamStream> {
        match self.network {
            Network::Tcp => {
                let stream = TcpStream::connect(self.address.as_str())
                    .await
                    .with_context(|| format!("Failed to connect to {self}"))?;
                // Matches the latency profile of interactive protocols like Postgres.
                stream
                    .set_nodelay(true)
                    .with_context(|| format!("Failed to set TCP_NODELAY on {self}"))?;
                Ok(UpstreamStream::Tcp(stream))
            }
            #[cfg(unix)]
            Network::Unix => {
                let stream = tokio::net::UnixStream::connect(&self.address)
                    .await
                    .with_context(|| format!("Failed to connect to {self}"))?;
                Ok(UpstreamStream::Unix(stream))
            }
            #[cfg(not(unix))]
            Network::Unix => {
                anyhow::bail!("Unix sockets are not supported on this platform: {self}")
            }
        }
    }
}

/// Request metadata that may name the destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationRequest {
    pub address_param: Option<String>,
    pub host_header: Option<String>,
}

impl DestinationRequest {
    /// Builds the request view from a raw (still percent-encoded) query string
    /// and the `Host` header value.
    #[must_use]
    pub fn from_parts(query: Option<&str>, host_header: Option<&str>) -> Self {
        let mut address = None;
        let mut legacy = None;
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            if key == ADDRESS_PARAM && address.is_none() {
                address = Some(value.into_owned());
            } else if key == LEGACY_ADDRESS_PARAM && legacy.is_none() {
                legacy = Some(value.into_owned());
            }
        }

        Self {
            address_param: address.or(legacy),
            host_header: host_header.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub use_host_header: bool,
    pub append_port: String,
    pub unix_socket_path: Option<String>,
}

impl ResolveOptions {
    /// True when the operator has pinned every session to one Unix socket.
    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        self.unix_socket_path.is_some()
    }
}

/// Derives the destination for a request. Pure and total: the result may be
/// an address the dial step later rejects.
#[must_use]
pub fn resolve(request: &DestinationRequest, options: &ResolveOptions) -> Destination {
    if let Some(path) = &options.unix_socket_path {
        return Destination::unix(path.clone());
    }

    let base = if options.use_host_header {
        request.host_header.as_deref()
    } else {
        request.address_param.as_deref()
    };

    let mut address = base.unwrap_or_default().to_string();
    address.push_str(&options.append_port);
    Destination::tcp(address)
}
