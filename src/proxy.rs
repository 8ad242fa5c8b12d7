use anyhow::{Context, Result, bail};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, time::timeout};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{HeaderValue, StatusCode, header},
        protocol::frame::coding::CloseCode,
    },
};
use tracing::{debug, error, info, warn};

use crate::allowlist::AllowList;
use crate::config::Config;
use crate::destination::{Destination, DestinationRequest, ResolveOptions, resolve};
use crate::metrics::Metrics;
use crate::relay::{RelayOptions, relay, send_close};
use crate::stream::ClientStream;

/// Body of the 400 response sent when the allow-list denies a destination.
pub const DENIED_MESSAGE: &str = "proxying to specified address not allowed";

/// Deadline for the TLS handshake and, separately, for the HTTP upgrade request.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// The only path that may be upgraded.
    pub path: String,
    pub resolve: ResolveOptions,
    /// Emit one structured line per upgrade request.
    pub log_connections: bool,
    pub relay: RelayOptions,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            path: "/v1".to_string(),
            resolve: ResolveOptions::default(),
            log_connections: true,
            relay: RelayOptions::default(),
        }
    }
}

impl ProxySettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            path: config.listen.path.clone(),
            resolve: ResolveOptions {
                use_host_header: config.destination.use_host_header,
                append_port: config.destination.append_port.clone(),
                unix_socket_path: config.destination.unix_socket_path.clone(),
            },
            log_connections: config.logging.connections,
            relay: RelayOptions {
                log_traffic: config.logging.traffic,
                idle_timeout: config.idle_timeout(),
            },
        }
    }
}

/// Why an upgrade request was refused before any session started.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("no WebSocket endpoint at {0}")]
    UnknownPath(String),
    #[error("proxying to {0} not allowed")]
    NotAllowed(Destination),
}

impl Rejection {
    fn to_response(&self) -> ErrorResponse {
        let (status, body) = match self {
            Self::UnknownPath(_) => (StatusCode::NOT_FOUND, "not found"),
            Self::NotAllowed(_) => (StatusCode::BAD_REQUEST, DENIED_MESSAGE),
        };

        let mut response = ErrorResponse::new(Some(body.to_string()));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        response
    }
}

/// Parses the original client IP from an X-Forwarded-For header.
/// Format: "client, proxy1, proxy2, ..." - returns the leftmost entry.
#[must_use]
pub fn parse_original_client_ip(xff_header: &str) -> Option<String> {
    xff_header
        .split(',')
        .next()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// Shared, read-only state for every session.
pub struct Proxy {
    settings: ProxySettings,
    allow_list: AllowList,
    metrics: Arc<Metrics>,
}

impl Proxy {
    #[must_use]
    pub fn new(settings: ProxySettings, allow_list: AllowList, metrics: Arc<Metrics>) -> Self {
        Self {
            settings,
            allow_list,
            metrics,
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    #[must_use]
    pub const fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Resolves and authorizes the destination of an upgrade request.
    pub fn admit(&self, request: &Request, remote_addr: SocketAddr) -> Result<Destination, Rejection> {
        let path = request.uri().path();
        if path != self.settings.path {
            return Err(Rejection::UnknownPath(path.to_string()));
        }

        let headers = request.headers();
        let host_header = headers.get(header::HOST).and_then(|v| v.to_str().ok());
        let client_ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_original_client_ip);

        let inputs = DestinationRequest::from_parts(request.uri().query(), host_header);
        let destination = resolve(&inputs, &self.settings.resolve);
        // A fixed Unix socket is chosen by the operator, so there is nothing to authorize.
        let allowed =
            self.settings.resolve.is_fixed() || self.allow_list.is_allowed(&destination.address);

        if self.settings.log_connections {
            info!(
                remote_addr = %remote_addr,
                client_ip = client_ip.as_deref().unwrap_or("-"),
                destination = %destination,
                allowed,
                address_param = inputs.address_param.as_deref().unwrap_or_default(),
                host_header = inputs.host_header.as_deref().unwrap_or_default(),
                "Got request"
            );
        }

        if allowed {
            Ok(destination)
        } else {
            Err(Rejection::NotAllowed(destination))
        }
    }

    /// Runs one client connection from handshake to session teardown.
    #[tracing::instrument(skip(self, stream), fields(tls = stream.is_tls()))]
    pub async fn handle_connection(&self, stream: ClientStream, remote_addr: SocketAddr) -> Result<()> {
        let mut verdict = None;
        let callback = |request: &Request, response: Response| {
            let outcome = self.admit(request, remote_addr);
            let reply = match &outcome {
                Ok(_) => Ok(response),
                Err(rejection) => Err(rejection.to_response()),
            };
            verdict = Some(outcome);
            reply
        };

        let Ok(handshake) = timeout(HANDSHAKE_TIMEOUT, accept_hdr_async(stream, callback)).await
        else {
            warn!(timeout = ?HANDSHAKE_TIMEOUT, "WebSocket handshake timed out");
            return Ok(());
        };
        if let Some(Err(rejection)) = &verdict {
            info!(%rejection, "Rejected upgrade request");
            return Ok(());
        }
        let mut websocket = handshake.context("Failed to perform WebSocket handshake")?;
        let Some(Ok(destination)) = verdict else {
            bail!("WebSocket handshake completed without a destination");
        };

        debug!(%destination, "Connecting to destination");
        let upstream = match destination.connect().await {
            Ok(upstream) => upstream,
            Err(e) => {
                send_close(&mut websocket, CloseCode::Error, "no backend").await;
                return Err(e.context("No backend"));
            }
        };
        info!(%destination, "Connected to destination");

        relay(
            websocket,
            upstream,
            self.settings.relay,
            Arc::clone(&self.metrics),
        )
        .await
        .with_context(|| format!("Session to {destination} failed"))
    }
}

/// Accepts clients forever, one task per connection.
pub async fn serve(listener: TcpListener, tls: Option<TlsAcceptor>, proxy: Arc<Proxy>) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(client_addr = %remote_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let tls = tls.clone();
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let stream = match tls {
                Some(acceptor) => match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(tls_stream)) => ClientStream::Tls(Box::new(tls_stream)),
                    Ok(Err(e)) => {
                        warn!(client_addr = %remote_addr, error = %e, "TLS handshake failed");
                        return;
                    }
                    Err(_) => {
                        warn!(client_addr = %remote_addr, timeout = ?HANDSHAKE_TIMEOUT, "TLS handshake timed out");
                        return;
                    }
                },
                None => ClientStream::Plain(stream),
            };

            if let Err(e) = proxy.handle_connection(stream, remote_addr).await {
                let error = format!("{e:#}");
                error!(client_addr = %remote_addr, error = %error, "Connection failed");
            }
        });
    }
}
