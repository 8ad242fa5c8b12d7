use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wsproxy::{AllowList, Metrics, Proxy, ProxySettings, load_config, load_tls_acceptor, metrics};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    let allow_list = AllowList::from_config(
        config.destination.allow_addr_regex.as_deref(),
        &config.destination.allow_addr_suffixes,
    )?;
    let settings = ProxySettings::from_config(&config);

    if allow_list.is_open() && !settings.resolve.is_fixed() {
        warn!("No allow-list configured, any destination address will be proxied");
    }

    info!(
        listen_addr = %config.listen_addr(),
        listen_path = %settings.path,
        metrics_addr = %config.metrics_addr(),
        tls = config.listen.tls.is_some(),
        allow_list = %allow_list,
        use_host_header = settings.resolve.use_host_header,
        append_port = %settings.resolve.append_port,
        unix_socket_path = settings.resolve.unix_socket_path.as_deref().unwrap_or("-"),
        idle_timeout = ?settings.relay.idle_timeout,
        log_traffic = settings.relay.log_traffic,
        log_connections = settings.log_connections,
        "Configuration loaded"
    );

    let metrics = Arc::new(Metrics::new());
    let metrics_addr = config.metrics_addr();
    let metrics_listener = TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("Failed to bind metrics endpoint to {metrics_addr}"))?;
    let metrics_server = metrics::serve(metrics_listener, Arc::clone(&metrics));
    tokio::spawn(async move {
        if let Err(e) = metrics_server.await {
            error!(error = %format!("{e:#}"), "Metrics endpoint failed");
        }
    });

    let tls_acceptor = match &config.listen.tls {
        Some(tls_config) => Some(load_tls_acceptor(tls_config)?),
        None => None,
    };

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;
    info!(
        listen_addr = %addr,
        tls = tls_acceptor.is_some(),
        "WebSocket proxy listening"
    );

    let proxy = Arc::new(Proxy::new(settings, allow_list, metrics));
    tokio::select! {
        () = wsproxy::serve(listener, tls_acceptor, proxy) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
