//! Process-wide relay counters and their Prometheus endpoint.

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
};
use std::{
    fmt::Write,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::net::TcpListener;
use tracing::info;

/// Which side of a session produced a chunk of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Read from the WebSocket client, written to the destination.
    Client,
    /// Read from the destination, written to the WebSocket client.
    Destination,
}

impl Source {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Destination => "destination",
        }
    }
}

/// Lock-free counters shared by every session.
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    active_connections: AtomicU64,
    client_bytes: AtomicU64,
    destination_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub active_connections: u64,
    pub client_bytes: u64,
    pub destination_bytes: u64,
}

/// Holds one slot of the active-connection gauge until dropped.
#[must_use = "the session is only counted as active while the guard is alive"]
pub struct ActiveConnection<'a> {
    metrics: &'a Metrics,
}

impl Drop for ActiveConnection<'_> {
    fn drop(&mut self) {
        self.metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a new session and marks it active for the guard's lifetime.
    pub fn connection_opened(&self) -> ActiveConnection<'_> {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ActiveConnection { metrics: self }
    }

    pub fn record_bytes(&self, source: Source, bytes: usize) {
        let counter = match source {
            Source::Client => &self.client_bytes,
            Source::Destination => &self.destination_bytes,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            client_bytes: self.client_bytes.load(Ordering::Relaxed),
            destination_bytes: self.destination_bytes.load(Ordering::Relaxed),
        }
    }

    /// Renders the counters in the Prometheus text exposition format.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut buf = String::new();

        write_header(
            &mut buf,
            "wsproxy_connections_total",
            "The total number of processed connections",
            "counter",
        );
        let _ = writeln!(buf, "wsproxy_connections_total {}", snapshot.connections_total);

        write_header(
            &mut buf,
            "wsproxy_active_connections",
            "The number of active connections",
            "gauge",
        );
        let _ = writeln!(buf, "wsproxy_active_connections {}", snapshot.active_connections);

        write_header(
            &mut buf,
            "wsproxy_bytes_total",
            "The total number of proxied bytes",
            "counter",
        );
        for (source, value) in [
            (Source::Client, snapshot.client_bytes),
            (Source::Destination, snapshot.destination_bytes),
        ] {
            let _ = writeln!(
                buf,
                "wsproxy_bytes_total{{source=\"{}\"}} {value}",
                source.as_str()
            );
        }

        buf
    }
}

fn write_header(buf: &mut String, name: &str, help: &str, metric_type: &str) {
    let _ = writeln!(buf, "# HELP {name} {help}");
    let _ = writeln!(buf, "# TYPE {name} {metric_type}");
}

pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_handler))
        .route("/healthz", get(health_handler))
        .with_state(metrics)
}

async fn prometheus_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics.render_prometheus(),
    )
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Serves `/metrics` and `/healthz` until the listener fails.
pub async fn serve(listener: TcpListener, metrics: Arc<Metrics>) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("Failed to get metrics listener address")?;
    info!(metrics_addr = %addr, "Metrics endpoint listening");

    axum::serve(listener, router(metrics))
        .await
        .context("Metrics server stopped")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    mod counters {
        use super::*;

        #[test]
        fn guard_releases_active_slot() {
            let metrics = Metrics::new();
            {
                let _first = metrics.connection_opened();
                let _second = metrics.connection_opened();
                assert_eq!(metrics.snapshot().active_connections, 2);
            }
            let snapshot = metrics.snapshot();
            assert_eq!(snapshot.active_connections, 0);
            assert_eq!(snapshot.connections_total, 2);
        }

        #[test]
        fn bytes_are_tracked_per_source() {
            let metrics = Metrics::new();
            metrics.record_bytes(Source::Client, 8);
            metrics.record_bytes(Source::Client, 2);
            metrics.record_bytes(Source::Destination, 5);

            let snapshot = metrics.snapshot();
            assert_eq!(snapshot.client_bytes, 10);
            assert_eq!(snapshot.destination_bytes, 5);
        }

        #[test]
        fn concurrent_increments_are_not_lost() {
            let metrics = Arc::new(Metrics::new());
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let metrics = Arc::clone(&metrics);
                    std::thread::spawn(move || {
                        for _ in 0..1000 {
                            let _guard = metrics.connection_opened();
                            metrics.record_bytes(Source::Destination, 1);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let snapshot = metrics.snapshot();
            assert_eq!(snapshot.connections_total, 8000);
            assert_eq!(snapshot.destination_bytes, 8000);
            assert_eq!(snapshot.active_connections, 0);
        }

        #[test]
        fn renders_prometheus_text() {
            let metrics = Metrics::new();
            let _active = metrics.connection_opened();
            metrics.record_bytes(Source::Client, 42);

            let text = metrics.render_prometheus();
            assert!(text.contains("# TYPE wsproxy_connections_total counter"));
            assert!(text.contains("wsproxy_connections_total 1\n"));
            assert!(text.contains("# TYPE wsproxy_active_connections gauge"));
            assert!(text.contains("wsproxy_active_connections 1\n"));
            assert!(text.contains("wsproxy_bytes_total{source=\"client\"} 42\n"));
            assert!(text.contains("wsproxy_bytes_total{source=\"destination\"} 0\n"));
        }
    }

    mod endpoint {
        use super::*;

        #[tokio::test]
        async fn serves_metrics() {
            let metrics = Arc::new(Metrics::new());
            metrics.record_bytes(Source::Destination, 7);

            let response = router(Arc::clone(&metrics))
                .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let text = String::from_utf8(body.to_vec()).unwrap();
            assert!(text.contains("wsproxy_bytes_total{source=\"destination\"} 7"));
        }

        #[tokio::test]
        async fn serves_health() {
            let response = router(Arc::new(Metrics::new()))
                .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&body[..], b"ok");
        }

        #[tokio::test]
        async fn unknown_route_is_not_found() {
            let response = router(Arc::new(Metrics::new()))
                .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }
}
