//! Bidirectional relay between one upgraded WebSocket and one byte stream.
//!
//! The downstream loop (destination to client) runs as a spawned task; the
//! upstream loop (client to destination) runs inline. A shared cancellation
//! token ties them together: whichever loop finishes first stops the other,
//! and [`relay`] returns only after both have finished.

use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use futures_util::{
    Sink, SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::{
    future::Future,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::{Instant, timeout, timeout_at},
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Error as TungsteniteError, Message, Utf8Bytes,
        error::ProtocolError,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::{Metrics, Source};

/// Largest chunk read from the destination; each read becomes one message.
pub const BUFFER_SIZE: usize = 32 * 1024;
/// Deadline for best-effort close frames.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

const CLOSE_REASON: &str = "Connection is closed";

#[derive(Debug, Clone, Copy, Default)]
pub struct RelayOptions {
    /// Log every relayed payload, base64 encoded.
    pub log_traffic: bool,
    /// Ends the session once no bytes have moved in either direction for this long.
    pub idle_timeout: Option<Duration>,
}

/// Last time either direction of a session carried data.
#[derive(Debug)]
struct IdleClock {
    origin: Instant,
    last_activity_ms: AtomicU64,
}

impl IdleClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn deadline(&self, limit: Duration) -> Instant {
        self.origin + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed)) + limit
    }

    fn expired(&self, limit: Duration) -> bool {
        self.deadline(limit) <= Instant::now()
    }
}

type WsSender<S> = SplitSink<WebSocketStream<S>, Message>;
type WsReceiver<S> = SplitStream<WebSocketStream<S>>;

/// Relays one session until either side finishes.
///
/// Returns the upstream loop's terminal error, if any. Downstream failures
/// are logged but do not fail the session.
pub async fn relay<S, U>(
    websocket: WebSocketStream<S>,
    upstream: U,
    options: RelayOptions,
    metrics: Arc<Metrics>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let _active = metrics.connection_opened();

    let (ws_sender, mut ws_receiver) = websocket.split();
    let (upstream_reader, mut upstream_writer) = tokio::io::split(upstream);
    let shutdown = CancellationToken::new();
    let _stop_downstream = shutdown.clone().drop_guard();
    let clock = Arc::new(IdleClock::new());

    let downstream = tokio::spawn(downstream_loop(
        upstream_reader,
        ws_sender,
        options,
        Arc::clone(&metrics),
        Arc::clone(&clock),
        shutdown.clone(),
    ));

    let result = upstream_loop(
        &mut ws_receiver,
        &mut upstream_writer,
        options,
        &metrics,
        &clock,
        &shutdown,
    )
    .await;
    shutdown.cancel();

    match downstream.await {
        Ok(mut ws_sender) => {
            if let Ok(Err(e)) = timeout(CLOSE_TIMEOUT, ws_sender.close()).await {
                debug!(error = %e, "WebSocket already closed");
            }
        }
        Err(e) => error!(error = %e, "Downstream task failed"),
    }

    if let Err(e) = upstream_writer.shutdown().await {
        debug!(error = %e, "Destination already closed");
    }

    debug!("Proxy connection closed");
    result
}

/// Destination to client. Returns the WebSocket sink so the caller can close it.
async fn downstream_loop<R, S>(
    mut reader: R,
    mut ws_sender: WsSender<S>,
    options: RelayOptions,
    metrics: Arc<Metrics>,
    clock: Arc<IdleClock>,
    shutdown: CancellationToken,
) -> WsSender<S>
where
    R: AsyncRead + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _stop_upstream = shutdown.clone().drop_guard();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            () = shutdown.cancelled() => break,
            read = idle_bounded(options.idle_timeout, &clock, reader.read(&mut buffer)) => read,
        };

        let n = match read {
            None if session_idle(options.idle_timeout, &clock) => {
                warn!(idle_timeout = ?options.idle_timeout, "Session idle timeout elapsed");
                break;
            }
            None => continue,
            Some(Ok(0)) => {
                debug!("Destination closed the connection");
                send_close(&mut ws_sender, CloseCode::Normal, CLOSE_REASON).await;
                break;
            }
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    error!(error = %e, "Failed to read from destination");
                }
                break;
            }
        };

        let data = &buffer[..n];
        clock.touch();
        metrics.record_bytes(Source::Destination, n);
        if options.log_traffic {
            info!(bytes = n, payload = %BASE64.encode(data), "destination -> client");
        } else {
            debug!(bytes = n, "Forwarding data from destination to WebSocket");
        }

        if let Err(e) = ws_sender.send(Message::Binary(data.to_vec().into())).await {
            error!(error = %e, bytes = n, "Failed to send WebSocket message");
            break;
        }
    }

    ws_sender
}

/// Client to destination. A write failure is the session's terminal error.
async fn upstream_loop<S, W>(
    ws_receiver: &mut WsReceiver<S>,
    writer: &mut W,
    options: RelayOptions,
    metrics: &Metrics,
    clock: &IdleClock,
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            next = idle_bounded(options.idle_timeout, clock, ws_receiver.next()) => next,
        };

        let message = match next {
            None if session_idle(options.idle_timeout, clock) => {
                warn!(idle_timeout = ?options.idle_timeout, "Session idle timeout elapsed");
                return Ok(());
            }
            None => continue,
            Some(None) => {
                debug!("WebSocket stream ended");
                return Ok(());
            }
            Some(Some(Err(e))) => {
                log_receive_error(&e);
                return Ok(());
            }
            Some(Some(Ok(message))) => message,
        };
        clock.touch();

        let data: &[u8] = match &message {
            Message::Binary(data) => &data[..],
            Message::Text(text) => text.as_str().as_bytes(),
            Message::Close(frame) => {
                log_client_close(frame.as_ref());
                return Ok(());
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        metrics.record_bytes(Source::Client, data.len());
        if options.log_traffic {
            info!(bytes = data.len(), payload = %BASE64.encode(data), "client -> destination");
        } else {
            debug!(bytes = data.len(), "Forwarding data from WebSocket to destination");
        }

        writer
            .write_all(data)
            .await
            .with_context(|| format!("Failed to write {} bytes to destination", data.len()))?;
        writer
            .flush()
            .await
            .context("Failed to flush destination connection")?;
    }
}

/// Awaits `future` until the session has been idle for `limit`, when one is set.
/// The other direction may have moved data meanwhile, so callers re-check
/// [`session_idle`] before ending the session.
async fn idle_bounded<F: Future>(
    limit: Option<Duration>,
    clock: &IdleClock,
    future: F,
) -> Option<F::Output> {
    match limit {
        Some(limit) => timeout_at(clock.deadline(limit), future).await.ok(),
        None => Some(future.await),
    }
}

fn session_idle(limit: Option<Duration>, clock: &IdleClock) -> bool {
    limit.is_some_and(|limit| clock.expired(limit))
}

/// Sends a close frame without letting a stuck peer hold the session open.
pub(crate) async fn send_close<T>(sink: &mut T, code: CloseCode, reason: &'static str)
where
    T: Sink<Message, Error = TungsteniteError> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    };
    match timeout(CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await {
        Ok(Ok(())) => debug!(%code, "Sent close frame"),
        Ok(Err(e)) => warn!(error = %e, "Failed to send close frame"),
        Err(_) => warn!("Timed out sending close frame"),
    }
}

const fn is_expected_close(code: CloseCode) -> bool {
    matches!(
        code,
        CloseCode::Normal | CloseCode::Away | CloseCode::Abnormal
    )
}

fn log_client_close(frame: Option<&CloseFrame>) {
    match frame {
        Some(frame) if !is_expected_close(frame.code) => {
            warn!(code = %frame.code, reason = %frame.reason, "Unexpected WebSocket close");
        }
        Some(frame) => debug!(code = %frame.code, "WebSocket closed by client"),
        None => debug!("WebSocket closed by client"),
    }
}

fn log_receive_error(error: &TungsteniteError) {
    match error {
        TungsteniteError::ConnectionClosed
        | TungsteniteError::AlreadyClosed
        | TungsteniteError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            debug!("Client disconnected: {error}");
        }
        TungsteniteError::Io(e)
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) =>
        {
            debug!("Client disconnected: {error}");
        }
        _ => warn!(error = %error, "WebSocket error"),
    }
}
