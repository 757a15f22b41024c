//! WebSocket session lifecycle: one connected peer from upgrade through
//! disconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use metawire_protocol::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use metawire_protocol::protocol::Frame;
use metawire_protocol::{Outbound, Protocol, Transport, WsTransport};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Per-connection WebSocket settings.
#[derive(Clone, Copy, Debug)]
pub struct WsSettings {
    /// Outbound frames queued before senders wait.
    pub outbound_queue: usize,
    /// Interval between server-initiated Ping frames.
    pub heartbeat_interval: Duration,
    /// Silence after which the peer is considered dead.
    pub heartbeat_timeout: Duration,
}

/// Time since the peer was last heard from.
#[derive(Debug)]
pub struct Liveness {
    started: Instant,
    last_seen_ms: AtomicU64,
}

impl Liveness {
    /// Peer considered seen now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    /// Record any inbound frame.
    pub fn touch(&self) {
        let now = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_seen_ms.store(now, Ordering::Relaxed);
    }

    /// How long the peer has been silent.
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a WebSocket session for a connected peer.
///
/// 1. Registers a client with a WebSocket transport
/// 2. Forwards queued outbound frames and sends periodic Pings
/// 3. Hands inbound text and binary frames to the engine
/// 4. Closes when the peer leaves, stops answering, or the engine asks
/// 5. Releases the client
#[instrument(skip_all, fields(client = %address))]
pub async fn run_ws_session(
    socket: WebSocket,
    protocol: Arc<Protocol>,
    address: String,
    settings: WsSettings,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Outbound>(settings.outbound_queue.max(1));

    let transport = WsTransport::new(&address, send_tx);
    let close_requested = transport.close_requested();
    let client = protocol.create_client(Transport::Ws(transport));
    let liveness = Arc::new(Liveness::new());
    let done = CancellationToken::new();
    let connected_at = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!("client connected");

    let writer = {
        let liveness = Arc::clone(&liveness);
        let done = done.clone();
        tokio::spawn(async move {
            let mut ping_interval = tokio::time::interval(settings.heartbeat_interval);
            // Skip the immediate first tick
            let _ = ping_interval.tick().await;

            loop {
                tokio::select! {
                    frame = send_rx.recv() => {
                        let message = match frame {
                            Some(Outbound::Text(text)) => Message::Text(text.into()),
                            Some(Outbound::Binary(data)) => Message::Binary(data),
                            None => break,
                        };
                        if ws_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    _ = ping_interval.tick() => {
                        if liveness.idle() > settings.heartbeat_timeout {
                            warn!("client unresponsive for {:?}, disconnecting", settings.heartbeat_timeout);
                            break;
                        }
                        if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                            break;
                        }
                    }
                    () = close_requested.cancelled() => {
                        debug!("close requested");
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            done.cancel();
        })
    };

    loop {
        let message = tokio::select! {
            message = ws_rx.next() => message,
            () = done.cancelled() => break,
        };
        let Some(Ok(message)) = message else {
            break;
        };
        liveness.touch();
        let frame = match message {
            Message::Text(text) => Frame::Text(Bytes::copy_from_slice(text.as_str().as_bytes())),
            Message::Binary(data) => Frame::Binary(data),
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        // A full outbound queue parks the reader here; stop once the writer is gone.
        tokio::select! {
            () = protocol.handle_ws_message(&client, frame) => {}
            () = done.cancelled() => break,
        }
    }

    let lifetime = connected_at.elapsed();
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(lifetime.as_secs_f64());
    info!(duration_secs = lifetime.as_secs(), "client disconnected");
    protocol.release_client(&client);
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_liveness_is_not_idle_long() {
        let liveness = Liveness::new();
        assert!(liveness.idle() < Duration::from_secs(1));
    }

    #[test]
    fn touch_resets_idle() {
        let liveness = Liveness::new();
        std::thread::sleep(Duration::from_millis(30));
        assert!(liveness.idle() >= Duration::from_millis(30));
        liveness.touch();
        assert!(liveness.idle() < Duration::from_millis(30));
    }
}
