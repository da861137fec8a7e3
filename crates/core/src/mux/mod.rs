//! ADB-Expose Multiplexer (§4.8): exposes local TCP ports to a remote relay
//! over one WebSocket, independent of the scrcpy device path. The
//! WS-reconnect-with-backoff and per-stream credit bookkeeping follow the
//! same single-writer-task + bounded-mailbox shape used for the Source's
//! control-socket writer, scaled up to multiple concurrent streams.

pub mod wire;

use crate::error::CoreError;
use futures_util::{SinkExt, StreamExt};
use scrcpy_protocol::AdbExposeConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use wire::{decode_frame, encode_frame, encode_open, encode_window_update, FrameKind, MuxFrame};

const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const CREDIT_WINDOW_BYTES: i64 = 65_536;
const TCP_READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxStatus {
    Stopped,
    Connecting,
    Running,
}

struct StreamHandle {
    to_tcp: mpsc::Sender<Vec<u8>>,
    credit: Arc<Mutex<i64>>,
    credit_notify: Arc<Notify>,
}

/// Owns zero or one active WebSocket connection to the remote relay and the
/// set of TCP streams multiplexed over it.
pub struct Multiplexer {
    status: RwLock<MuxStatus>,
    shutdown_tx: watch::Sender<bool>,
    streams: Arc<RwLock<HashMap<u32, StreamHandle>>>,
    next_stream_id: AtomicU32,
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Multiplexer {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            status: RwLock::new(MuxStatus::Stopped),
            shutdown_tx,
            streams: Arc::new(RwLock::new(HashMap::new())),
            next_stream_id: AtomicU32::new(1),
        }
    }

    pub async fn status(&self) -> MuxStatus {
        *self.status.read().await
    }

    /// Starts the relay connection and per-port listeners in the
    /// background. Returns once the first connection attempt has been
    /// kicked off; `status()` reports `Connecting` until the handshake
    /// completes.
    pub async fn start(self: &Arc<Self>, config: AdbExposeConfig) -> Result<(), CoreError> {
        if config.local_ports.len() != config.remote_ports.len() {
            return Err(CoreError::ConfigError(
                "local_ports and remote_ports must have equal length".to_string(),
            ));
        }
        *self.status.write().await = MuxStatus::Connecting;

        let this = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            this.run_with_backoff(config, shutdown_rx).await;
        });

        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.streams.write().await.clear();
        *self.status.write().await = MuxStatus::Stopped;
        info!("adb-expose multiplexer stopped");
    }

    async fn run_with_backoff(self: Arc<Self>, config: AdbExposeConfig, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = BACKOFF_FLOOR;
        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            match self.connect_and_run(&config, shutdown_rx.clone()).await {
                Ok(()) => {
                    // Clean shutdown requested; stop reconnecting.
                    return;
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "relay connection lost, reconnecting");
                }
            }

            *self.status.write().await = MuxStatus::Connecting;
            tokio::select! {
                _ = shutdown_rx.changed() => { if *shutdown_rx.borrow() { return; } }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = std::cmp::min(backoff * 2, BACKOFF_CAP);
        }
    }

    async fn connect_and_run(
        self: &Arc<Self>,
        config: &AdbExposeConfig,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), CoreError> {
        let mut request = config
            .ws_url
            .clone()
            .into_client_request()
            .map_err(|e| CoreError::ConfigError(format!("invalid relay URL: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", config.auth_token)
                .parse()
                .map_err(|_| CoreError::ConfigError("auth token is not a valid header value".to_string()))?,
        );

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| CoreError::ConfigError(format!("relay connection failed: {e}")))?;
        info!(ws_url = %config.ws_url, "connected to adb-expose relay");
        *self.status.write().await = MuxStatus::Running;

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(256);

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                if ws_write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let listener_shutdown = shutdown_rx.clone();
        self.spawn_listeners(config, writer_tx.clone(), listener_shutdown);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    writer_task.abort();
                    return Ok(());
                }
                msg = ws_read.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            if let Err(e) = self.handle_inbound_frame(&data, &writer_tx).await {
                                debug!(error = %e, "malformed relay frame, ignoring");
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            writer_task.abort();
                            return Err(CoreError::ConfigError(format!("relay read error: {e}")));
                        }
                        None => {
                            writer_task.abort();
                            return Err(CoreError::ConfigError("relay connection closed".to_string()));
                        }
                    }
                }
            }
        }
    }

    async fn handle_inbound_frame(&self, data: &[u8], writer_tx: &mpsc::Sender<Message>) -> Result<(), CoreError> {
        let frame = decode_frame(data).map_err(|e| CoreError::ConfigError(e.to_string()))?;
        match frame.kind {
            FrameKind::Data => {
                let streams = self.streams.read().await;
                if let Some(handle) = streams.get(&frame.stream_id) {
                    let _ = handle.to_tcp.send(frame.payload).await;
                }
            }
            FrameKind::WindowUpdate => {
                let delta = wire::decode_window_update(&frame).map_err(|e| CoreError::ConfigError(e.to_string()))?;
                let streams = self.streams.read().await;
                if let Some(handle) = streams.get(&frame.stream_id) {
                    *handle.credit.lock().await += delta as i64;
                    handle.credit_notify.notify_waiters();
                }
            }
            FrameKind::Close | FrameKind::Error => {
                self.streams.write().await.remove(&frame.stream_id);
            }
            FrameKind::Open => {
                // Relay-initiated OPEN is not part of this surface: this
                // Multiplexer only exposes locally bound ports outward.
                let _ = writer_tx;
            }
        }
        Ok(())
    }

    fn spawn_listeners(self: &Arc<Self>, config: &AdbExposeConfig, writer_tx: mpsc::Sender<Message>, shutdown_rx: watch::Receiver<bool>) {
        for (&local_port, &remote_port) in config.local_ports.iter().zip(config.remote_ports.iter()) {
            let this = Arc::clone(self);
            let writer_tx = writer_tx.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let listener = match TcpListener::bind(("127.0.0.1", local_port)).await {
                    Ok(l) => l,
                    Err(e) => {
                        warn!(local_port, error = %e, "failed to bind adb-expose listener");
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => return,
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((socket, _addr)) => {
                                    this.accept_stream(socket, remote_port, writer_tx.clone(), shutdown_rx.clone()).await;
                                }
                                Err(e) => warn!(local_port, error = %e, "accept failed"),
                            }
                        }
                    }
                }
            });
        }
    }

    async fn accept_stream(
        self: &Arc<Self>,
        socket: tokio::net::TcpStream,
        remote_port: u16,
        writer_tx: mpsc::Sender<Message>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (to_tcp_tx, mut to_tcp_rx) = mpsc::channel::<Vec<u8>>(64);
        let credit = Arc::new(Mutex::new(CREDIT_WINDOW_BYTES));
        let credit_notify = Arc::new(Notify::new());

        self.streams.write().await.insert(
            stream_id,
            StreamHandle {
                to_tcp: to_tcp_tx,
                credit: Arc::clone(&credit),
                credit_notify: Arc::clone(&credit_notify),
            },
        );

        let open = encode_open(stream_id, remote_port);
        if writer_tx.send(Message::Binary(encode_frame(&open).into())).await.is_err() {
            self.streams.write().await.remove(&stream_id);
            return;
        }

        let (mut read_half, mut write_half) = socket.into_split();
        let streams = Arc::clone(&self.streams);

        let to_tcp_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut shutdown_rx = to_tcp_shutdown;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    chunk = to_tcp_rx.recv() => {
                        let Some(chunk) = chunk else { break };
                        if write_half.write_all(&chunk).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = vec![0u8; TCP_READ_CHUNK];
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    read = read_half.read(&mut buf) => {
                        match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let mut remaining = &buf[..n];
                                while !remaining.is_empty() {
                                    let available = loop {
                                        let available = *credit.lock().await;
                                        if available > 0 {
                                            break available;
                                        }
                                        credit_notify.notified().await;
                                    };
                                    let take = remaining.len().min(available as usize);
                                    let (chunk, rest) = remaining.split_at(take);
                                    remaining = rest;
                                    *credit.lock().await -= chunk.len() as i64;
                                    let data_frame = MuxFrame {
                                        stream_id,
                                        kind: FrameKind::Data,
                                        payload: chunk.to_vec(),
                                    };
                                    if writer_tx.send(Message::Binary(encode_frame(&data_frame).into())).await.is_err() {
                                        streams.write().await.remove(&stream_id);
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
            }

            let close_frame = MuxFrame { stream_id, kind: FrameKind::Close, payload: Vec::new() };
            let _ = writer_tx.send(Message::Binary(encode_frame(&close_frame).into())).await;
            streams.write().await.remove(&stream_id);
        });

        // Top up the peer's view of our receive window immediately so the
        // relay doesn't need to wait for a first DATA frame to learn it.
        let initial_credit = encode_window_update(stream_id, CREDIT_WINDOW_BYTES as u32);
        let _ = writer_tx.send(Message::Binary(encode_frame(&initial_credit).into())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_stopped() {
        let mux = Multiplexer::new();
        assert_eq!(mux.status().await, MuxStatus::Stopped);
    }

    #[tokio::test]
    async fn mismatched_port_lists_are_rejected() {
        let mux = Arc::new(Multiplexer::new());
        let config = AdbExposeConfig {
            box_id: "box-1".to_string(),
            local_ports: vec![1, 2],
            remote_ports: vec![1],
            ws_url: "wss://relay.example/ws".to_string(),
            auth_token: "token".to_string(),
        };
        assert!(mux.start(config).await.is_err());
    }

    #[tokio::test]
    async fn stop_on_never_started_mux_is_a_safe_no_op() {
        let mux = Multiplexer::new();
        mux.stop().await;
        assert_eq!(mux.status().await, MuxStatus::Stopped);
    }
}
