//! WebSocket store server.
//!
//! Exposes one shared backend (in-memory or RocksDB) to many remote
//! workspaces. Conditional writes are decided by the backend, so the server
//! itself is stateless apart from its per-connection change forwarding.
//!
//! ```text
//! RemoteStore A ──┐                      ┌── ObjectChange ──► A, B, C
//!                 ├── StoreServer ── Backend
//! RemoteStore B ──┘        │             └── PresenceChange ─► A, B, C
//!                          └── Request/Response (matched by seq)
//! ```

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::config::LeasePolicy;
use crate::error::ConfigError;
use crate::error::StoreError;
use crate::protocol::{Frame, Request, Response};
use crate::store::{ObjectStore, PresenceStore};

/// Anything that can serve both object and presence requests.
pub trait Backend: ObjectStore + PresenceStore {}

impl<T: ObjectStore + PresenceStore + ?Sized> Backend for T {}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outgoing frame queue per connection
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Fsync every RocksDB write
    pub sync_writes: bool,
    /// Lease TTL and delete policy of the backend this process opens
    pub lease: LeasePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
            sync_writes: false,
            lease: LeasePolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid("server.broadcast_capacity must be > 0".into()));
        }
        self.lease.validate()
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub requests: u64,
    pub failed_requests: u64,
    pub changes_forwarded: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    requests: AtomicU64,
    failed_requests: AtomicU64,
    changes_forwarded: AtomicU64,
    bytes_received: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            changes_forwarded: self.changes_forwarded.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// The store server.
pub struct StoreServer {
    config: ServerConfig,
    backend: Arc<dyn Backend>,
    counters: Arc<Counters>,
}

impl StoreServer {
    pub fn new(config: ServerConfig, backend: Arc<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            config,
            backend,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> ServerStats {
        self.counters.snapshot()
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<(), StoreError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        log::info!("Store server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), StoreError> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| StoreError::Transport(e.to_string()))?;
            log::debug!("New TCP connection from {addr}");

            let this = self.clone();
            tokio::spawn(async move {
                this.counters.total_connections.fetch_add(1, Ordering::Relaxed);
                this.counters.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = this.handle_connection(stream, addr).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
                this.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
                log::info!("Connection from {addr} closed");
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), StoreError> {
        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Subscribe before the first request is read so nothing a client
        // lists can be missed on its feed.
        let mut changes = self.backend.subscribe();
        let mut presence = self.backend.subscribe_presence();

        log::info!("WebSocket connection established from {addr}");

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(self.config.broadcast_capacity.max(1));
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let encoded = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if ws_sender.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            self.counters.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
                            match Frame::decode(&data) {
                                Ok(Frame::Request { seq, body }) => self.spawn_request(seq, body, out_tx.clone()),
                                Ok(Frame::Ping) => {
                                    if out_tx.send(Frame::Pong).await.is_err() {
                                        break Ok(());
                                    }
                                }
                                Ok(other) => log::debug!("Ignoring unexpected frame from {addr}: {other:?}"),
                                Err(e) => log::warn!("Undecodable frame from {addr}: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(StoreError::Transport(e.to_string())),
                    }
                }

                change = changes.recv() => {
                    match change {
                        Ok(change) => {
                            self.counters.changes_forwarded.fetch_add(1, Ordering::Relaxed);
                            if out_tx.send(Frame::ObjectChange(change)).await.is_err() {
                                break Ok(());
                            }
                        }
                        // A gap in the feed would silently desync the client.
                        Err(RecvError::Lagged(skipped)) => {
                            break Err(StoreError::Transport(format!("change feed lagged by {skipped}")));
                        }
                        Err(RecvError::Closed) => break Ok(()),
                    }
                }

                change = presence.recv() => {
                    match change {
                        Ok(change) => {
                            if out_tx.send(Frame::PresenceChange(change)).await.is_err() {
                                break Ok(());
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            log::debug!("Presence feed for {addr} skipped {skipped} update(s)");
                        }
                        Err(RecvError::Closed) => break Ok(()),
                    }
                }
            }
        };

        drop(out_tx);
        let _ = writer.await;
        result
    }

    fn spawn_request(&self, seq: u64, body: Request, out_tx: mpsc::Sender<Frame>) {
        let backend = self.backend.clone();
        let counters = self.counters.clone();
        tokio::spawn(async move {
            counters.requests.fetch_add(1, Ordering::Relaxed);
            let kind = body.kind();
            let response = dispatch(backend.as_ref(), body).await;
            if let Response::Error(message) = &response {
                counters.failed_requests.fetch_add(1, Ordering::Relaxed);
                log::warn!("Request {seq} ({kind}) failed: {message}");
            }
            let _ = out_tx.send(Frame::Response { seq, body: response }).await;
        });
    }
}

/// Run one request against the backend.
pub async fn dispatch(backend: &dyn Backend, request: Request) -> Response {
    let result = match request {
        Request::Create { creator, state } => backend.create(&creator, state).await.map(Response::Object),
        Request::Get { id } => backend.get(id).await.map(Response::MaybeObject),
        Request::List => backend.list().await.map(Response::Objects),
        Request::TryLock { id, holder } => backend.try_lock(id, &holder).await.map(Response::Lock),
        Request::RenewLock { id, holder } => backend.renew_lock(id, &holder).await.map(Response::Lock),
        Request::Unlock { id, holder } => backend.unlock(id, holder).await.map(Response::Bool),
        Request::Commit { request } => backend.commit(request).await.map(Response::Commit),
        Request::Delete { id, client } => backend.delete(id, client).await.map(Response::Delete),
        Request::PutPresence(record) => backend.put_presence(record).await.map(|()| Response::Unit),
        Request::RemovePresence { client_id, stale_before } => backend
            .remove_presence(client_id, stale_before)
            .await
            .map(Response::Bool),
        Request::ListPresence => backend.list_presence().await.map(Response::Presence),
    };
    result.unwrap_or_else(|e| Response::Error(e.to_string()))
}
