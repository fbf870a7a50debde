//! WebSocket store client.
//!
//! [`RemoteStore`] implements [`ObjectStore`] and [`PresenceStore`] against a
//! [`crate::server::StoreServer`], so a [`crate::Workspace`] runs unchanged
//! over the network. Change frames pushed by the server are re-broadcast
//! locally in arrival order.
//!
//! There is no automatic reconnection: once the socket drops, pending and
//! later requests fail with [`StoreError::ConnectionClosed`] and the change
//! feeds close.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::StoreError;
use crate::object::{ClientId, EditableObject, ObjectId, ObjectState, PeerInfo};
use crate::presence::PresenceRecord;
use crate::protocol::{mismatch, Frame, Request, Response};
use crate::store::{
    ChangeFeed, CommitOutcome, CommitRequest, DeleteOutcome, LockOutcome, ObjectChange, ObjectStore,
    PresenceChange, PresenceFeed, PresenceStore,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// State shared with the socket tasks.
struct Shared {
    state: RwLock<ConnectionState>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    changes: Mutex<Option<broadcast::Sender<ObjectChange>>>,
    presence: Mutex<Option<broadcast::Sender<PresenceChange>>>,
}

impl Shared {
    /// Fail everything in flight and close the local feeds.
    fn close(&self) {
        let mut pending = self.pending.lock();
        *self.state.write() = ConnectionState::Disconnected;
        pending.clear();
        drop(pending);
        self.changes.lock().take();
        self.presence.lock().take();
    }

    fn route(&self, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::Response { seq, body } => {
                match self.pending.lock().remove(&seq) {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => log::debug!("Late response for request {seq}"),
                }
                None
            }
            Frame::ObjectChange(change) => {
                if let Some(tx) = self.changes.lock().as_ref() {
                    let _ = tx.send(change);
                }
                None
            }
            Frame::PresenceChange(change) => {
                if let Some(tx) = self.presence.lock().as_ref() {
                    let _ = tx.send(change);
                }
                None
            }
            Frame::Ping => Some(Frame::Pong),
            Frame::Pong => None,
            Frame::Request { seq, .. } => {
                log::warn!("Server sent a request ({seq}); ignoring");
                None
            }
        }
    }
}

/// A store reached over a WebSocket.
pub struct RemoteStore {
    url: String,
    request_timeout: Duration,
    next_seq: AtomicU64,
    outgoing: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteStore {
    /// Connect to `url` (e.g. `ws://127.0.0.1:9090`).
    ///
    /// `request_timeout` bounds every individual request.
    pub async fn connect(url: impl Into<String>, request_timeout: Duration) -> Result<Self, StoreError> {
        let url = url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::info!("Connected to store at {url}");

        let (changes, _) = broadcast::channel(256);
        let (presence, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            state: RwLock::new(ConnectionState::Connected),
            pending: Mutex::new(HashMap::new()),
            changes: Mutex::new(Some(changes)),
            presence: Mutex::new(Some(presence)),
        });

        // Writer task: forward outgoing frames to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let encoded = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route responses and re-broadcast changes
        let reader_shared = shared.clone();
        let reply_tx = out_tx.clone();
        let reader_url = url.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match Frame::decode(&data) {
                        Ok(frame) => {
                            if let Some(reply) = reader_shared.route(frame) {
                                let _ = reply_tx.try_send(reply);
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from {reader_url}: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Connection to {reader_url} failed: {e}");
                        break;
                    }
                }
            }
            log::info!("Disconnected from store at {reader_url}");
            reader_shared.close();
        });

        Ok(Self {
            url,
            request_timeout,
            next_seq: AtomicU64::new(1),
            outgoing: out_tx,
            shared,
            tasks: Mutex::new(vec![reader, writer]),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Drop the connection. Pending requests fail with `ConnectionClosed`.
    pub fn disconnect(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.close();
    }

    /// Send a ping; the server answers with a pong frame.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.outgoing
            .send(Frame::Ping)
            .await
            .map_err(|_| StoreError::ConnectionClosed)
    }

    async fn request(&self, body: Request) -> Result<Response, StoreError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let kind = body.kind();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if *self.shared.state.read() != ConnectionState::Connected {
                return Err(StoreError::ConnectionClosed);
            }
            pending.insert(seq, tx);
        }

        if self.outgoing.send(Frame::Request { seq, body }).await.is_err() {
            self.shared.pending.lock().remove(&seq);
            return Err(StoreError::ConnectionClosed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(StoreError::ConnectionClosed),
            Err(_) => {
                self.shared.pending.lock().remove(&seq);
                log::debug!("Request {seq} ({kind}) timed out");
                Err(StoreError::Timeout)
            }
        }
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn closed_feed<T: Clone>() -> broadcast::Receiver<T> {
    let (_, rx) = broadcast::channel(1);
    rx
}

#[async_trait]
impl ObjectStore for RemoteStore {
    async fn create(&self, creator: &PeerInfo, state: ObjectState) -> Result<EditableObject, StoreError> {
        match self.request(Request::Create { creator: creator.clone(), state }).await? {
            Response::Object(obj) => Ok(obj),
            other => Err(mismatch("object", &other)),
        }
    }

    async fn get(&self, id: ObjectId) -> Result<Option<EditableObject>, StoreError> {
        match self.request(Request::Get { id }).await? {
            Response::MaybeObject(obj) => Ok(obj),
            other => Err(mismatch("object", &other)),
        }
    }

    async fn list(&self) -> Result<Vec<EditableObject>, StoreError> {
        match self.request(Request::List).await? {
            Response::Objects(objects) => Ok(objects),
            other => Err(mismatch("objects", &other)),
        }
    }

    async fn try_lock(&self, id: ObjectId, holder: &PeerInfo) -> Result<LockOutcome, StoreError> {
        let request = Request::TryLock { id, holder: holder.clone() };
        match self.request(request).await? {
            Response::Lock(outcome) => Ok(outcome),
            other => Err(mismatch("lock", &other)),
        }
    }

    async fn renew_lock(&self, id: ObjectId, holder: &PeerInfo) -> Result<LockOutcome, StoreError> {
        let request = Request::RenewLock { id, holder: holder.clone() };
        match self.request(request).await? {
            Response::Lock(outcome) => Ok(outcome),
            other => Err(mismatch("lock", &other)),
        }
    }

    async fn unlock(&self, id: ObjectId, holder: ClientId) -> Result<bool, StoreError> {
        match self.request(Request::Unlock { id, holder }).await? {
            Response::Bool(released) => Ok(released),
            other => Err(mismatch("bool", &other)),
        }
    }

    async fn commit(&self, request: CommitRequest) -> Result<CommitOutcome, StoreError> {
        match self.request(Request::Commit { request }).await? {
            Response::Commit(outcome) => Ok(outcome),
            other => Err(mismatch("commit", &other)),
        }
    }

    async fn delete(&self, id: ObjectId, client: ClientId) -> Result<DeleteOutcome, StoreError> {
        match self.request(Request::Delete { id, client }).await? {
            Response::Delete(outcome) => Ok(outcome),
            other => Err(mismatch("delete", &other)),
        }
    }

    fn subscribe(&self) -> ChangeFeed {
        match self.shared.changes.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => closed_feed(),
        }
    }
}

#[async_trait]
impl PresenceStore for RemoteStore {
    async fn put_presence(&self, record: PresenceRecord) -> Result<(), StoreError> {
        match self.request(Request::PutPresence(record)).await? {
            Response::Unit => Ok(()),
            other => Err(mismatch("unit", &other)),
        }
    }

    async fn remove_presence(&self, client_id: ClientId, stale_before: Option<u64>) -> Result<bool, StoreError> {
        match self.request(Request::RemovePresence { client_id, stale_before }).await? {
            Response::Bool(removed) => Ok(removed),
            other => Err(mismatch("bool", &other)),
        }
    }

    async fn list_presence(&self) -> Result<Vec<PresenceRecord>, StoreError> {
        match self.request(Request::ListPresence).await? {
            Response::Presence(records) => Ok(records),
            other => Err(mismatch("presence", &other)),
        }
    }

    fn subscribe_presence(&self) -> PresenceFeed {
        match self.shared.presence.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => closed_feed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn shared() -> Shared {
        let (changes, _) = broadcast::channel(8);
        let (presence, _) = broadcast::channel(8);
        Shared {
            state: RwLock::new(ConnectionState::Connected),
            pending: Mutex::new(HashMap::new()),
            changes: Mutex::new(Some(changes)),
            presence: Mutex::new(Some(presence)),
        }
    }

    #[test]
    fn test_route_response_to_pending() {
        let shared = shared();
        let (tx, mut rx) = oneshot::channel();
        shared.pending.lock().insert(3, tx);

        assert!(shared.route(Frame::Response { seq: 3, body: Response::Bool(true) }).is_none());
        assert_eq!(rx.try_recv().unwrap(), Response::Bool(true));
        assert!(shared.pending.lock().is_empty());
    }

    #[test]
    fn test_route_answers_ping() {
        assert_eq!(shared().route(Frame::Ping), Some(Frame::Pong));
    }

    #[test]
    fn test_route_rebroadcasts_changes() {
        let shared = shared();
        let mut feed = shared.changes.lock().as_ref().unwrap().subscribe();
        let change = ObjectChange::Deleted { id: uuid::Uuid::new_v4() };
        shared.route(Frame::ObjectChange(change.clone()));
        assert_eq!(feed.try_recv().unwrap(), change);
    }

    #[test]
    fn test_close_fails_pending_and_closes_feeds() {
        let shared = shared();
        let mut feed = shared.changes.lock().as_ref().unwrap().subscribe();
        let (tx, mut rx) = oneshot::channel();
        shared.pending.lock().insert(1, tx);

        shared.close();

        assert_eq!(*shared.state.read(), ConnectionState::Disconnected);
        assert!(rx.try_recv().is_err());
        assert_eq!(feed.try_recv(), Err(TryRecvError::Closed));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let result = RemoteStore::connect("ws://127.0.0.1:1", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(StoreError::Transport(_))));
    }
}
