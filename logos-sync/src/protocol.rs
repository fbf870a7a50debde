//! Binary wire protocol between [`crate::client::RemoteStore`] and
//! [`crate::server::StoreServer`].
//!
//! Every WebSocket binary message carries one bincode-encoded [`Frame`].
//! Requests are matched to responses by `seq`; change frames are pushed
//! unsolicited in store order.
//!
//! ```text
//! client                         server
//!   │ Request{seq: 7, TryLock}  ──►│
//!   │◄── ObjectChange(LockChanged) │  (fan-out to every connection)
//!   │◄── Response{seq: 7, Lock}    │
//! ```

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::object::{ClientId, EditableObject, ObjectId, ObjectState, PeerInfo};
use crate::presence::PresenceRecord;
use crate::store::{CommitOutcome, CommitRequest, DeleteOutcome, LockOutcome, ObjectChange, PresenceChange};

/// One store operation. Mirrors [`crate::store::ObjectStore`] and
/// [`crate::store::PresenceStore`] one-to-one. Lease TTL and delete policy
/// are server configuration and never travel with a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Create { creator: PeerInfo, state: ObjectState },
    Get { id: ObjectId },
    List,
    TryLock { id: ObjectId, holder: PeerInfo },
    RenewLock { id: ObjectId, holder: PeerInfo },
    Unlock { id: ObjectId, holder: ClientId },
    Commit { request: CommitRequest },
    Delete { id: ObjectId, client: ClientId },
    PutPresence(PresenceRecord),
    RemovePresence { client_id: ClientId, stale_before: Option<u64> },
    ListPresence,
}

impl Request {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Create { .. } => "create",
            Request::Get { .. } => "get",
            Request::List => "list",
            Request::TryLock { .. } => "try_lock",
            Request::RenewLock { .. } => "renew_lock",
            Request::Unlock { .. } => "unlock",
            Request::Commit { .. } => "commit",
            Request::Delete { .. } => "delete",
            Request::PutPresence(_) => "put_presence",
            Request::RemovePresence { .. } => "remove_presence",
            Request::ListPresence => "list_presence",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Object(EditableObject),
    MaybeObject(Option<EditableObject>),
    Objects(Vec<EditableObject>),
    Lock(LockOutcome),
    Bool(bool),
    Commit(CommitOutcome),
    Delete(DeleteOutcome),
    Unit,
    Presence(Vec<PresenceRecord>),
    /// The backend failed; carries its message.
    Error(String),
}

/// Top-level message on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Request { seq: u64, body: Request },
    Response { seq: u64, body: Response },
    ObjectChange(ObjectChange),
    PresenceChange(PresenceChange),
    Ping,
    Pong,
}

impl Frame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Unexpected response shape for a request.
pub(crate) fn mismatch(expected: &str, got: &Response) -> StoreError {
    match got {
        Response::Error(message) => StoreError::Remote(message.clone()),
        other => StoreError::Transport(format!("expected {expected} response, got {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{LockLease, ObjectPatch, Vec2};
    use std::time::Duration;

    #[test]
    fn test_commit_request_survives_the_wire() {
        let alice = PeerInfo::new("Alice");
        let frame = Frame::Request {
            seq: 42,
            body: Request::Commit {
                request: CommitRequest {
                    id: uuid::Uuid::new_v4(),
                    client: alice.peer_id,
                    base_version: 7,
                    patch: ObjectPatch::move_to(3.5, -1.0),
                },
            },
        };

        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_lock_change_frame_is_compact() {
        let bob = PeerInfo::new("Bob");
        let frame = Frame::ObjectChange(ObjectChange::LockChanged {
            id: uuid::Uuid::new_v4(),
            lock: Some(LockLease::new(&bob, 1_700_000_000_000, Duration::from_secs(30))),
        });
        let encoded = frame.encode().unwrap();
        assert!(encoded.len() < 96, "lock change took {} bytes", encoded.len());
    }

    #[test]
    fn test_presence_record_frame() {
        let carol = PeerInfo::new("Carol");
        let record = PresenceRecord::new(&carol, Vec2::new(10.0, 20.0), 99);
        let frame = Frame::Request { seq: 1, body: Request::PutPresence(record.clone()) };
        match Frame::decode(&frame.encode().unwrap()).unwrap() {
            Frame::Request { body: Request::PutPresence(decoded), .. } => assert_eq!(decoded, record),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(Frame::decode(&garbage), Err(StoreError::Serialization(_))));
    }

    #[test]
    fn test_error_response_maps_to_remote() {
        let err = mismatch("lock", &Response::Error("disk full".into()));
        assert_eq!(err, StoreError::Remote("disk full".into()));
        let err = mismatch("lock", &Response::Unit);
        assert!(matches!(err, StoreError::Transport(_)));
    }
}
