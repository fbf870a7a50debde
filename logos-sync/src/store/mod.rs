//! Object Store Client abstraction.
//!
//! The store is the single shared mutable resource. Every conditional write
//! (acquire, renew, release, commit, delete) is decided by [`rules`] inside
//! the backend's critical section, so exactly one of several racing callers
//! can win. Lease TTL and delete policy belong to the backend
//! ([`LeasePolicy`]); callers only say who they are.
//!
//! ```text
//!             ┌──────────────┐   ObjectChange / PresenceChange
//!  Workspace ─┤ ObjectStore  ├──────────────► broadcast subscribers
//!             │ PresenceStore│
//!             └──────┬───────┘
//!        ┌───────────┼─────────────┐
//!        ▼           ▼             ▼
//!   MemoryStore  RocksStore   RemoteStore (WebSocket → StoreServer)
//! ```

pub mod memory;
pub mod rocks;
pub mod rules;

pub use memory::{MemoryStore, StoreStats};
pub use rocks::{RocksStore, RocksStoreConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use crate::config::LeasePolicy;
use crate::error::StoreError;
use crate::object::{ClientId, EditableObject, LockLease, ObjectId, ObjectPatch, ObjectState, PeerInfo};
use crate::presence::PresenceRecord;

/// One change pushed to subscribers of the object collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectChange {
    Created(EditableObject),
    /// A content write; carries the new version.
    Committed(EditableObject),
    /// Lease acquired, renewed, released or reclaimed. Version unchanged.
    LockChanged { id: ObjectId, lock: Option<LockLease> },
    Deleted { id: ObjectId },
}

impl ObjectChange {
    pub fn object_id(&self) -> ObjectId {
        match self {
            ObjectChange::Created(obj) | ObjectChange::Committed(obj) => obj.id,
            ObjectChange::LockChanged { id, .. } | ObjectChange::Deleted { id } => *id,
        }
    }
}

/// One change pushed to presence subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceChange {
    Updated(PresenceRecord),
    Removed(ClientId),
}

/// Flush of a local delta, tagged with the version it was based on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub id: ObjectId,
    pub client: ClientId,
    pub base_version: u64,
    pub patch: ObjectPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LockOutcome {
    Granted(LockLease),
    /// Another client holds a valid lease.
    Denied(LockLease),
    /// Renewal on an object nobody holds.
    Free,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommitOutcome {
    Committed(EditableObject),
    /// `base_version` is behind the stored version.
    Stale { current: EditableObject },
    /// The writer does not hold a valid lease.
    LockLost { current: EditableObject },
    /// The patch does not apply to the stored state.
    Rejected { current: EditableObject, reason: String },
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeleteOutcome {
    Deleted,
    /// Carries the blocking lease, if any.
    Denied(Option<LockLease>),
    Missing,
}

/// Change feed handed to a subscriber.
pub type ChangeFeed = broadcast::Receiver<ObjectChange>;

/// Presence feed handed to a subscriber.
pub type PresenceFeed = broadcast::Receiver<PresenceChange>;

/// Persistent, shared object collection.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Persist a new object at version 1; the store assigns its id.
    async fn create(&self, creator: &PeerInfo, state: ObjectState) -> Result<EditableObject, StoreError>;

    async fn get(&self, id: ObjectId) -> Result<Option<EditableObject>, StoreError>;

    async fn list(&self) -> Result<Vec<EditableObject>, StoreError>;

    /// Conditional acquire: succeeds only if the lease is absent, expired or
    /// already held by `holder`. Granted leases carry the store's TTL.
    async fn try_lock(&self, id: ObjectId, holder: &PeerInfo) -> Result<LockOutcome, StoreError>;

    /// Re-stamp a lease still owned by `holder`.
    async fn renew_lock(&self, id: ObjectId, holder: &PeerInfo) -> Result<LockOutcome, StoreError>;

    /// Clear the lease if `holder` owns it. `Ok(false)` is a no-op, not an error.
    async fn unlock(&self, id: ObjectId, holder: ClientId) -> Result<bool, StoreError>;

    async fn commit(&self, request: CommitRequest) -> Result<CommitOutcome, StoreError>;

    /// Hard delete, allowed by the store's [`crate::config::DeletePolicy`].
    async fn delete(&self, id: ObjectId, client: ClientId) -> Result<DeleteOutcome, StoreError>;

    fn subscribe(&self) -> ChangeFeed;
}

/// Ephemeral, loss-tolerant presence records. One record per client.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Overwrite the record for `record.client_id`.
    async fn put_presence(&self, record: PresenceRecord) -> Result<(), StoreError>;

    /// Remove a record. With `stale_before`, only if its freshness timestamp
    /// is older than that instant, so pruning a refreshed record is a no-op.
    async fn remove_presence(&self, client_id: ClientId, stale_before: Option<u64>) -> Result<bool, StoreError>;

    async fn list_presence(&self) -> Result<Vec<PresenceRecord>, StoreError>;

    fn subscribe_presence(&self) -> PresenceFeed;
}
