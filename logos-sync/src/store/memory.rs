//! In-process store.
//!
//! Conditional writes run inside one `parking_lot::Mutex` critical section,
//! which is the single point of truth for racing acquirers. Changes are
//! broadcast while the section is held, so every subscriber sees them in
//! commit order.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::LeasePolicy;
use crate::error::StoreError;
use crate::object::{ClientId, EditableObject, ObjectId, ObjectState, PeerInfo};
use crate::presence::PresenceRecord;
use crate::store::{
    rules, ChangeFeed, CommitOutcome, CommitRequest, DeleteOutcome, LockOutcome, ObjectChange,
    ObjectStore, PresenceChange, PresenceFeed, PresenceStore,
};

/// Store counters (snapshot).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub commits: u64,
    pub rejected_commits: u64,
    pub lock_grants: u64,
    pub lock_denials: u64,
    pub presence_writes: u64,
}

/// Lock-free counters, read via [`AtomicStoreStats::snapshot`].
#[derive(Debug, Default)]
pub(crate) struct AtomicStoreStats {
    commits: AtomicU64,
    rejected_commits: AtomicU64,
    lock_grants: AtomicU64,
    lock_denials: AtomicU64,
    presence_writes: AtomicU64,
}

impl AtomicStoreStats {
    pub(crate) fn record_commit(&self, outcome: &CommitOutcome) {
        match outcome {
            CommitOutcome::Committed(_) => self.commits.fetch_add(1, Ordering::Relaxed),
            _ => self.rejected_commits.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn record_lock(&self, outcome: &LockOutcome) {
        match outcome {
            LockOutcome::Granted(_) => self.lock_grants.fetch_add(1, Ordering::Relaxed),
            LockOutcome::Denied(_) => self.lock_denials.fetch_add(1, Ordering::Relaxed),
            LockOutcome::Free | LockOutcome::Missing => 0,
        };
    }

    pub(crate) fn snapshot(&self) -> StoreStats {
        StoreStats {
            commits: self.commits.load(Ordering::Relaxed),
            rejected_commits: self.rejected_commits.load(Ordering::Relaxed),
            lock_grants: self.lock_grants.load(Ordering::Relaxed),
            lock_denials: self.lock_denials.load(Ordering::Relaxed),
            presence_writes: self.presence_writes.load(Ordering::Relaxed),
        }
    }
}

/// Presence records kept purely in memory. Shared by every backend since
/// presence is never persisted.
pub(crate) struct PresenceTable {
    records: Mutex<HashMap<ClientId, PresenceRecord>>,
    changes: broadcast::Sender<PresenceChange>,
}

impl PresenceTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity);
        Self {
            records: Mutex::new(HashMap::new()),
            changes,
        }
    }

    pub(crate) fn put(&self, record: PresenceRecord) {
        let mut records = self.records.lock();
        records.insert(record.client_id, record.clone());
        let _ = self.changes.send(PresenceChange::Updated(record));
    }

    pub(crate) fn remove(&self, client_id: ClientId, stale_before: Option<u64>) -> bool {
        let mut records = self.records.lock();
        let removable = match (records.get(&client_id), stale_before) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(record), Some(cutoff)) => record.updated_at_ms < cutoff,
        };
        if removable {
            records.remove(&client_id);
            let _ = self.changes.send(PresenceChange::Removed(client_id));
        }
        removable
    }

    pub(crate) fn list(&self) -> Vec<PresenceRecord> {
        self.records.lock().values().cloned().collect()
    }

    pub(crate) fn subscribe(&self) -> PresenceFeed {
        self.changes.subscribe()
    }
}

/// In-memory [`ObjectStore`] + [`PresenceStore`].
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    policy: LeasePolicy,
    objects: Mutex<HashMap<ObjectId, EditableObject>>,
    changes: broadcast::Sender<ObjectChange>,
    presence: PresenceTable,
    stats: AtomicStoreStats,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(clock, 1024)
    }

    /// `capacity` bounds how far a subscriber may lag before it sees `Lagged`.
    pub fn with_capacity(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity);
        Self {
            clock,
            policy: LeasePolicy::default(),
            objects: Mutex::new(HashMap::new()),
            changes,
            presence: PresenceTable::new(capacity),
            stats: AtomicStoreStats::default(),
        }
    }

    /// Replace the default lease rules.
    pub fn with_policy(mut self, policy: LeasePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> LeasePolicy {
        self.policy
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.snapshot()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    fn publish(&self, change: ObjectChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    /// Run a lease operation and broadcast the lock field if it changed.
    fn with_lock_field<F>(&self, id: ObjectId, op: F) -> LockOutcome
    where
        F: FnOnce(&mut EditableObject) -> LockOutcome,
    {
        let mut objects = self.objects.lock();
        let Some(obj) = objects.get_mut(&id) else {
            return LockOutcome::Missing;
        };
        let before = obj.lock.clone();
        let outcome = op(obj);
        if obj.lock != before {
            self.publish(ObjectChange::LockChanged { id, lock: obj.lock.clone() });
        }
        outcome
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create(&self, creator: &PeerInfo, state: ObjectState) -> Result<EditableObject, StoreError> {
        let obj = EditableObject::new(Uuid::new_v4(), creator.peer_id, state);
        let mut objects = self.objects.lock();
        objects.insert(obj.id, obj.clone());
        self.publish(ObjectChange::Created(obj.clone()));
        log::debug!("Created object {} for {}", obj.id, creator.name);
        Ok(obj)
    }

    async fn get(&self, id: ObjectId) -> Result<Option<EditableObject>, StoreError> {
        Ok(self.objects.lock().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<EditableObject>, StoreError> {
        Ok(self.objects.lock().values().cloned().collect())
    }

    async fn try_lock(&self, id: ObjectId, holder: &PeerInfo) -> Result<LockOutcome, StoreError> {
        let now = self.clock.now_ms();
        let ttl = self.policy.ttl();
        let outcome = self.with_lock_field(id, |obj| rules::try_lock(obj, holder, now, ttl));
        self.stats.record_lock(&outcome);
        Ok(outcome)
    }

    async fn renew_lock(&self, id: ObjectId, holder: &PeerInfo) -> Result<LockOutcome, StoreError> {
        let now = self.clock.now_ms();
        let ttl = self.policy.ttl();
        Ok(self.with_lock_field(id, |obj| rules::renew_lock(obj, holder, now, ttl)))
    }

    async fn unlock(&self, id: ObjectId, holder: ClientId) -> Result<bool, StoreError> {
        let mut objects = self.objects.lock();
        let Some(obj) = objects.get_mut(&id) else {
            return Ok(false);
        };
        let released = rules::unlock(obj, holder);
        if released {
            self.publish(ObjectChange::LockChanged { id, lock: None });
        }
        Ok(released)
    }

    async fn commit(&self, request: CommitRequest) -> Result<CommitOutcome, StoreError> {
        let now = self.clock.now_ms();
        let mut objects = self.objects.lock();
        let outcome = match objects.get_mut(&request.id) {
            Some(obj) => rules::commit(obj, &request, now),
            None => CommitOutcome::Missing,
        };
        if let CommitOutcome::Committed(obj) = &outcome {
            self.publish(ObjectChange::Committed(obj.clone()));
        }
        self.stats.record_commit(&outcome);
        Ok(outcome)
    }

    async fn delete(&self, id: ObjectId, client: ClientId) -> Result<DeleteOutcome, StoreError> {
        let now = self.clock.now_ms();
        let mut objects = self.objects.lock();
        let Some(obj) = objects.get(&id) else {
            return Ok(DeleteOutcome::Missing);
        };
        let outcome = rules::may_delete(obj, client, self.policy.delete_policy, now);
        if outcome == DeleteOutcome::Deleted {
            objects.remove(&id);
            self.publish(ObjectChange::Deleted { id });
        }
        Ok(outcome)
    }

    fn subscribe(&self) -> ChangeFeed {
        self.changes.subscribe()
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn put_presence(&self, record: PresenceRecord) -> Result<(), StoreError> {
        self.stats.presence_writes.fetch_add(1, Ordering::Relaxed);
        self.presence.put(record);
        Ok(())
    }

    async fn remove_presence(&self, client_id: ClientId, stale_before: Option<u64>) -> Result<bool, StoreError> {
        Ok(self.presence.remove(client_id, stale_before))
    }

    async fn list_presence(&self) -> Result<Vec<PresenceRecord>, StoreError> {
        Ok(self.presence.list())
    }

    fn subscribe_presence(&self) -> PresenceFeed {
        self.presence.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DeletePolicy;
    use crate::object::{ObjectPatch, Vec2};

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = MemoryStore::new(clock.clone()).with_policy(LeasePolicy {
            ttl_ms: 1_000,
            delete_policy: DeletePolicy::HolderOrCreator,
        });
        (clock, store)
    }

    #[tokio::test]
    async fn test_create_broadcasts() {
        let (_clock, store) = store();
        let mut feed = store.subscribe();
        let alice = PeerInfo::new("Alice");

        let obj = store.create(&alice, ObjectState::rect(0.0, 0.0, 1.0, 1.0)).await.unwrap();
        assert_eq!(feed.recv().await.unwrap(), ObjectChange::Created(obj.clone()));
        assert_eq!(store.get(obj.id).await.unwrap(), Some(obj));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_changes_broadcast_without_version_bump() {
        let (_clock, store) = store();
        let alice = PeerInfo::new("Alice");
        let obj = store.create(&alice, ObjectState::rect(0.0, 0.0, 1.0, 1.0)).await.unwrap();
        let mut feed = store.subscribe();

        store.try_lock(obj.id, &alice).await.unwrap();
        match feed.recv().await.unwrap() {
            ObjectChange::LockChanged { id, lock: Some(lease) } => {
                assert_eq!(id, obj.id);
                assert_eq!(lease.holder, alice.peer_id);
                assert_eq!(lease.acquired_at_ms, 10_000);
                assert_eq!(lease.ttl_ms, 1_000);
            }
            other => panic!("unexpected change {other:?}"),
        }
        assert_eq!(store.get(obj.id).await.unwrap().unwrap().version, 1);

        assert!(store.unlock(obj.id, alice.peer_id).await.unwrap());
        assert_eq!(feed.recv().await.unwrap(), ObjectChange::LockChanged { id: obj.id, lock: None });
    }

    #[tokio::test]
    async fn test_denied_lock_is_not_broadcast() {
        let (_clock, store) = store();
        let alice = PeerInfo::new("Alice");
        let bob = PeerInfo::new("Bob");
        let obj = store.create(&alice, ObjectState::rect(0.0, 0.0, 1.0, 1.0)).await.unwrap();
        store.try_lock(obj.id, &alice).await.unwrap();
        let mut feed = store.subscribe();

        assert!(matches!(store.try_lock(obj.id, &bob).await.unwrap(), LockOutcome::Denied(_)));
        assert!(feed.try_recv().is_err());

        let stats = store.stats();
        assert_eq!(stats.lock_grants, 1);
        assert_eq!(stats.lock_denials, 1);
    }

    #[tokio::test]
    async fn test_commit_and_missing_object() {
        let (_clock, store) = store();
        let alice = PeerInfo::new("Alice");
        let obj = store.create(&alice, ObjectState::rect(0.0, 0.0, 1.0, 1.0)).await.unwrap();
        store.try_lock(obj.id, &alice).await.unwrap();

        let request = CommitRequest {
            id: obj.id,
            client: alice.peer_id,
            base_version: 1,
            patch: ObjectPatch::move_to(3.0, 4.0),
        };
        match store.commit(request.clone()).await.unwrap() {
            CommitOutcome::Committed(obj) => assert_eq!(obj.state.position, Vec2::new(3.0, 4.0)),
            other => panic!("unexpected outcome {other:?}"),
        }

        // Same base again is stale.
        assert!(matches!(store.commit(request.clone()).await.unwrap(), CommitOutcome::Stale { .. }));

        let missing = CommitRequest { id: Uuid::new_v4(), ..request };
        assert_eq!(store.commit(missing).await.unwrap(), CommitOutcome::Missing);

        let stats = store.stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.rejected_commits, 2);
    }

    #[tokio::test]
    async fn test_delete_is_terminal() {
        let (_clock, store) = store();
        let alice = PeerInfo::new("Alice");
        let obj = store.create(&alice, ObjectState::rect(0.0, 0.0, 1.0, 1.0)).await.unwrap();
        let mut feed = store.subscribe();

        let outcome = store.delete(obj.id, alice.peer_id).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert_eq!(feed.recv().await.unwrap(), ObjectChange::Deleted { id: obj.id });
        assert!(store.get(obj.id).await.unwrap().is_none());
        assert_eq!(
            store.delete(obj.id, alice.peer_id).await.unwrap(),
            DeleteOutcome::Missing
        );
        assert_eq!(store.try_lock(obj.id, &alice).await.unwrap(), LockOutcome::Missing);
    }

    #[tokio::test]
    async fn test_store_ttl_governs_every_holder() {
        let (clock, store) = store();
        let alice = PeerInfo::new("Alice");
        let bob = PeerInfo::new("Bob");
        let obj = store.create(&alice, ObjectState::rect(0.0, 0.0, 1.0, 1.0)).await.unwrap();

        assert!(matches!(store.try_lock(obj.id, &alice).await.unwrap(), LockOutcome::Granted(_)));
        clock.advance(999);
        assert!(matches!(store.try_lock(obj.id, &bob).await.unwrap(), LockOutcome::Denied(_)));
        clock.advance(1);
        assert!(matches!(store.try_lock(obj.id, &bob).await.unwrap(), LockOutcome::Granted(_)));
    }

    #[tokio::test]
    async fn test_holder_only_policy_blocks_creator() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock).with_policy(LeasePolicy {
            delete_policy: DeletePolicy::HolderOnly,
            ..LeasePolicy::default()
        });
        let alice = PeerInfo::new("Alice");
        let obj = store.create(&alice, ObjectState::rect(0.0, 0.0, 1.0, 1.0)).await.unwrap();

        assert_eq!(store.delete(obj.id, alice.peer_id).await.unwrap(), DeleteOutcome::Denied(None));
        store.try_lock(obj.id, &alice).await.unwrap();
        assert_eq!(store.delete(obj.id, alice.peer_id).await.unwrap(), DeleteOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_presence_conditional_prune() {
        let (_clock, store) = store();
        let alice = PeerInfo::new("Alice");
        let record = PresenceRecord::new(&alice, Vec2::new(1.0, 1.0), 5_000);

        store.put_presence(record.clone()).await.unwrap();
        // Refreshed after the cutoff: prune is a no-op.
        assert!(!store.remove_presence(alice.peer_id, Some(4_000)).await.unwrap());
        assert!(store.remove_presence(alice.peer_id, Some(6_000)).await.unwrap());
        assert!(!store.remove_presence(alice.peer_id, Some(6_000)).await.unwrap());
        assert!(store.list_presence().await.unwrap().is_empty());
    }
}
