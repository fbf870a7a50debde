//! The `Workspace` service object: one per client session.
//!
//! ```text
//!                      ┌──────────────────── Workspace ───────────────────┐
//!  try_select ────────►│ LockManager ──── sweeper task (TTL/6)            │
//!  mutate ────────────►│ OptimisticController ── flush timers             │
//!  finish_gesture ────►│        │                                         │
//!  deselect / delete ─►│        ▼                                         │
//!                      │    LocalView ◄── ChangeReconciler ◄── feed task  │
//!                      │        │                                         │
//!  subscribe_objects ◄─┤ ObjectEvent broadcast                            │
//!  publish_presence ──►│ PresenceBroadcaster ── listener task, GC task    │
//!  subscribe_presence ◄┤                                                  │
//!                      └───────────────┬───────────────────┬──────────────┘
//!                                      ▼                   ▼
//!                                 ObjectStore         PresenceStore
//! ```
//!
//! Stores are injected; nothing here is global. Dropping the workspace stops
//! its background tasks.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{StoreError, SyncError};
use crate::event::{Notice, ObjectEvent};
use crate::lock::{LockEvent, LockManager, LockResult};
use crate::object::{Color, EditableObject, LockLease, ObjectId, ObjectPatch, ObjectState, PeerInfo, Vec2};
use crate::optimistic::{FlushOutcome, OptimisticController};
use crate::presence::{PresenceBroadcaster, PresenceMap};
use crate::reconciler::ChangeReconciler;
use crate::store::{DeleteOutcome, ObjectChange, ObjectStore, PresenceStore};
use crate::view::{LocalView, SharedView};

pub struct Workspace {
    peer: PeerInfo,
    config: SyncConfig,
    objects: Arc<dyn ObjectStore>,
    view: SharedView,
    locks: Arc<LockManager>,
    controller: Arc<OptimisticController>,
    reconciler: Arc<ChangeReconciler>,
    presence: PresenceBroadcaster,
    events: broadcast::Sender<ObjectEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Workspace {
    /// Wire up the engine and load the current collection.
    ///
    /// The change feed is subscribed before the initial listing so no change
    /// falls between the two.
    pub async fn start(
        peer: PeerInfo,
        config: SyncConfig,
        objects: Arc<dyn ObjectStore>,
        presence: Arc<dyn PresenceStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let feed = objects.subscribe();
        let (events, _) = broadcast::channel(config.event_capacity);
        let view = LocalView::shared(peer.peer_id);

        let locks = Arc::new(LockManager::new(peer.clone(), objects.clone(), clock.clone(), &config));
        let lock_events = locks.subscribe();
        let controller = OptimisticController::new(
            peer.clone(),
            objects.clone(),
            locks.clone(),
            view.clone(),
            &config,
            events.clone(),
        );
        let reconciler = ChangeReconciler::new(
            objects.clone(),
            locks.clone(),
            view.clone(),
            events.clone(),
            config.acquire_timeout(),
        );
        let presence = PresenceBroadcaster::new(
            peer.clone(),
            presence,
            clock,
            config.presence_flush_throttle(),
            config.presence_ttl(),
        );

        reconciler.resync().await?;

        let tasks = vec![
            reconciler.spawn(feed),
            locks.spawn_sweeper(config.expiry_sweep_interval()),
            spawn_lease_watch(lock_events, controller.clone()),
            presence.spawn_listener(),
            presence.spawn_gc(config.presence_gc_interval()),
        ];

        log::info!(
            "Workspace started for {} ({} object(s))",
            peer.name,
            view.lock().len()
        );

        Ok(Self {
            peer,
            config,
            objects,
            view,
            locks,
            controller,
            reconciler,
            presence,
            events,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Persist a new object. The creator does not get its lease.
    pub async fn create_object(&self, state: ObjectState) -> Result<ObjectId, SyncError> {
        let obj = self.bounded(self.objects.create(&self.peer, state)).await?;
        log::debug!("Created {} ({})", obj.id, obj.state.shape.kind());
        let id = obj.id;
        let known = self.view.lock().confirmed(id).is_some();
        if !known {
            self.reconciler.apply(ObjectChange::Created(obj))?;
        }
        Ok(id)
    }

    /// Ask for the lease. A denial is returned, not raised, and also shows
    /// up as a notice.
    pub async fn try_select(&self, id: ObjectId) -> Result<LockResult, SyncError> {
        let result = self.locks.acquire(id).await?;
        if !result.granted {
            let _ = self.events.send(ObjectEvent::Notice(Notice::LockDenied {
                id,
                holder_label: result.holder_label.clone().unwrap_or_default(),
            }));
        }
        Ok(result)
    }

    /// Edit a selected object. The new state is visible immediately; the
    /// write goes out throttled.
    pub fn mutate(&self, id: ObjectId, patch: ObjectPatch) -> Result<EditableObject, SyncError> {
        self.controller.apply_local(id, patch)
    }

    /// Flush `id` now (pointer release).
    pub async fn finish_gesture(&self, id: ObjectId) -> Result<FlushOutcome, SyncError> {
        self.controller.finish_gesture(id).await
    }

    /// Flush any pending edit, then release the lease.
    ///
    /// A conflict during the final flush is already rolled back and
    /// announced; the lease is released regardless.
    pub async fn deselect(&self, id: ObjectId) -> Result<bool, SyncError> {
        if let Err(e) = self.controller.finish_gesture(id).await {
            log::debug!("Final flush of {id} before release: {e}");
        }
        let released = self.locks.release(id).await;
        self.controller.forget(id);
        released
    }

    /// Hard-delete `id`; needs the lease, or creator rights under the
    /// store's delete policy.
    pub async fn delete(&self, id: ObjectId) -> Result<(), SyncError> {
        self.controller.disarm(id);
        let outcome = self.bounded(self.objects.delete(id, self.peer.peer_id)).await?;

        match outcome {
            DeleteOutcome::Deleted => {
                log::info!("Deleted {id}");
                self.locks.forget(id);
                self.controller.forget(id);
                if self.view.lock().remove(id) {
                    let _ = self.events.send(ObjectEvent::Removed(id));
                }
                Ok(())
            }
            DeleteOutcome::Denied(Some(lease)) => Err(SyncError::LockDenied {
                id,
                holder: Some(lease.holder),
                holder_label: lease.holder_label,
            }),
            DeleteOutcome::Denied(None) => Err(SyncError::NotPermitted { id }),
            DeleteOutcome::Missing => Err(SyncError::NotFound(id)),
        }
    }

    /// Visible state of one object (local edits included).
    pub fn object(&self, id: ObjectId) -> Option<EditableObject> {
        self.view.lock().visible(id)
    }

    pub fn objects(&self) -> Vec<EditableObject> {
        self.view.lock().objects()
    }

    pub fn holder_of(&self, id: ObjectId) -> Option<LockLease> {
        self.locks.holder_of(id)
    }

    pub fn is_holding(&self, id: ObjectId) -> bool {
        self.locks.is_holding(id)
    }

    /// Object changes and user notices, in the order they happened locally.
    pub fn subscribe_objects(&self) -> broadcast::Receiver<ObjectEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ObjectEvent> {
        self.subscribe_objects()
    }

    pub fn subscribe_presence(&self) -> watch::Receiver<PresenceMap> {
        self.presence.subscribe()
    }

    pub async fn publish_presence(&self, position: Vec2, label: &str, color: Color) {
        self.presence.publish(position, label, color).await;
    }

    pub fn presence(&self) -> &PresenceBroadcaster {
        &self.presence
    }

    /// Flush and release everything we hold and remove our presence.
    pub async fn leave(&self) {
        for id in self.locks.held_ids() {
            if let Err(e) = self.controller.finish_gesture(id).await {
                log::debug!("Final flush of {id} on leave: {e}");
            }
        }
        self.locks.release_all().await;
        self.presence.leave().await;
        log::info!("{} left the workspace", self.peer.name);
    }

    /// Stop every background task. Also runs on drop.
    pub fn shutdown(&self) {
        self.controller.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T, StoreError>>) -> Result<T, SyncError> {
        match tokio::time::timeout(self.config.acquire_timeout(), call).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(StoreError::Timeout.into()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cancel local edits whenever one of our leases goes away.
fn spawn_lease_watch(
    mut lock_events: broadcast::Receiver<LockEvent>,
    controller: Arc<OptimisticController>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match lock_events.recv().await {
                Ok(LockEvent::Lost { id, by }) => {
                    controller.on_lease_lost(id, by.map(|lease| lease.holder_label));
                }
                Ok(LockEvent::Reclaimable { id }) => log::debug!("{id} is free to select"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => log::warn!("Missed {skipped} lock event(s)"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LeasePolicy;
    use crate::store::MemoryStore;

    fn memory(clock: &Arc<ManualClock>) -> Arc<MemoryStore> {
        let policy = LeasePolicy { ttl_ms: 6_000, ..LeasePolicy::default() };
        Arc::new(MemoryStore::new(clock.clone()).with_policy(policy))
    }

    async fn start(store: &Arc<MemoryStore>, clock: &Arc<ManualClock>, name: &str) -> Workspace {
        let config = SyncConfig { lease_ttl_ms: 6_000, ..SyncConfig::default() };
        Workspace::start(PeerInfo::new(name), config, store.clone(), store.clone(), clock.clone())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_does_not_lock() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = memory(&clock);
        let ws = start(&store, &clock, "Alice").await;

        let id = ws.create_object(ObjectState::rect(0.0, 0.0, 5.0, 5.0)).await.unwrap();
        let obj = ws.object(id).unwrap();
        assert_eq!(obj.version, 1);
        assert!(obj.lock.is_none());
        assert!(!ws.is_holding(id));
        assert!(matches!(
            ws.mutate(id, ObjectPatch::rotate(1.0)),
            Err(SyncError::LockDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_existing_objects_loaded_on_start() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = memory(&clock);
        let first = start(&store, &clock, "Alice").await;
        let id = first.create_object(ObjectState::text(0.0, 0.0, "hi", 12.0)).await.unwrap();

        let second = start(&store, &clock, "Bob").await;
        assert_eq!(second.objects().len(), 1);
        assert_eq!(second.object(id).unwrap().state.shape.kind(), "text");
    }

    #[tokio::test]
    async fn test_delete_policy_creator_and_holder() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = memory(&clock);
        let alice = start(&store, &clock, "Alice").await;
        let bob = start(&store, &clock, "Bob").await;

        let id = alice.create_object(ObjectState::rect(0.0, 0.0, 5.0, 5.0)).await.unwrap();
        assert!(bob.try_select(id).await.unwrap().granted);

        assert!(matches!(alice.delete(id).await, Err(SyncError::LockDenied { .. })));
        bob.deselect(id).await.unwrap();
        alice.delete(id).await.unwrap();
        assert!(alice.object(id).is_none());
        assert!(matches!(bob.delete(id).await, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = memory(&clock);
        let config = SyncConfig { event_capacity: 0, ..SyncConfig::default() };

        let result = Workspace::start(PeerInfo::new("Alice"), config, store.clone(), store, clock).await;
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
