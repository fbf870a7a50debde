//! Change Reconciler: folds the store's change feed into the local view.
//!
//! Snapshots win by `version`. A pending local delta survives only its own
//! confirmation; any other newer version rolls it back. Deletion is terminal.
//! When the feed lags the whole view is rebuilt from `list()`. A store
//! snapshot that breaks versioning or lease rules is logged and the object
//! is re-read from the store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::error::{StoreError, SyncError};
use crate::event::{Notice, ObjectEvent};
use crate::lock::LockManager;
use crate::object::ObjectId;
use crate::store::{ChangeFeed, ObjectChange, ObjectStore};
use crate::view::{RemoteOutcome, SharedView};

pub struct ChangeReconciler {
    store: Arc<dyn ObjectStore>,
    locks: Arc<LockManager>,
    view: SharedView,
    events: broadcast::Sender<ObjectEvent>,
    request_timeout: Duration,
}

impl ChangeReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        locks: Arc<LockManager>,
        view: SharedView,
        events: broadcast::Sender<ObjectEvent>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            locks,
            view,
            events,
            request_timeout,
        })
    }

    /// Apply one change in feed order.
    pub fn apply(&self, change: ObjectChange) -> Result<(), SyncError> {
        match &change {
            ObjectChange::LockChanged { id, lock } => self.locks.observe(*id, lock.clone())?,
            ObjectChange::Deleted { id } => self.locks.forget(*id),
            ObjectChange::Created(_) | ObjectChange::Committed(_) => {}
        }

        let outcome = self.view.lock().apply_remote(&change)?;
        self.publish(outcome);
        Ok(())
    }

    /// Rebuild the whole view from the store.
    pub async fn resync(&self) -> Result<(), SyncError> {
        let objects = self.bounded(self.store.list()).await?;
        for obj in &objects {
            self.locks.reset(obj.id, obj.lock.clone());
        }
        let listed: HashSet<ObjectId> = objects.iter().map(|obj| obj.id).collect();
        let gone = self.locks.forget_unlisted(&listed);
        if !gone.is_empty() {
            log::debug!("Dropped leases on {} deleted object(s)", gone.len());
        }
        let outcomes = self.view.lock().replace_all(objects);
        log::debug!("Resynced view ({} change(s))", outcomes.len());
        for outcome in outcomes {
            self.publish(outcome);
        }
        Ok(())
    }

    /// Re-read one object and adopt it as-is.
    pub async fn resync_object(&self, id: ObjectId) -> Result<(), SyncError> {
        match self.bounded(self.store.get(id)).await? {
            Some(obj) => {
                self.locks.reset(id, obj.lock.clone());
                let visible = self.view.lock().force_sync(obj);
                self.emit(ObjectEvent::Upserted(visible));
            }
            None => {
                self.locks.forget(id);
                if self.view.lock().remove(id) {
                    self.emit(ObjectEvent::Removed(id));
                }
            }
        }
        Ok(())
    }

    /// Follow `feed` until it closes.
    pub fn spawn(self: &Arc<Self>, mut feed: ChangeFeed) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(change) => {
                        let id = change.object_id();
                        match this.apply(change) {
                            Ok(()) => {}
                            Err(e @ SyncError::InvariantViolation { .. }) => {
                                log::error!("{e}");
                                if let Err(e) = this.resync_object(id).await {
                                    log::warn!("Forced resync of {id} failed: {e}");
                                }
                            }
                            Err(e) => log::warn!("Change to {id} not applied: {e}"),
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Change feed lagged by {skipped}; resyncing");
                        if let Err(e) = this.resync().await {
                            log::warn!("Resync failed: {e}");
                        }
                    }
                    Err(RecvError::Closed) => {
                        log::warn!("Change feed closed");
                        break;
                    }
                }
            }
        })
    }

    fn publish(&self, outcome: RemoteOutcome) {
        match outcome {
            RemoteOutcome::Ignored => {}
            RemoteOutcome::Upserted(obj) => self.emit(ObjectEvent::Upserted(obj)),
            RemoteOutcome::RolledBack { object, base_version, current_version } => {
                log::info!(
                    "Remote v{current_version} of {} superseded local edits on v{base_version}",
                    object.id
                );
                let id = object.id;
                self.emit(ObjectEvent::Upserted(object));
                self.emit(ObjectEvent::Notice(Notice::RolledBack { id, base_version, current_version }));
            }
            RemoteOutcome::Removed(id) => self.emit(ObjectEvent::Removed(id)),
        }
    }

    fn emit(&self, event: ObjectEvent) {
        let _ = self.events.send(event);
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(StoreError::Timeout.into()),
        }
    }
}
