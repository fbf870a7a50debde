//! Optimistic Update Controller.
//!
//! ```text
//! apply_local ──► LocalView (visible now) ──► arm trailing timer (150ms)
//!                                                   │
//!       finish_gesture ──── abort timer ───┐        │ fires once
//!                                          ▼        ▼
//!                              flush: begin_flush → commit(base_version)
//!                                          │
//!              ┌───────────────┬───────────┼──────────────┬──────────────┐
//!              ▼               ▼           ▼              ▼              ▼
//!          Committed         Stale      LockLost      Transport      Missing
//!          confirm()       rollback()   rollback()    retry w/       drop
//!                                                     backoff, then
//!                                                     rollback()
//! ```
//!
//! Flushes of one object are serialized, so a client's writes to an object
//! reach the store in local call order. A flush runs on its own task and is
//! never cut short by a cancelled caller.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::{StoreError, SyncError};
use crate::event::{Notice, ObjectEvent};
use crate::lock::LockManager;
use crate::object::{EditableObject, ObjectId, ObjectPatch, PeerInfo};
use crate::store::{CommitOutcome, CommitRequest, ObjectStore};
use crate::view::{FlushTicket, SharedView};

/// Result of one flush.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Idle,
    Committed(EditableObject),
    /// The object disappeared or the delta was superseded before it landed.
    Discarded,
}

pub struct OptimisticController {
    peer: PeerInfo,
    store: Arc<dyn ObjectStore>,
    locks: Arc<LockManager>,
    view: SharedView,
    config: SyncConfig,
    timers: Mutex<HashMap<ObjectId, JoinHandle<()>>>,
    gates: Mutex<HashMap<ObjectId, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<ObjectEvent>,
}

impl OptimisticController {
    pub fn new(
        peer: PeerInfo,
        store: Arc<dyn ObjectStore>,
        locks: Arc<LockManager>,
        view: SharedView,
        config: &SyncConfig,
        events: broadcast::Sender<ObjectEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            store,
            locks,
            view,
            config: config.clone(),
            timers: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Apply an edit locally and schedule its flush.
    ///
    /// Only valid while holding the lease on `id`.
    pub fn apply_local(self: &Arc<Self>, id: ObjectId, patch: ObjectPatch) -> Result<EditableObject, SyncError> {
        if !self.locks.is_holding(id) {
            let holder = self.locks.holder_of(id);
            return Err(SyncError::LockDenied {
                id,
                holder: holder.as_ref().map(|lease| lease.holder),
                holder_label: holder
                    .map(|lease| lease.holder_label)
                    .unwrap_or_else(|| "no one".to_string()),
            });
        }

        let visible = self.view.lock().apply_local(id, patch)?;
        self.emit(ObjectEvent::Upserted(visible.clone()));
        self.arm(id);
        Ok(visible)
    }

    /// Drop per-object bookkeeping once `id` is released or deleted.
    pub fn forget(&self, id: ObjectId) {
        self.disarm(id);
        self.prune_gate(id);
    }

    /// Number of objects with a flush gate. Exposed for tests.
    pub fn gate_count(&self) -> usize {
        self.gates.lock().len()
    }

    /// Flush now, skipping the throttle window (pointer release).
    pub async fn finish_gesture(self: &Arc<Self>, id: ObjectId) -> Result<FlushOutcome, SyncError> {
        self.disarm(id);
        self.flush(id).await
    }

    /// Send whatever is unflushed for `id`.
    pub async fn flush(self: &Arc<Self>, id: ObjectId) -> Result<FlushOutcome, SyncError> {
        let this = self.clone();
        let result = match tokio::spawn(async move { this.flush_in_order(id).await }).await {
            Ok(result) => result,
            Err(e) => Err(StoreError::Transport(format!("flush task failed: {e}")).into()),
        };
        if !self.locks.is_holding(id) {
            self.prune_gate(id);
        }
        result
    }

    /// Our lease on `id` is gone: stop flushing and drop local edits.
    pub fn on_lease_lost(&self, id: ObjectId, by: Option<String>) {
        self.disarm(id);
        let visible = {
            let mut view = self.view.lock();
            if view.pending(id).is_some() {
                view.rollback(id, None)
            } else {
                None
            }
        };
        if let Some(visible) = visible {
            self.emit(ObjectEvent::Upserted(visible));
        }
        self.prune_gate(id);
        self.emit(ObjectEvent::Notice(Notice::LeaseLost { id, by }));
    }

    /// Stop the pending timer for `id`, if any.
    pub fn disarm(&self, id: ObjectId) {
        if let Some(timer) = self.timers.lock().remove(&id) {
            timer.abort();
        }
    }

    pub fn shutdown(&self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.abort();
        }
    }

    /// Remove the gate for `id` unless a flush holds or awaits it.
    fn prune_gate(&self, id: ObjectId) {
        let mut gates = self.gates.lock();
        if gates.get(&id).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            gates.remove(&id);
        }
    }

    fn arm(self: &Arc<Self>, id: ObjectId) {
        let mut timers = self.timers.lock();
        if timers.contains_key(&id) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let window = self.config.edit_flush_throttle();
        timers.insert(
            id,
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let Some(this) = weak.upgrade() else { return };
                this.timers.lock().remove(&id);
                // Failures already surfaced as notices.
                let _ = this.flush(id).await;
            }),
        );
    }

    async fn flush_in_order(&self, id: ObjectId) -> Result<FlushOutcome, SyncError> {
        let gate = self.gates.lock().entry(id).or_default().clone();
        let _turn = gate.lock().await;

        let Some(ticket) = self.view.lock().begin_flush(id) else {
            return Ok(FlushOutcome::Idle);
        };

        match self.locks.renew_if_due(id).await {
            Ok(true) => {}
            Ok(false) => {
                log::info!("Flush of {id} cancelled: lease no longer held");
                let current = self.fetch(id).await;
                return Err(self.roll_back(&ticket, current));
            }
            Err(e) => log::warn!("Lease renewal for {id} failed: {e}"),
        }

        let request = CommitRequest {
            id,
            client: self.peer.peer_id,
            base_version: ticket.base_version,
            patch: ticket.patch.clone(),
        };
        let policy = self.config.flush_retry;
        let mut attempt = 0;

        let outcome = loop {
            let result = match tokio::time::timeout(
                self.config.flush_timeout(),
                self.store.commit(request.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout),
            };

            let error = match result {
                Ok(outcome) => break outcome,
                Err(e) => e,
            };

            attempt += 1;
            if attempt > policy.max_retries {
                log::warn!("Giving up on flush of {id} after {attempt} attempts: {error}");
                self.emit(ObjectEvent::Notice(Notice::TransportDegraded {
                    id,
                    attempts: attempt,
                    error: error.to_string(),
                }));
                let current = self.fetch(id).await;
                return Err(self.roll_back(&ticket, current));
            }
            if let Some(outcome) = self.superseded(&ticket) {
                return Ok(outcome);
            }
            if !self.locks.is_holding(id) {
                log::info!("Not retrying flush of {id}: lease no longer held");
                let current = self.fetch(id).await;
                return Err(self.roll_back(&ticket, current));
            }

            let delay = policy.delay(attempt);
            log::warn!(
                "Flush of {id} failed ({error}); retry {attempt}/{} in {delay:?}",
                policy.max_retries
            );
            tokio::time::sleep(delay).await;
        };

        self.settle(ticket, outcome, attempt > 0).await
    }

    async fn settle(&self, ticket: FlushTicket, outcome: CommitOutcome, retried: bool) -> Result<FlushOutcome, SyncError> {
        let id = ticket.id;
        match outcome {
            CommitOutcome::Committed(obj) => self.adopt(&ticket, obj).await,
            // An earlier attempt landed but its reply was lost.
            CommitOutcome::Stale { current }
                if retried
                    && current.last_writer == self.peer.peer_id
                    && current.version == ticket.base_version + 1 =>
            {
                self.adopt(&ticket, current).await
            }
            CommitOutcome::Stale { current } => {
                log::info!(
                    "Flush of {id} based on v{} lost to v{}",
                    ticket.base_version,
                    current.version
                );
                Err(self.roll_back(&ticket, Some(current)))
            }
            CommitOutcome::LockLost { current } => {
                let by = current.lock.clone().filter(|lease| lease.holder != self.peer.peer_id);
                self.locks.mark_lost(id, by);
                Err(self.roll_back(&ticket, Some(current)))
            }
            CommitOutcome::Rejected { current, reason } => {
                log::warn!("Store rejected flush of {id}: {reason}");
                Err(self.roll_back(&ticket, Some(current)))
            }
            CommitOutcome::Missing => {
                if self.view.lock().remove(id) {
                    self.emit(ObjectEvent::Removed(id));
                }
                self.locks.forget(id);
                Ok(FlushOutcome::Discarded)
            }
        }
    }

    async fn adopt(&self, ticket: &FlushTicket, committed: EditableObject) -> Result<FlushOutcome, SyncError> {
        let result = self.view.lock().confirm(ticket, committed.clone());
        match result {
            Ok(visible) => {
                log::debug!("Committed {} at v{}", ticket.id, committed.version);
                self.emit(ObjectEvent::Upserted(visible));
                Ok(FlushOutcome::Committed(committed))
            }
            Err(SyncError::NotFound(_)) => Ok(FlushOutcome::Discarded),
            Err(e) => {
                log::error!("{e}");
                if let Some(fresh) = self.fetch(ticket.id).await {
                    let visible = self.view.lock().force_sync(fresh);
                    self.emit(ObjectEvent::Upserted(visible));
                }
                Err(e)
            }
        }
    }

    /// Whether the reconciler already settled `ticket` while we were retrying.
    fn superseded(&self, ticket: &FlushTicket) -> Option<FlushOutcome> {
        let view = self.view.lock();
        let live = view
            .pending(ticket.id)
            .is_some_and(|delta| delta.epoch == ticket.epoch && delta.in_flight.is_some());
        if live {
            return None;
        }
        match view.confirmed(ticket.id) {
            Some(obj) if obj.version == ticket.base_version + 1 && obj.last_writer == self.peer.peer_id => {
                Some(FlushOutcome::Committed(obj.clone()))
            }
            _ => Some(FlushOutcome::Discarded),
        }
    }

    fn roll_back(&self, ticket: &FlushTicket, current: Option<EditableObject>) -> SyncError {
        let id = ticket.id;
        let visible = self.view.lock().rollback(id, current);
        let current_version = visible.as_ref().map_or(ticket.base_version, |obj| obj.version);
        if let Some(visible) = visible {
            self.emit(ObjectEvent::Upserted(visible));
        }
        log::info!("Rolled back {id}: v{} -> v{current_version}", ticket.base_version);
        self.emit(ObjectEvent::Notice(Notice::RolledBack {
            id,
            base_version: ticket.base_version,
            current_version,
        }));
        SyncError::StaleWriteConflict {
            id,
            base_version: ticket.base_version,
            current_version,
        }
    }

    async fn fetch(&self, id: ObjectId) -> Option<EditableObject> {
        match tokio::time::timeout(self.config.flush_timeout(), self.store.get(id)).await {
            Ok(Ok(obj)) => obj,
            Ok(Err(e)) => {
                log::warn!("Could not refetch {id}: {e}");
                None
            }
            Err(_) => {
                log::warn!("Refetch of {id} timed out");
                None
            }
        }
    }

    fn emit(&self, event: ObjectEvent) {
        let _ = self.events.send(event);
    }
}
