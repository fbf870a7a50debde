//! Lock Manager: exclusive, time-bounded edit leases.
//!
//! The store's conditional write is the only authority on who holds a lease.
//! This module keeps two local views of it:
//!
//! - `held`: leases the store granted *us* (from acquire/renew replies).
//!   Each is timed on the local monotonic clock from the moment the request
//!   was sent, so it lapses here no later than at the store whatever the
//!   wall-clock skew between the two.
//! - `observed`: the latest lease per object in change-feed order, used for
//!   the expiry sweep and for detecting dual holders. Foreign leases are
//!   judged with [`is_expired`] against their store stamps; that verdict is
//!   advisory only.
//!
//! The sweep never clears a remote lease; it only reports objects that
//! became reclaimable so callers may call [`LockManager::acquire`] again,
//! which re-validates expiry at the store.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{StoreError, SyncError};
use crate::object::{is_expired, ClientId, LockLease, ObjectId, PeerInfo};
use crate::store::{LockOutcome, ObjectStore};

/// Outcome of a selection attempt. A denial is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResult {
    pub granted: bool,
    pub holder: Option<ClientId>,
    pub holder_label: Option<String>,
}

impl LockResult {
    fn granted(lease: &LockLease) -> Self {
        Self {
            granted: true,
            holder: Some(lease.holder),
            holder_label: Some(lease.holder_label.clone()),
        }
    }

    fn denied(lease: &LockLease) -> Self {
        Self {
            granted: false,
            holder: Some(lease.holder),
            holder_label: Some(lease.holder_label.clone()),
        }
    }

    /// "held by X" for denials.
    pub fn reason(&self) -> Option<String> {
        if self.granted {
            return None;
        }
        self.holder_label.as_ref().map(|label| format!("held by {label}"))
    }
}

/// Lease transitions reported to the rest of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum LockEvent {
    Acquired { id: ObjectId, lease: LockLease },
    Released { id: ObjectId },
    /// Our lease lapsed or was reclaimed by `by`.
    Lost { id: ObjectId, by: Option<LockLease> },
    /// Someone else's lease expired; the object may be acquired again.
    Reclaimable { id: ObjectId },
}

/// Result of one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub lost: Vec<ObjectId>,
    pub reclaimable: Vec<ObjectId>,
}

/// A lease the store granted us, timed from when we asked for it.
#[derive(Debug, Clone)]
struct HeldLease {
    lease: LockLease,
    sent_at: Instant,
}

impl HeldLease {
    fn age(&self) -> Duration {
        self.sent_at.elapsed()
    }

    fn is_live(&self) -> bool {
        self.age() < self.lease.ttl()
    }
}

pub struct LockManager {
    peer: PeerInfo,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    request_timeout: Duration,
    renew_on_activity: bool,
    held: RwLock<HashMap<ObjectId, HeldLease>>,
    observed: RwLock<HashMap<ObjectId, LockLease>>,
    /// Expired foreign leases already announced as reclaimable.
    announced: Mutex<HashSet<ObjectId>>,
    events: broadcast::Sender<LockEvent>,
}

impl LockManager {
    pub fn new(peer: PeerInfo, store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>, config: &SyncConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            peer,
            store,
            clock,
            request_timeout: config.acquire_timeout(),
            renew_on_activity: config.renew_on_activity,
            held: RwLock::new(HashMap::new()),
            observed: RwLock::new(HashMap::new()),
            announced: Mutex::new(HashSet::new()),
            events,
        }
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    /// Try to take the lease on `id`.
    pub async fn acquire(&self, id: ObjectId) -> Result<LockResult, SyncError> {
        if let Some(held) = self.held.read().get(&id) {
            if held.is_live() {
                return Ok(LockResult::granted(&held.lease));
            }
        }

        let sent_at = Instant::now();
        let outcome = self.bounded(self.store.try_lock(id, &self.peer)).await?;

        match outcome {
            LockOutcome::Granted(lease) => {
                log::debug!("Lock on {id} granted to {} for {}ms", self.peer.name, lease.ttl_ms);
                self.held.write().insert(id, HeldLease { lease: lease.clone(), sent_at });
                let result = LockResult::granted(&lease);
                let _ = self.events.send(LockEvent::Acquired { id, lease });
                Ok(result)
            }
            LockOutcome::Denied(lease) => {
                log::debug!("Lock on {id} denied: held by {}", lease.holder_label);
                self.held.write().remove(&id);
                Ok(LockResult::denied(&lease))
            }
            LockOutcome::Free | LockOutcome::Missing => Err(SyncError::NotFound(id)),
        }
    }

    /// Give the lease back. Releasing a lease we no longer hold is a no-op.
    pub async fn release(&self, id: ObjectId) -> Result<bool, SyncError> {
        let had = self.held.write().remove(&id).is_some();
        let cleared = self
            .bounded(self.store.unlock(id, self.peer.peer_id))
            .await?;
        if had || cleared {
            let _ = self.events.send(LockEvent::Released { id });
        }
        Ok(cleared)
    }

    /// Release everything we hold. Failures are logged.
    pub async fn release_all(&self) {
        let ids: Vec<ObjectId> = self.held.read().keys().copied().collect();
        for id in ids {
            if let Err(e) = self.release(id).await {
                log::warn!("Failed to release {id}: {e}");
            }
        }
    }

    /// Re-stamp our lease. `Ok(false)` means it is gone.
    pub async fn renew(&self, id: ObjectId) -> Result<bool, SyncError> {
        let sent_at = Instant::now();
        let outcome = self.bounded(self.store.renew_lock(id, &self.peer)).await?;
        match outcome {
            LockOutcome::Granted(lease) => {
                log::trace!("Renewed lock on {id}");
                self.held.write().insert(id, HeldLease { lease, sent_at });
                Ok(true)
            }
            LockOutcome::Denied(lease) => {
                self.mark_lost(id, Some(lease));
                Ok(false)
            }
            LockOutcome::Free | LockOutcome::Missing => {
                self.mark_lost(id, None);
                Ok(false)
            }
        }
    }

    /// Renew once the lease is half-way to expiry. Returns whether we still
    /// hold it.
    pub async fn renew_if_due(&self, id: ObjectId) -> Result<bool, SyncError> {
        let due = match self.held.read().get(&id) {
            Some(held) => held.age() >= held.lease.ttl() / 2,
            None => return Ok(false),
        };
        if !self.renew_on_activity || !due {
            return Ok(self.is_holding(id));
        }
        self.renew(id).await
    }

    /// Whether we hold an unexpired lease on `id`.
    pub fn is_holding(&self, id: ObjectId) -> bool {
        self.held.read().get(&id).is_some_and(HeldLease::is_live)
    }

    /// The currently valid lease on `id`, ours or someone else's.
    pub fn holder_of(&self, id: ObjectId) -> Option<LockLease> {
        if let Some(held) = self.held.read().get(&id) {
            if held.is_live() {
                return Some(held.lease.clone());
            }
        }
        let now = self.clock.now_ms();
        self.observed
            .read()
            .get(&id)
            .filter(|lease| lease.holder != self.peer.peer_id && !is_expired(Some(lease), now))
            .cloned()
    }

    /// Ids of every lease we believe we hold.
    pub fn held_ids(&self) -> Vec<ObjectId> {
        self.held.read().keys().copied().collect()
    }

    /// Feed one lease transition from the change feed.
    ///
    /// Transitions must arrive in feed order. A direct hand-over between two
    /// holders before the first lease expired is reported as an invariant
    /// violation; the store's value is still adopted.
    pub fn observe(&self, id: ObjectId, lock: Option<LockLease>) -> Result<(), SyncError> {
        self.announced.lock().remove(&id);

        let previous = match &lock {
            Some(lease) => self.observed.write().insert(id, lease.clone()),
            None => self.observed.write().remove(&id),
        };

        if let Some(new) = &lock {
            if new.holder != self.peer.peer_id {
                let ours = self.held.read().get(&id).cloned();
                // Echoes older than our grant are stale; a real reclaim is
                // stamped after our lease expired.
                if ours.is_some_and(|ours| new.acquired_at_ms > ours.lease.acquired_at_ms) {
                    self.mark_lost(id, Some(new.clone()));
                }
            }

            // Older or same-instant stamps are replays after a resync.
            if let Some(prev) = previous {
                let gap = new.acquired_at_ms.saturating_sub(prev.acquired_at_ms);
                if prev.holder != new.holder && gap > 0 && gap < prev.ttl_ms {
                    return Err(SyncError::InvariantViolation {
                        id,
                        detail: format!(
                            "lease handed from {} to {} after {gap}ms without expiry or release",
                            prev.holder_label, new.holder_label
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Reset local lease knowledge for `id` from an authoritative snapshot.
    pub fn reset(&self, id: ObjectId, lock: Option<LockLease>) {
        self.announced.lock().remove(&id);
        match lock {
            Some(lease) => {
                if lease.holder != self.peer.peer_id && self.held.read().contains_key(&id) {
                    self.mark_lost(id, Some(lease.clone()));
                }
                self.observed.write().insert(id, lease);
            }
            None => {
                self.observed.write().remove(&id);
            }
        }
    }

    /// Drop everything known about a deleted object.
    pub fn forget(&self, id: ObjectId) {
        self.observed.write().remove(&id);
        self.announced.lock().remove(&id);
        if self.held.write().remove(&id).is_some() {
            let _ = self.events.send(LockEvent::Lost { id, by: None });
        }
    }

    /// Forget every object missing from an authoritative listing.
    pub fn forget_unlisted(&self, listed: &HashSet<ObjectId>) -> Vec<ObjectId> {
        let mut known: HashSet<ObjectId> = self.held.read().keys().copied().collect();
        known.extend(self.observed.read().keys().copied());
        let gone: Vec<ObjectId> = known.into_iter().filter(|id| !listed.contains(id)).collect();
        for id in &gone {
            self.forget(*id);
        }
        gone
    }

    /// Local expiry check over every known lease.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now_ms();
        let mut report = SweepReport::default();

        let lapsed: Vec<ObjectId> = self
            .held
            .read()
            .iter()
            .filter(|(_, held)| !held.is_live())
            .map(|(id, _)| *id)
            .collect();
        for id in lapsed {
            log::info!("Lease on {id} expired locally");
            self.mark_lost(id, None);
            report.lost.push(id);
        }

        let mut announced = self.announced.lock();
        for (id, lease) in self.observed.read().iter() {
            if lease.holder == self.peer.peer_id || !is_expired(Some(lease), now) {
                continue;
            }
            if announced.insert(*id) {
                log::debug!("Lease of {} on {id} expired; reclaimable", lease.holder_label);
                let _ = self.events.send(LockEvent::Reclaimable { id: *id });
                report.reclaimable.push(*id);
            }
        }
        report
    }

    /// Run [`Self::sweep`] every `every`.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.sweep();
            }
        })
    }

    /// Forget our lease on `id` and announce the loss once.
    pub fn mark_lost(&self, id: ObjectId, by: Option<LockLease>) {
        if self.held.write().remove(&id).is_some() {
            log::info!(
                "Lost lock on {id}{}",
                by.as_ref()
                    .map(|lease| format!(" to {}", lease.holder_label))
                    .unwrap_or_default()
            );
            let _ = self.events.send(LockEvent::Lost { id, by });
        }
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T, StoreError>>) -> Result<T, SyncError> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(StoreError::Timeout.into()),
        }
    }
}
