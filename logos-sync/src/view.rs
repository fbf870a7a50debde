//! Client-local view of the object collection.
//!
//! Per object we keep the last confirmed (store-reconciled) record and at
//! most one pending optimistic delta on top of it:
//!
//! ```text
//! visible = confirmed.state ⊕ overlay
//!
//! overlay   = in_flight ⊕ unflushed        everything not yet confirmed
//! in_flight = patch sent, awaiting ack      (at most one)
//! unflushed = patch edits since last send
//! ```
//!
//! The view is plain data. [`crate::optimistic`] and [`crate::reconciler`]
//! share it behind a mutex and never hold that mutex across a store call.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::error::SyncError;
use crate::object::{ClientId, EditableObject, ObjectId, ObjectPatch};
use crate::store::ObjectChange;

pub type SharedView = Arc<Mutex<LocalView>>;

/// Most recent deletions remembered for dropping late snapshots.
const TOMBSTONE_CAPACITY: usize = 1024;

/// Optimistic edits not yet confirmed by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDelta {
    /// Identifies this delta; a rollback starts a new epoch.
    pub epoch: u64,
    /// Version the next flush is based on.
    pub base_version: u64,
    pub overlay: ObjectPatch,
    pub unflushed: ObjectPatch,
    pub in_flight: Option<ObjectPatch>,
}

/// A flush handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushTicket {
    pub id: ObjectId,
    pub epoch: u64,
    pub base_version: u64,
    pub patch: ObjectPatch,
}

/// What a remote change did to the view.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// Duplicate or older than what we have.
    Ignored,
    Upserted(EditableObject),
    /// A newer version superseded our pending delta, which was discarded.
    RolledBack {
        object: EditableObject,
        base_version: u64,
        current_version: u64,
    },
    Removed(ObjectId),
}

#[derive(Debug, Clone)]
struct Entry {
    confirmed: EditableObject,
    pending: Option<PendingDelta>,
}

impl Entry {
    fn visible(&self) -> EditableObject {
        let mut obj = self.confirmed.clone();
        if let Some(delta) = &self.pending {
            if let Ok(state) = delta.overlay.apply(&obj.state) {
                obj.state = state;
            }
        }
        obj
    }

    /// Adopt our own acknowledged write and keep unsent edits on top.
    fn confirm_in_flight(&mut self, committed: EditableObject) {
        self.confirmed = committed;
        if let Some(delta) = &mut self.pending {
            delta.in_flight = None;
            delta.base_version = self.confirmed.version;
            if delta.unflushed.is_empty() {
                self.pending = None;
            } else {
                delta.overlay = delta.unflushed.clone();
            }
        }
    }
}

#[derive(Debug)]
pub struct LocalView {
    me: ClientId,
    entries: HashMap<ObjectId, Entry>,
    /// Deleted ids; late snapshots of these are dropped.
    tombstones: HashSet<ObjectId>,
    /// Burial order, oldest first.
    buried: VecDeque<ObjectId>,
    next_epoch: u64,
}

impl LocalView {
    pub fn new(me: ClientId) -> Self {
        Self {
            me,
            entries: HashMap::new(),
            tombstones: HashSet::new(),
            buried: VecDeque::new(),
            next_epoch: 1,
        }
    }

    pub fn shared(me: ClientId) -> SharedView {
        Arc::new(Mutex::new(Self::new(me)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Confirmed state with any optimistic overlay applied.
    pub fn visible(&self, id: ObjectId) -> Option<EditableObject> {
        self.entries.get(&id).map(Entry::visible)
    }

    /// Last reconciled remote state, ignoring local edits.
    pub fn confirmed(&self, id: ObjectId) -> Option<&EditableObject> {
        self.entries.get(&id).map(|entry| &entry.confirmed)
    }

    pub fn pending(&self, id: ObjectId) -> Option<&PendingDelta> {
        self.entries.get(&id).and_then(|entry| entry.pending.as_ref())
    }

    pub fn has_unflushed(&self, id: ObjectId) -> bool {
        self.pending(id).is_some_and(|delta| !delta.unflushed.is_empty())
    }

    pub fn objects(&self) -> Vec<EditableObject> {
        self.entries.values().map(Entry::visible).collect()
    }

    /// Apply an edit optimistically and return the new visible object.
    pub fn apply_local(&mut self, id: ObjectId, patch: ObjectPatch) -> Result<EditableObject, SyncError> {
        let entry = self.entries.get_mut(&id).ok_or(SyncError::NotFound(id))?;
        patch.apply(&entry.visible().state)?;

        match &mut entry.pending {
            Some(delta) => {
                delta.overlay.merge(patch.clone());
                delta.unflushed.merge(patch);
            }
            None => {
                let epoch = self.next_epoch;
                self.next_epoch += 1;
                entry.pending = Some(PendingDelta {
                    epoch,
                    base_version: entry.confirmed.version,
                    overlay: patch.clone(),
                    unflushed: patch,
                    in_flight: None,
                });
            }
        }
        Ok(entry.visible())
    }

    /// Move unflushed edits in flight. `None` when there is nothing to send
    /// or a flush is already outstanding.
    pub fn begin_flush(&mut self, id: ObjectId) -> Option<FlushTicket> {
        let delta = self.entries.get_mut(&id)?.pending.as_mut()?;
        if delta.in_flight.is_some() || delta.unflushed.is_empty() {
            return None;
        }
        let patch = std::mem::take(&mut delta.unflushed);
        delta.in_flight = Some(patch.clone());
        Some(FlushTicket {
            id,
            epoch: delta.epoch,
            base_version: delta.base_version,
            patch,
        })
    }

    /// Adopt the store's acknowledgement of `ticket`.
    pub fn confirm(&mut self, ticket: &FlushTicket, committed: EditableObject) -> Result<EditableObject, SyncError> {
        let Some(entry) = self.entries.get_mut(&ticket.id) else {
            return Err(SyncError::NotFound(ticket.id));
        };

        if committed.version <= entry.confirmed.version {
            // Already confirmed through the change feed.
            return Ok(entry.visible());
        }
        if committed.version != ticket.base_version + 1 {
            return Err(SyncError::InvariantViolation {
                id: ticket.id,
                detail: format!(
                    "commit based on version {} produced version {}",
                    ticket.base_version, committed.version
                ),
            });
        }

        let same_epoch = entry.pending.as_ref().is_some_and(|delta| delta.epoch == ticket.epoch);
        if same_epoch {
            entry.confirm_in_flight(committed);
        } else {
            // The delta was rolled back meanwhile; only the baseline moves.
            entry.confirmed = committed;
        }
        Ok(entry.visible())
    }

    /// Discard the pending delta and adopt `current` if it is not older.
    pub fn rollback(&mut self, id: ObjectId, current: Option<EditableObject>) -> Option<EditableObject> {
        let entry = self.entries.get_mut(&id)?;
        entry.pending = None;
        if let Some(current) = current {
            if current.version >= entry.confirmed.version {
                entry.confirmed = current;
            }
        }
        Some(entry.visible())
    }

    /// Overwrite one object with the store's record, dropping local edits.
    pub fn force_sync(&mut self, obj: EditableObject) -> EditableObject {
        let id = obj.id;
        let entry = Entry { confirmed: obj, pending: None };
        let visible = entry.visible();
        self.entries.insert(id, entry);
        visible
    }

    /// Drop an object for good, pending edits included.
    pub fn remove(&mut self, id: ObjectId) -> bool {
        self.bury(id);
        self.entries.remove(&id).is_some()
    }

    fn bury(&mut self, id: ObjectId) {
        if !self.tombstones.insert(id) {
            return;
        }
        self.buried.push_back(id);
        if self.buried.len() > TOMBSTONE_CAPACITY {
            if let Some(oldest) = self.buried.pop_front() {
                self.tombstones.remove(&oldest);
            }
        }
    }

    /// Merge one change from the store feed.
    pub fn apply_remote(&mut self, change: &ObjectChange) -> Result<RemoteOutcome, SyncError> {
        match change {
            ObjectChange::Created(obj) | ObjectChange::Committed(obj) => self.apply_snapshot(obj.clone()),
            ObjectChange::LockChanged { id, lock } => match self.entries.get_mut(id) {
                Some(entry) => {
                    entry.confirmed.lock = lock.clone();
                    Ok(RemoteOutcome::Upserted(entry.visible()))
                }
                None => Ok(RemoteOutcome::Ignored),
            },
            ObjectChange::Deleted { id } => {
                if self.remove(*id) {
                    Ok(RemoteOutcome::Removed(*id))
                } else {
                    Ok(RemoteOutcome::Ignored)
                }
            }
        }
    }

    /// Replace the whole view with a store listing.
    ///
    /// Objects missing from the listing are removed. A listed version older
    /// than what we confirmed is a store-side regression; it is logged and
    /// the store's record wins.
    pub fn replace_all(&mut self, objects: Vec<EditableObject>) -> Vec<RemoteOutcome> {
        let mut outcomes = Vec::new();
        let listed: HashSet<ObjectId> = objects.iter().map(|obj| obj.id).collect();

        let gone: Vec<ObjectId> = self.entries.keys().filter(|id| !listed.contains(id)).copied().collect();
        for id in gone {
            self.remove(id);
            outcomes.push(RemoteOutcome::Removed(id));
        }

        for obj in objects {
            let id = obj.id;
            let regressed = self
                .entries
                .get(&id)
                .is_some_and(|entry| obj.version < entry.confirmed.version);
            if regressed {
                log::error!("Store listing regressed {id} to version {}; resyncing", obj.version);
                outcomes.push(RemoteOutcome::Upserted(self.force_sync(obj)));
                continue;
            }
            match self.apply_snapshot(obj) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    log::error!("{e}");
                    if let Some(entry) = self.entries.get(&id) {
                        outcomes.push(RemoteOutcome::Upserted(entry.visible()));
                    }
                }
            }
        }
        outcomes
    }

    fn apply_snapshot(&mut self, obj: EditableObject) -> Result<RemoteOutcome, SyncError> {
        if self.tombstones.contains(&obj.id) {
            return Ok(RemoteOutcome::Ignored);
        }
        let me = self.me;
        let Some(entry) = self.entries.get_mut(&obj.id) else {
            let id = obj.id;
            self.entries.insert(id, Entry { confirmed: obj, pending: None });
            return Ok(RemoteOutcome::Upserted(self.entries[&id].visible()));
        };

        if obj.version < entry.confirmed.version {
            return Ok(RemoteOutcome::Ignored);
        }
        if obj.version == entry.confirmed.version {
            if obj.state != entry.confirmed.state {
                let id = obj.id;
                entry.confirmed = obj;
                entry.pending = None;
                return Err(SyncError::InvariantViolation {
                    id,
                    detail: "two different states carry the same version".into(),
                });
            }
            if obj.lock == entry.confirmed.lock {
                return Ok(RemoteOutcome::Ignored);
            }
            entry.confirmed.lock = obj.lock;
            return Ok(RemoteOutcome::Upserted(entry.visible()));
        }

        let Some(delta) = &entry.pending else {
            entry.confirmed = obj;
            return Ok(RemoteOutcome::Upserted(entry.visible()));
        };

        let own_ack = delta.in_flight.is_some() && obj.last_writer == me && obj.version == delta.base_version + 1;
        if own_ack {
            entry.confirm_in_flight(obj);
            return Ok(RemoteOutcome::Upserted(entry.visible()));
        }

        let base_version = delta.base_version;
        let current_version = obj.version;
        entry.confirmed = obj;
        entry.pending = None;
        Ok(RemoteOutcome::RolledBack {
            object: entry.visible(),
            base_version,
            current_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{LockLease, ObjectState, PeerInfo, Shape, Vec2};
    use uuid::Uuid;

    fn setup() -> (PeerInfo, LocalView, EditableObject) {
        let me = PeerInfo::new("Alice");
        let mut view = LocalView::new(me.peer_id);
        let obj = EditableObject::new(Uuid::new_v4(), me.peer_id, ObjectState::rect(0.0, 0.0, 10.0, 10.0));
        view.apply_remote(&ObjectChange::Created(obj.clone())).unwrap();
        (me, view, obj)
    }

    fn committed(base: &EditableObject, writer: ClientId, x: f32) -> EditableObject {
        let mut next = base.clone();
        next.version += 1;
        next.last_writer = writer;
        next.state.position = Vec2::new(x, x);
        next
    }

    #[test]
    fn test_local_edit_is_visible_but_not_confirmed() {
        let (_, mut view, obj) = setup();
        let visible = view.apply_local(obj.id, ObjectPatch::move_to(5.0, 5.0)).unwrap();
        assert_eq!(visible.state.position, Vec2::new(5.0, 5.0));
        assert_eq!(view.confirmed(obj.id).unwrap().state.position, Vec2::ZERO);
        assert_eq!(view.pending(obj.id).unwrap().base_version, 1);
    }

    #[test]
    fn test_invalid_local_patch_leaves_view_untouched() {
        let (_, mut view, obj) = setup();
        let err = view
            .apply_local(obj.id, ObjectPatch::shape(Shape::Ellipse { radius_x: 1.0, radius_y: 1.0 }))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidPatch(_)));
        assert!(view.pending(obj.id).is_none());
    }

    #[test]
    fn test_edits_coalesce_into_one_ticket() {
        let (_, mut view, obj) = setup();
        for i in 1..=5 {
            view.apply_local(obj.id, ObjectPatch::move_to(i as f32, 0.0)).unwrap();
        }
        let ticket = view.begin_flush(obj.id).unwrap();
        assert_eq!(ticket.patch, ObjectPatch::move_to(5.0, 0.0));
        assert_eq!(ticket.base_version, 1);
        assert!(view.begin_flush(obj.id).is_none());
    }

    #[test]
    fn test_confirm_keeps_later_edits() {
        let (me, mut view, obj) = setup();
        view.apply_local(obj.id, ObjectPatch::move_to(3.0, 3.0)).unwrap();
        let ticket = view.begin_flush(obj.id).unwrap();
        view.apply_local(obj.id, ObjectPatch::rotate(90.0)).unwrap();

        let ack = committed(&obj, me.peer_id, 3.0);
        let visible = view.confirm(&ticket, ack).unwrap();
        assert_eq!(visible.version, 2);
        assert_eq!(visible.state.rotation, 90.0);

        let delta = view.pending(obj.id).unwrap();
        assert_eq!(delta.base_version, 2);
        assert_eq!(delta.overlay, ObjectPatch::rotate(90.0));
    }

    #[test]
    fn test_confirm_clears_delta_when_done() {
        let (me, mut view, obj) = setup();
        view.apply_local(obj.id, ObjectPatch::move_to(3.0, 3.0)).unwrap();
        let ticket = view.begin_flush(obj.id).unwrap();
        view.confirm(&ticket, committed(&obj, me.peer_id, 3.0)).unwrap();
        assert!(view.pending(obj.id).is_none());
        assert_eq!(view.visible(obj.id).unwrap().state.position, Vec2::new(3.0, 3.0));
    }

    #[test]
    fn test_confirm_with_version_gap_is_violation() {
        let (me, mut view, obj) = setup();
        view.apply_local(obj.id, ObjectPatch::move_to(3.0, 3.0)).unwrap();
        let ticket = view.begin_flush(obj.id).unwrap();
        let mut ack = committed(&obj, me.peer_id, 3.0);
        ack.version = 7;
        assert!(matches!(view.confirm(&ticket, ack), Err(SyncError::InvariantViolation { .. })));
    }

    #[test]
    fn test_own_echo_confirms_and_late_ack_is_noop() {
        let (me, mut view, obj) = setup();
        view.apply_local(obj.id, ObjectPatch::move_to(3.0, 3.0)).unwrap();
        let ticket = view.begin_flush(obj.id).unwrap();
        let ack = committed(&obj, me.peer_id, 3.0);

        let outcome = view.apply_remote(&ObjectChange::Committed(ack.clone())).unwrap();
        assert!(matches!(outcome, RemoteOutcome::Upserted(_)));
        assert!(view.pending(obj.id).is_none());

        let visible = view.confirm(&ticket, ack.clone()).unwrap();
        assert_eq!(visible, ack);
    }

    #[test]
    fn test_newer_foreign_version_rolls_back() {
        let (_, mut view, obj) = setup();
        let bob = PeerInfo::new("Bob");
        view.apply_local(obj.id, ObjectPatch::move_to(3.0, 3.0)).unwrap();
        view.begin_flush(obj.id).unwrap();
        view.apply_local(obj.id, ObjectPatch::rotate(10.0)).unwrap();

        let theirs = committed(&obj, bob.peer_id, 8.0);
        match view.apply_remote(&ObjectChange::Committed(theirs.clone())).unwrap() {
            RemoteOutcome::RolledBack { object, base_version, current_version } => {
                assert_eq!(object, theirs);
                assert_eq!((base_version, current_version), (1, 2));
            }
            other => panic!("expected rollback, got {other:?}"),
        }
        assert_eq!(view.visible(obj.id).unwrap(), theirs);
    }

    #[test]
    fn test_older_and_duplicate_versions_ignored() {
        let (me, mut view, obj) = setup();
        let v2 = committed(&obj, me.peer_id, 2.0);
        view.apply_remote(&ObjectChange::Committed(v2.clone())).unwrap();

        assert_eq!(view.apply_remote(&ObjectChange::Committed(obj.clone())).unwrap(), RemoteOutcome::Ignored);
        assert_eq!(view.apply_remote(&ObjectChange::Committed(v2.clone())).unwrap(), RemoteOutcome::Ignored);
        assert_eq!(view.confirmed(obj.id).unwrap().version, 2);
    }

    #[test]
    fn test_same_version_different_state_is_violation() {
        let (_, mut view, obj) = setup();
        let mut forged = obj.clone();
        forged.state.position = Vec2::new(99.0, 0.0);
        let err = view.apply_remote(&ObjectChange::Committed(forged.clone())).unwrap_err();
        assert!(matches!(err, SyncError::InvariantViolation { .. }));
        assert_eq!(view.visible(obj.id).unwrap(), forged);
    }

    #[test]
    fn test_lock_change_keeps_version_and_delta() {
        let (me, mut view, obj) = setup();
        view.apply_local(obj.id, ObjectPatch::move_to(3.0, 3.0)).unwrap();
        let lease = LockLease::new(&me, 10, std::time::Duration::from_secs(30));
        view.apply_remote(&ObjectChange::LockChanged { id: obj.id, lock: Some(lease.clone()) })
            .unwrap();

        let visible = view.visible(obj.id).unwrap();
        assert_eq!(visible.lock, Some(lease));
        assert_eq!(visible.version, 1);
        assert_eq!(visible.state.position, Vec2::new(3.0, 3.0));
    }

    #[test]
    fn test_delete_discards_pending_silently() {
        let (_, mut view, obj) = setup();
        view.apply_local(obj.id, ObjectPatch::move_to(3.0, 3.0)).unwrap();
        let outcome = view.apply_remote(&ObjectChange::Deleted { id: obj.id }).unwrap();
        assert_eq!(outcome, RemoteOutcome::Removed(obj.id));
        assert!(view.visible(obj.id).is_none());
        assert!(view.begin_flush(obj.id).is_none());

        let late = view.apply_remote(&ObjectChange::Committed(obj.clone())).unwrap();
        assert_eq!(late, RemoteOutcome::Ignored);
        assert!(view.visible(obj.id).is_none());
    }

    #[test]
    fn test_rollback_restores_reconciled_state() {
        let (_, mut view, obj) = setup();
        view.apply_local(obj.id, ObjectPatch::move_to(3.0, 3.0)).unwrap();
        let restored = view.rollback(obj.id, None).unwrap();
        assert_eq!(restored, obj);
        assert!(view.pending(obj.id).is_none());
    }

    #[test]
    fn test_replace_all_drops_missing_objects() {
        let (me, mut view, obj) = setup();
        let other = EditableObject::new(Uuid::new_v4(), me.peer_id, ObjectState::ellipse(0.0, 0.0, 1.0, 1.0));

        let outcomes = view.replace_all(vec![other.clone()]);
        assert!(outcomes.contains(&RemoteOutcome::Removed(obj.id)));
        assert!(outcomes.contains(&RemoteOutcome::Upserted(other.clone())));
        assert_eq!(view.objects(), vec![other]);
    }

    #[test]
    fn test_tombstones_are_bounded() {
        let (me, mut view, _) = setup();
        let ids: Vec<ObjectId> = (0..TOMBSTONE_CAPACITY + 10).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            view.remove(*id);
            view.remove(*id);
        }
        assert_eq!(view.tombstones.len(), TOMBSTONE_CAPACITY);
        assert_eq!(view.buried.len(), TOMBSTONE_CAPACITY);
        assert!(!view.tombstones.contains(&ids[0]));

        let recent = EditableObject::new(ids[ids.len() - 1], me.peer_id, ObjectState::rect(0.0, 0.0, 1.0, 1.0));
        let late = view.apply_remote(&ObjectChange::Committed(recent)).unwrap();
        assert_eq!(late, RemoteOutcome::Ignored);
    }
}
