//! Store-side enforcement rules.
//!
//! Pure functions over a stored [`EditableObject`]. Backends call them while
//! holding their write critical section and persist/broadcast whatever they
//! changed. `now_ms` and `ttl` always come from the store itself: a lease is
//! stamped with the store's TTL when granted and judged by that stamp.

use std::time::Duration;

use crate::config::DeletePolicy;
use crate::object::{is_expired, ClientId, EditableObject, LockLease, PeerInfo};
use crate::store::{CommitOutcome, CommitRequest, DeleteOutcome, LockOutcome};

/// Conditional acquire. Re-entrant for the current holder (re-stamps).
pub fn try_lock(obj: &mut EditableObject, holder: &PeerInfo, now_ms: u64, ttl: Duration) -> LockOutcome {
    if let Some(current) = &obj.lock {
        if current.holder != holder.peer_id && !is_expired(Some(current), now_ms) {
            return LockOutcome::Denied(current.clone());
        }
    }
    let lease = LockLease::new(holder, now_ms, ttl);
    obj.lock = Some(lease.clone());
    LockOutcome::Granted(lease)
}

/// Re-stamp a lease owned by `holder`.
///
/// An expired lease nobody reclaimed yet may still be renewed by its holder;
/// that is indistinguishable from a fresh acquisition.
pub fn renew_lock(obj: &mut EditableObject, holder: &PeerInfo, now_ms: u64, ttl: Duration) -> LockOutcome {
    match &obj.lock {
        Some(current) if current.holder == holder.peer_id => {
            let lease = LockLease::new(holder, now_ms, ttl);
            obj.lock = Some(lease.clone());
            LockOutcome::Granted(lease)
        }
        Some(current) => LockOutcome::Denied(current.clone()),
        None => LockOutcome::Free,
    }
}

/// Clear the lease if `holder` owns it.
pub fn unlock(obj: &mut EditableObject, holder: ClientId) -> bool {
    match &obj.lock {
        Some(current) if current.holder == holder => {
            obj.lock = None;
            true
        }
        _ => false,
    }
}

/// Apply a flush. On success `obj` holds the new version.
pub fn commit(obj: &mut EditableObject, request: &CommitRequest, now_ms: u64) -> CommitOutcome {
    let holds_lock = obj
        .active_lock(now_ms)
        .is_some_and(|lease| lease.holder == request.client);
    if !holds_lock {
        return CommitOutcome::LockLost { current: obj.clone() };
    }
    if request.base_version != obj.version {
        return CommitOutcome::Stale { current: obj.clone() };
    }

    match request.patch.apply(&obj.state) {
        Ok(state) => {
            obj.state = state;
            obj.version += 1;
            obj.last_writer = request.client;
            CommitOutcome::Committed(obj.clone())
        }
        Err(e) => CommitOutcome::Rejected {
            current: obj.clone(),
            reason: e.to_string(),
        },
    }
}

/// Decide whether `client` may hard-delete `obj`.
pub fn may_delete(obj: &EditableObject, client: ClientId, policy: DeletePolicy, now_ms: u64) -> DeleteOutcome {
    match obj.active_lock(now_ms) {
        Some(lease) if lease.holder == client => DeleteOutcome::Deleted,
        Some(lease) => DeleteOutcome::Denied(Some(lease.clone())),
        None if policy == DeletePolicy::HolderOrCreator && obj.creator == client => DeleteOutcome::Deleted,
        None => DeleteOutcome::Denied(None),
    }
}
