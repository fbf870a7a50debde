//! Ephemeral presence: live cursor positions of every client.
//!
//! ## Architecture
//!
//! ```text
//! Local pointer move
//!       │
//!       ▼
//! PresenceBroadcaster::publish()
//!       │  (throttled: 33ms, latest value wins)
//!       ▼
//! PresenceStore::put_presence()      one record per client, overwritten
//!       │
//!       ▼   (PresenceChange feed)
//! Remote PresenceBroadcaster listener
//!       │
//!       ▼
//! watch::Receiver<PresenceMap>       teleport: direct overwrite
//! ```
//!
//! Presence never blocks editing. Every store failure here is logged and
//! dropped; the worst case is "no remote cursors visible".

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::object::{ClientId, Color, PeerInfo, Vec2};
use crate::store::{PresenceChange, PresenceStore};

/// One client's presence record as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub client_id: ClientId,
    pub label: String,
    pub position: Vec2,
    pub color: Color,
    /// Freshness timestamp, milliseconds since the UNIX epoch.
    pub updated_at_ms: u64,
}

impl PresenceRecord {
    pub fn new(peer: &PeerInfo, position: Vec2, updated_at_ms: u64) -> Self {
        Self {
            client_id: peer.peer_id,
            label: peer.name.clone(),
            position,
            color: peer.color,
            updated_at_ms,
        }
    }

    pub fn is_stale(&self, now_ms: u64, ttl: Duration) -> bool {
        now_ms.saturating_sub(self.updated_at_ms) >= ttl.as_millis() as u64
    }
}

/// Live map of other clients' presence, keyed by client.
pub type PresenceMap = HashMap<ClientId, PresenceRecord>;

/// Outgoing throttle state.
#[derive(Default)]
struct Outgoing {
    /// Latest value not yet written.
    pending: Option<PresenceRecord>,
    last_sent: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    peer: PeerInfo,
    store: Arc<dyn PresenceStore>,
    clock: Arc<dyn Clock>,
    throttle: Duration,
    ttl: Duration,
    outgoing: Mutex<Outgoing>,
    peers: watch::Sender<PresenceMap>,
}

/// Publishes the local cursor and maintains the map of remote cursors.
#[derive(Clone)]
pub struct PresenceBroadcaster {
    inner: Arc<Inner>,
}

impl PresenceBroadcaster {
    pub fn new(
        peer: PeerInfo,
        store: Arc<dyn PresenceStore>,
        clock: Arc<dyn Clock>,
        throttle: Duration,
        ttl: Duration,
    ) -> Self {
        let (peers, _) = watch::channel(PresenceMap::new());
        Self {
            inner: Arc::new(Inner {
                peer,
                store,
                clock,
                throttle,
                ttl,
                outgoing: Mutex::new(Outgoing::default()),
                peers,
            }),
        }
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.inner.peer
    }

    /// Overwrite our presence record.
    ///
    /// Written at once when the throttle window has passed since the last
    /// write; otherwise the value replaces any pending one and goes out when
    /// the window closes.
    pub async fn publish(&self, position: Vec2, label: &str, color: Color) {
        let mut record = PresenceRecord::new(&self.inner.peer, position, 0);
        record.label = label.to_string();
        record.color = color;

        let now = Instant::now();
        let send_now = {
            let mut out = self.inner.outgoing.lock();
            let window_open = out
                .last_sent
                .map_or(true, |sent| now >= sent + self.inner.throttle);
            if window_open && out.timer.is_none() {
                out.last_sent = Some(now);
                out.pending = None;
                true
            } else {
                out.pending = Some(record.clone());
                if out.timer.is_none() {
                    let deadline = out.last_sent.map_or(now, |sent| sent + self.inner.throttle);
                    out.timer = Some(tokio::spawn(trailing_send(self.inner.clone(), deadline)));
                }
                false
            }
        };

        if send_now {
            self.inner.send(record).await;
        } else {
            log::trace!("Presence throttled for {}", self.inner.peer.peer_id);
        }
    }

    /// Publish immediately, bypassing and resetting the throttle.
    pub async fn force_publish(&self, position: Vec2, label: &str, color: Color) {
        {
            let mut out = self.inner.outgoing.lock();
            if let Some(timer) = out.timer.take() {
                timer.abort();
            }
            out.pending = None;
            out.last_sent = Some(Instant::now());
        }
        let mut record = PresenceRecord::new(&self.inner.peer, position, 0);
        record.label = label.to_string();
        record.color = color;
        self.inner.send(record).await;
    }

    /// Live map of every other client's presence.
    pub fn subscribe(&self) -> watch::Receiver<PresenceMap> {
        self.inner.peers.subscribe()
    }

    /// Snapshot of the current remote presence map.
    pub fn peers(&self) -> PresenceMap {
        self.inner.peers.borrow().clone()
    }

    /// Replace the remote map with the store's current records.
    pub async fn resync(&self) {
        self.inner.resync().await;
    }

    /// Follow the store's presence feed until it closes.
    pub fn spawn_listener(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let mut feed = inner.store.subscribe_presence();
        tokio::spawn(async move {
            inner.resync().await;
            loop {
                match feed.recv().await {
                    Ok(change) => inner.apply(change),
                    Err(RecvError::Lagged(skipped)) => {
                        log::debug!("Presence feed lagged by {skipped}; resyncing");
                        inner.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        log::warn!("Presence feed closed; remote cursors hidden");
                        inner.peers.send_replace(PresenceMap::new());
                        break;
                    }
                }
            }
        })
    }

    /// Remove records older than the presence TTL.
    ///
    /// Each removal is conditional on the record still being stale at the
    /// store, so racing with a refresh or another pruner is harmless.
    /// Returns how many records this call removed.
    pub async fn prune_stale(&self) -> usize {
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let cutoff = now.saturating_sub(inner.ttl.as_millis() as u64);

        inner.peers.send_if_modified(|peers| {
            let before = peers.len();
            peers.retain(|_, record| !record.is_stale(now, inner.ttl));
            peers.len() != before
        });

        let records = match inner.store.list_presence().await {
            Ok(records) => records,
            Err(e) => {
                log::warn!("Presence GC skipped: {e}");
                return 0;
            }
        };

        let mut removed = 0;
        for record in records {
            if record.client_id == inner.peer.peer_id || !record.is_stale(now, inner.ttl) {
                continue;
            }
            match inner.store.remove_presence(record.client_id, Some(cutoff)).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => log::warn!("Failed to prune presence of {}: {e}", record.client_id),
            }
        }
        if removed > 0 {
            log::debug!("Pruned {removed} stale presence record(s)");
        }
        removed
    }

    /// Periodically prune stale records.
    pub fn spawn_gc(&self, every: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.prune_stale().await;
            }
        })
    }

    /// Drop any pending write and remove our record.
    pub async fn leave(&self) {
        {
            let mut out = self.inner.outgoing.lock();
            if let Some(timer) = out.timer.take() {
                timer.abort();
            }
            out.pending = None;
        }
        if let Err(e) = self
            .inner
            .store
            .remove_presence(self.inner.peer.peer_id, None)
            .await
        {
            log::warn!("Failed to remove presence on leave: {e}");
        }
    }
}

impl Inner {
    async fn send(&self, mut record: PresenceRecord) {
        record.updated_at_ms = self.clock.now_ms();
        log::trace!(
            "Presence {} -> ({:.1}, {:.1})",
            record.client_id,
            record.position.x,
            record.position.y
        );
        if let Err(e) = self.store.put_presence(record).await {
            log::warn!("Presence publish failed: {e}");
        }
    }

    fn apply(&self, change: PresenceChange) {
        match change {
            PresenceChange::Updated(record) => {
                if record.client_id == self.peer.peer_id {
                    return;
                }
                self.peers.send_modify(|peers| {
                    peers.insert(record.client_id, record);
                });
            }
            PresenceChange::Removed(client_id) => {
                self.peers.send_if_modified(|peers| peers.remove(&client_id).is_some());
            }
        }
    }

    async fn resync(&self) {
        match self.store.list_presence().await {
            Ok(records) => {
                let now = self.clock.now_ms();
                let peers = records
                    .into_iter()
                    .filter(|r| r.client_id != self.peer.peer_id && !r.is_stale(now, self.ttl))
                    .map(|r| (r.client_id, r))
                    .collect();
                self.peers.send_replace(peers);
            }
            Err(e) => log::warn!("Presence resync failed: {e}"),
        }
    }
}

async fn trailing_send(inner: Arc<Inner>, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    let pending = {
        let mut out = inner.outgoing.lock();
        out.timer = None;
        out.last_sent = Some(Instant::now());
        out.pending.take()
    };
    if let Some(record) = pending {
        inner.send(record).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    const THROTTLE: Duration = Duration::from_millis(33);
    const TTL: Duration = Duration::from_millis(30_000);

    fn setup(clock: Arc<ManualClock>) -> (Arc<MemoryStore>, PresenceBroadcaster) {
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let peer = PeerInfo::new("Alice");
        let broadcaster = PresenceBroadcaster::new(peer, store.clone(), clock, THROTTLE, TTL);
        (store, broadcaster)
    }

    #[test]
    fn test_record_staleness() {
        let peer = PeerInfo::new("Bob");
        let record = PresenceRecord::new(&peer, Vec2::ZERO, 1_000);
        assert!(!record.is_stale(30_999, TTL));
        assert!(record.is_stale(31_000, TTL));
        assert!(!record.is_stale(0, TTL));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_throttles_to_latest() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (store, presence) = setup(clock);
        let color = presence.peer().color;

        presence.publish(Vec2::new(1.0, 1.0), "Alice", color).await;
        presence.publish(Vec2::new(2.0, 2.0), "Alice", color).await;
        presence.publish(Vec2::new(3.0, 3.0), "Alice", color).await;

        let records = store.list_presence().await.unwrap();
        assert_eq!(records[0].position, Vec2::new(1.0, 1.0));

        tokio::time::sleep(THROTTLE * 2).await;
        let records = store.list_presence().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].position, Vec2::new(3.0, 3.0));
        assert_eq!(store.stats().presence_writes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_publish_cancels_trailing_write() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (store, presence) = setup(clock);
        let color = presence.peer().color;

        presence.publish(Vec2::new(1.0, 1.0), "Alice", color).await;
        presence.publish(Vec2::new(2.0, 2.0), "Alice", color).await;
        presence.force_publish(Vec2::new(9.0, 9.0), "Alice", color).await;

        tokio::time::sleep(THROTTLE * 3).await;
        let records = store.list_presence().await.unwrap();
        assert_eq!(records[0].position, Vec2::new(9.0, 9.0));
        assert_eq!(store.stats().presence_writes, 2);
    }

    #[tokio::test]
    async fn test_prune_skips_refreshed_records() {
        let clock = Arc::new(ManualClock::new(0));
        let (store, presence) = setup(clock.clone());
        let bob = PeerInfo::new("Bob");
        let carol = PeerInfo::new("Carol");

        store.put_presence(PresenceRecord::new(&bob, Vec2::ZERO, 0)).await.unwrap();
        store.put_presence(PresenceRecord::new(&carol, Vec2::ZERO, 25_000)).await.unwrap();

        clock.set(40_000);
        assert_eq!(presence.prune_stale().await, 1);
        assert_eq!(presence.prune_stale().await, 0);

        let left: Vec<_> = store.list_presence().await.unwrap().into_iter().map(|r| r.client_id).collect();
        assert_eq!(left, vec![carol.peer_id]);
    }
}
