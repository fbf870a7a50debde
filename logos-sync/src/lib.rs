//! # logos-sync — Lock-based object synchronization for Logos
//!
//! Multiple clients edit a shared collection of canvas objects. An object is
//! edited by at most one client at a time, under a lease that expires on its
//! own; edits are shown locally at once and committed in coalesced batches
//! guarded by a version check. Cursor presence travels on a separate,
//! throttled, loss-tolerant channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────── Workspace (per client) ────────────────────┐
//! │ LockManager   OptimisticController   ChangeReconciler          │
//! │      │                 │                    ▲                  │
//! │      └──── LocalView ◄─┴────────────────────┤                  │
//! │ PresenceBroadcaster                         │ change feed      │
//! └──────────────┬──────────────────────────────┴──────────────────┘
//!                ▼
//!     ObjectStore + PresenceStore
//!     ├── MemoryStore                (single process, tests)
//!     ├── RocksStore                 (durable, LZ4 + bincode records)
//!     └── RemoteStore ── WebSocket ── StoreServer ── Memory/RocksStore
//! ```
//!
//! ## Modules
//!
//! - [`object`] — Object model, patches, leases
//! - [`store`] — Store traits and backends
//! - [`lock`] — Lease acquisition, observation and expiry
//! - [`view`] — Confirmed state plus pending local deltas
//! - [`optimistic`] — Throttled, version-guarded flushes
//! - [`reconciler`] — Folding the change feed into the view
//! - [`presence`] — Ephemeral cursor presence
//! - [`workspace`] — The per-session facade
//! - [`protocol`], [`server`], [`client`] — Store access over WebSocket

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod lock;
pub mod object;
pub mod optimistic;
pub mod presence;
pub mod protocol;
pub mod reconciler;
pub mod server;
pub mod store;
pub mod view;
pub mod workspace;

// Re-exports for convenience
pub use client::{ConnectionState, RemoteStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackoffPolicy, DeletePolicy, LeasePolicy, Settings, SyncConfig};
pub use error::{ConfigError, StoreError, SyncError};
pub use event::{Notice, ObjectEvent};
pub use lock::{LockEvent, LockManager, LockResult};
pub use object::{
    ClientId, Color, EditableObject, LockLease, ObjectId, ObjectPatch, ObjectState, PatchError, PeerInfo, Shape, Vec2,
};
pub use optimistic::FlushOutcome;
pub use presence::{PresenceBroadcaster, PresenceMap, PresenceRecord};
pub use server::{Backend, ServerConfig, ServerStats, StoreServer};
pub use store::{
    CommitOutcome, CommitRequest, DeleteOutcome, LockOutcome, MemoryStore, ObjectChange, ObjectStore,
    PresenceChange, PresenceStore, RocksStore, RocksStoreConfig, StoreStats,
};
pub use workspace::Workspace;
