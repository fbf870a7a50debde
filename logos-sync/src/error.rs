//! Error taxonomy.
//!
//! | Class                | Recoverable | Retried | Surfaced as                 |
//! |----------------------|-------------|---------|-----------------------------|
//! | `LockDenied`         | yes         | no      | "held by X" notice          |
//! | `StaleWriteConflict` | yes         | no      | rollback + notice           |
//! | `Transport`          | yes         | bounded | demoted to conflict         |
//! | `InvariantViolation` | n/a         | no      | `log::error!` + forced sync |

use thiserror::Error;

use crate::object::{ClientId, ObjectId, PatchError};

/// Failures talking to an object/presence store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store reported: {0}")]
    Remote(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Engine-level errors returned by [`crate::Workspace`] operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("object {id} is held by {holder_label}")]
    LockDenied {
        id: ObjectId,
        holder: Option<ClientId>,
        holder_label: String,
    },

    #[error("write to {id} based on version {base_version} lost to version {current_version}; rolled back")]
    StaleWriteConflict {
        id: ObjectId,
        base_version: u64,
        current_version: u64,
    },

    #[error(transparent)]
    Transport(#[from] StoreError),

    #[error("store invariant violated on {id}: {detail}")]
    InvariantViolation { id: ObjectId, detail: String },

    #[error("object not found: {0}")]
    NotFound(ObjectId),

    #[error("invalid patch: {0}")]
    InvalidPatch(#[from] PatchError),

    #[error("not permitted to delete {id}")]
    NotPermitted { id: ObjectId },

    #[error("{0}")]
    Config(String),
}

impl SyncError {
    /// Everything except a store-side invariant breach leaves the engine usable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SyncError::InvariantViolation { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}

impl From<ConfigError> for SyncError {
    fn from(e: ConfigError) -> Self {
        SyncError::Config(e.to_string())
    }
}

/// Configuration loading/validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
