//! Events pushed to the rendering layer.

use crate::object::{EditableObject, ObjectId};

/// Low-friction user notification. Never blocks anything.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Selection refused; show "held by X".
    LockDenied { id: ObjectId, holder_label: String },
    /// Local edits were discarded in favour of `current_version`.
    RolledBack {
        id: ObjectId,
        base_version: u64,
        current_version: u64,
    },
    /// Our lease lapsed or was reclaimed mid-edit.
    LeaseLost { id: ObjectId, by: Option<String> },
    /// A flush kept failing at the transport level and was given up.
    TransportDegraded { id: ObjectId, attempts: usize, error: String },
}

impl Notice {
    pub fn object_id(&self) -> ObjectId {
        match self {
            Notice::LockDenied { id, .. }
            | Notice::RolledBack { id, .. }
            | Notice::LeaseLost { id, .. }
            | Notice::TransportDegraded { id, .. } => *id,
        }
    }
}

/// Object stream item.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    /// The visible state of an object changed (local edit or remote change).
    Upserted(EditableObject),
    Removed(ObjectId),
    Notice(Notice),
}
