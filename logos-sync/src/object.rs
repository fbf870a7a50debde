//! Editable canvas objects and their version ledger.
//!
//! Every object is a shared base record (identity, version, last writer,
//! creator, lease) around a closed set of shape payloads:
//!
//! ```text
//! ┌──────────────────── EditableObject ────────────────────┐
//! │ id │ version │ last_writer │ creator │ lock: LockLease? │
//! ├────────────────────────────────────────────────────────┤
//! │ ObjectState { position, rotation, fill, shape }        │
//! │                                      │                 │
//! │                 Rect | Ellipse | Text                  │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! `version` only moves on committed content writes. Lease changes are
//! tracked separately and never bump it.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Store-assigned object identity.
pub type ObjectId = Uuid;

/// Client (peer) identity.
pub type ClientId = Uuid;

// ───────────────────────────────────────────────────────────────────
// Geometry & style primitives
// ───────────────────────────────────────────────────────────────────

/// 2D position in canvas (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// RGBA color, used for shape fills and presence cursors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Stable, visually distinct color derived from a UUID.
    ///
    /// Hue comes from the UUID; saturation and lightness are fixed so every
    /// client gets a vivid cursor.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for Color {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Peer identity
// ───────────────────────────────────────────────────────────────────

/// Client identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: ClientId,
    pub name: String,
    pub color: Color,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with an explicit peer id (stable color from the id).
    pub fn with_id(peer_id: ClientId, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: Color::from_uuid(peer_id),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Shapes
// ───────────────────────────────────────────────────────────────────

/// Shape-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    Rect { width: f32, height: f32 },
    Ellipse { radius_x: f32, radius_y: f32 },
    Text { content: String, font_size: f32, width: f32 },
}

impl Shape {
    pub fn kind(&self) -> &'static str {
        match self {
            Shape::Rect { .. } => "rect",
            Shape::Ellipse { .. } => "ellipse",
            Shape::Text { .. } => "text",
        }
    }

    fn same_kind(&self, other: &Shape) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Geometry and style of one canvas object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    pub position: Vec2,
    /// Rotation in degrees.
    pub rotation: f32,
    pub fill: Color,
    pub shape: Shape,
}

impl ObjectState {
    pub fn rect(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            position: Vec2::new(x, y),
            rotation: 0.0,
            fill: Color::default(),
            shape: Shape::Rect { width, height },
        }
    }

    pub fn ellipse(x: f32, y: f32, radius_x: f32, radius_y: f32) -> Self {
        Self {
            position: Vec2::new(x, y),
            rotation: 0.0,
            fill: Color::default(),
            shape: Shape::Ellipse { radius_x, radius_y },
        }
    }

    pub fn text(x: f32, y: f32, content: impl Into<String>, font_size: f32) -> Self {
        Self {
            position: Vec2::new(x, y),
            rotation: 0.0,
            fill: Color::rgba(0.0, 0.0, 0.0, 1.0),
            shape: Shape::Text { content: content.into(), font_size, width: 200.0 },
        }
    }

    /// The patch that turns `self` into `target`.
    pub fn diff(&self, target: &ObjectState) -> ObjectPatch {
        ObjectPatch {
            position: (self.position != target.position).then_some(target.position),
            rotation: (self.rotation != target.rotation).then_some(target.rotation),
            fill: (self.fill != target.fill).then_some(target.fill),
            shape: (self.shape != target.shape).then(|| target.shape.clone()),
        }
    }
}

/// Sparse update to an [`ObjectState`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectPatch {
    pub position: Option<Vec2>,
    pub rotation: Option<f32>,
    pub fill: Option<Color>,
    pub shape: Option<Shape>,
}

/// Patch application errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatchError {
    #[error("cannot turn a {current} into a {patched}")]
    ShapeMismatch {
        current: &'static str,
        patched: &'static str,
    },
}

impl ObjectPatch {
    pub fn move_to(x: f32, y: f32) -> Self {
        Self { position: Some(Vec2::new(x, y)), ..Self::default() }
    }

    pub fn rotate(degrees: f32) -> Self {
        Self { rotation: Some(degrees), ..Self::default() }
    }

    pub fn fill(color: Color) -> Self {
        Self { fill: Some(color), ..Self::default() }
    }

    pub fn shape(shape: Shape) -> Self {
        Self { shape: Some(shape), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_none()
            && self.rotation.is_none()
            && self.fill.is_none()
            && self.shape.is_none()
    }

    /// Coalesce a newer patch on top of this one. Fields set in `newer` win.
    pub fn merge(&mut self, newer: ObjectPatch) {
        if newer.position.is_some() {
            self.position = newer.position;
        }
        if newer.rotation.is_some() {
            self.rotation = newer.rotation;
        }
        if newer.fill.is_some() {
            self.fill = newer.fill;
        }
        if newer.shape.is_some() {
            self.shape = newer.shape;
        }
    }

    /// Apply to a state, producing the patched copy.
    pub fn apply(&self, state: &ObjectState) -> Result<ObjectState, PatchError> {
        let mut next = state.clone();
        if let Some(shape) = &self.shape {
            if !state.shape.same_kind(shape) {
                return Err(PatchError::ShapeMismatch {
                    current: state.shape.kind(),
                    patched: shape.kind(),
                });
            }
            next.shape = shape.clone();
        }
        if let Some(position) = self.position {
            next.position = position;
        }
        if let Some(rotation) = self.rotation {
            next.rotation = rotation;
        }
        if let Some(fill) = self.fill {
            next.fill = fill;
        }
        Ok(next)
    }
}

// ───────────────────────────────────────────────────────────────────
// Leases
// ───────────────────────────────────────────────────────────────────

/// Exclusive, time-bounded edit lease on one object.
///
/// The store stamps both fields that bound it: when it was granted and for
/// how long. Clients learn the TTL from here instead of configuring it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub holder: ClientId,
    pub holder_label: String,
    /// Milliseconds since the UNIX epoch, stamped by the store.
    pub acquired_at_ms: u64,
    /// Validity window granted by the store.
    pub ttl_ms: u64,
}

impl LockLease {
    pub fn new(holder: &PeerInfo, acquired_at_ms: u64, ttl: Duration) -> Self {
        Self {
            holder: holder.peer_id,
            holder_label: holder.name.clone(),
            acquired_at_ms,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Store time at which the lease stops protecting its object.
    pub fn expires_at_ms(&self) -> u64 {
        self.acquired_at_ms.saturating_add(self.ttl_ms)
    }

    /// Milliseconds since the lease was (re)stamped.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.acquired_at_ms)
    }
}

/// Whether a lease no longer protects its object at store time `now_ms`.
///
/// A missing lease counts as expired: the object is free to acquire.
pub fn is_expired(lease: Option<&LockLease>, now_ms: u64) -> bool {
    match lease {
        Some(lease) => now_ms >= lease.expires_at_ms(),
        None => true,
    }
}

// ───────────────────────────────────────────────────────────────────
// Editable object
// ───────────────────────────────────────────────────────────────────

/// One canvas entity as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditableObject {
    pub id: ObjectId,
    pub state: ObjectState,
    /// Strictly increases on every committed content write.
    pub version: u64,
    pub last_writer: ClientId,
    pub creator: ClientId,
    pub lock: Option<LockLease>,
}

impl EditableObject {
    /// A freshly created object at version 1, unlocked.
    pub fn new(id: ObjectId, creator: ClientId, state: ObjectState) -> Self {
        Self {
            id,
            state,
            version: 1,
            last_writer: creator,
            creator,
            lock: None,
        }
    }

    /// The lease if it is still valid at `now_ms`.
    pub fn active_lock(&self, now_ms: u64) -> Option<&LockLease> {
        self.lock.as_ref().filter(|lease| !is_expired(Some(lease), now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(1_000);

    #[test]
    fn test_patch_apply_position_only() {
        let state = ObjectState::rect(0.0, 0.0, 10.0, 20.0);
        let next = ObjectPatch::move_to(5.0, 6.0).apply(&state).unwrap();
        assert_eq!(next.position, Vec2::new(5.0, 6.0));
        assert_eq!(next.shape, state.shape);
        assert_eq!(next.fill, state.fill);
    }

    #[test]
    fn test_patch_rejects_shape_change() {
        let state = ObjectState::rect(0.0, 0.0, 10.0, 20.0);
        let patch = ObjectPatch::shape(Shape::Ellipse { radius_x: 1.0, radius_y: 1.0 });
        let err = patch.apply(&state).unwrap_err();
        assert_eq!(
            err,
            PatchError::ShapeMismatch { current: "rect", patched: "ellipse" }
        );
    }

    #[test]
    fn test_patch_merge_later_wins() {
        let mut patch = ObjectPatch::move_to(1.0, 1.0);
        patch.merge(ObjectPatch::rotate(45.0));
        patch.merge(ObjectPatch::move_to(2.0, 3.0));

        assert_eq!(patch.position, Some(Vec2::new(2.0, 3.0)));
        assert_eq!(patch.rotation, Some(45.0));
        assert!(patch.fill.is_none());
    }

    #[test]
    fn test_diff_then_apply_reaches_target() {
        let from = ObjectState::text(0.0, 0.0, "hello", 12.0);
        let mut to = from.clone();
        to.position = Vec2::new(40.0, 2.0);
        to.shape = Shape::Text { content: "hello world".into(), font_size: 14.0, width: 200.0 };

        let patch = from.diff(&to);
        assert!(patch.rotation.is_none());
        assert_eq!(patch.apply(&from).unwrap(), to);
    }

    #[test]
    fn test_diff_of_equal_states_is_empty() {
        let state = ObjectState::ellipse(1.0, 2.0, 3.0, 4.0);
        assert!(state.diff(&state).is_empty());
    }

    #[test]
    fn test_is_expired_boundaries() {
        let peer = PeerInfo::new("Alice");
        let lease = LockLease::new(&peer, 10_000, TTL);

        assert_eq!(lease.expires_at_ms(), 11_000);
        assert!(!is_expired(Some(&lease), 10_000));
        assert!(!is_expired(Some(&lease), 10_999));
        assert!(is_expired(Some(&lease), 11_000));
        assert!(is_expired(None, 0));
    }

    #[test]
    fn test_expiry_follows_stamped_ttl() {
        let peer = PeerInfo::new("Alice");
        let short = LockLease::new(&peer, 0, Duration::from_millis(500));
        let long = LockLease::new(&peer, 0, Duration::from_millis(5_000));
        assert!(is_expired(Some(&short), 600));
        assert!(!is_expired(Some(&long), 600));
    }

    #[test]
    fn test_clock_skew_does_not_underflow() {
        let peer = PeerInfo::new("Alice");
        let lease = LockLease::new(&peer, 50_000, TTL);
        assert_eq!(lease.age_ms(10_000), 0);
        assert!(!is_expired(Some(&lease), 10_000));
    }

    #[test]
    fn test_new_object_starts_at_version_one() {
        let creator = Uuid::new_v4();
        let obj = EditableObject::new(Uuid::new_v4(), creator, ObjectState::rect(0.0, 0.0, 1.0, 1.0));
        assert_eq!(obj.version, 1);
        assert_eq!(obj.last_writer, creator);
        assert!(obj.lock.is_none());
    }

    #[test]
    fn test_active_lock_filters_expired() {
        let peer = PeerInfo::new("Alice");
        let mut obj = EditableObject::new(Uuid::new_v4(), peer.peer_id, ObjectState::rect(0.0, 0.0, 1.0, 1.0));
        obj.lock = Some(LockLease::new(&peer, 0, TTL));

        assert!(obj.active_lock(500).is_some());
        assert!(obj.active_lock(1_500).is_none());
    }

    #[test]
    fn test_peer_color_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(PeerInfo::with_id(id, "A").color, PeerInfo::with_id(id, "B").color);
    }

    #[test]
    fn test_color_components_in_range() {
        for _ in 0..50 {
            let c = Color::from_uuid(Uuid::new_v4());
            for v in c.to_array() {
                assert!((0.0..=1.0).contains(&v));
            }
        }
    }
}
