//! Identity and value types shared by every part of the engine
//!
//! Data ids, query ids, trait values and the small enums describing how a
//! query member uses the data it matches.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Identity
// ============================================================================

/// Opaque key of one piece of tracked real-world data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataId(pub i32);

impl DataId {
    /// Sentinel for "no match".
    pub const INVALID: DataId = DataId(-1);
    /// Placeholder for data that has not been assigned an id yet.
    pub const UNSET: DataId = DataId(-2);
    /// The environment the device is in (geolocation, environment tags).
    pub const IMMEDIATE_ENVIRONMENT: DataId = DataId(-3);
    /// The user of the device.
    pub const LOCAL_USER: DataId = DataId(-4);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID && self != Self::UNSET
    }

    pub fn is_reserved(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::INVALID => write!(f, "invalid"),
            Self::UNSET => write!(f, "unset"),
            Self::IMMEDIATE_ENVIRONMENT => write!(f, "environment"),
            Self::LOCAL_USER => write!(f, "local-user"),
            DataId(id) => write!(f, "{}", id),
        }
    }
}

/// Identifies one registered query instance. All members of a group share it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryMatchId(pub u64);

impl QueryMatchId {
    pub const NULL: QueryMatchId = QueryMatchId(0);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl fmt::Display for QueryMatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Consumer-side handle of the object a query member stands for.
pub type ObjectRef = hecs::Entity;

// ============================================================================
// Data use rules
// ============================================================================

/// How a query member uses the data it is matched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclusivity {
    /// Reserves the data: no other exclusive or shared member may use it.
    #[default]
    ExclusiveBestMatch,
    /// May share data with other shared members, never with an exclusive one.
    Shared,
    /// Uses any data and claims nothing.
    ReadOnly,
}

/// Where a member row is in its matching lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowState {
    /// No row is stored in this slot.
    #[default]
    Vacant,
    /// Rated against all candidates every tick.
    Seeking,
    /// Holds a committed match, only re-validated each tick.
    Tracking,
    /// Lost its match while the rest of its query keeps tracking.
    Dropped,
}

/// Where a whole query is, as seen from outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    /// Never registered, or removed without being unmatched.
    Unknown,
    /// No member holds a match.
    Seeking,
    /// At least one member holds a match.
    Tracking,
    /// Unmatched without reseeking; the query no longer exists.
    Terminated,
}

// ============================================================================
// Trait values
// ============================================================================

/// Well-known trait names written by the standard providers.
pub mod trait_names {
    pub const POSE: &str = "pose";
    pub const BOUNDS_2D: &str = "bounds2d";
    pub const GEOLOCATION: &str = "geolocation";
    pub const PLANE: &str = "plane";
    pub const MARKER: &str = "marker";
    pub const FACE: &str = "face";
    pub const ENVIRONMENT: &str = "environment";
    pub const ALIGNMENT: &str = "alignment";
    pub const EXTENTS: &str = "extents";
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Vec3) -> f32 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Position plus rotation quaternion (x, y, z, w).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: [f32; 4],
}

impl Pose {
    pub const fn at(position: Vec3) -> Self {
        Self {
            position,
            rotation: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::at(Vec3::default())
    }
}

/// The value types a trait can carry. One typed store exists per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraitKind {
    Bool,
    Float,
    Int,
    Text,
    Vec2,
    Vec3,
    Pose,
}

impl fmt::Display for TraitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraitKind::Bool => "bool",
            TraitKind::Float => "float",
            TraitKind::Int => "int",
            TraitKind::Text => "text",
            TraitKind::Vec2 => "vec2",
            TraitKind::Vec3 => "vec3",
            TraitKind::Pose => "pose",
        };
        f.write_str(name)
    }
}

/// A trait value of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TraitValue {
    Bool(bool),
    Float(f32),
    Int(i32),
    Text(String),
    Vec2(Vec2),
    Vec3(Vec3),
    Pose(Pose),
}

impl TraitValue {
    pub fn kind(&self) -> TraitKind {
        match self {
            TraitValue::Bool(_) => TraitKind::Bool,
            TraitValue::Float(_) => TraitKind::Float,
            TraitValue::Int(_) => TraitKind::Int,
            TraitValue::Text(_) => TraitKind::Text,
            TraitValue::Vec2(_) => TraitKind::Vec2,
            TraitValue::Vec3(_) => TraitKind::Vec3,
            TraitValue::Pose(_) => TraitKind::Pose,
        }
    }
}

impl From<bool> for TraitValue {
    fn from(v: bool) -> Self {
        TraitValue::Bool(v)
    }
}

impl From<f32> for TraitValue {
    fn from(v: f32) -> Self {
        TraitValue::Float(v)
    }
}

impl From<i32> for TraitValue {
    fn from(v: i32) -> Self {
        TraitValue::Int(v)
    }
}

impl From<String> for TraitValue {
    fn from(v: String) -> Self {
        TraitValue::Text(v)
    }
}

impl From<&str> for TraitValue {
    fn from(v: &str) -> Self {
        TraitValue::Text(v.to_string())
    }
}

impl From<Vec2> for TraitValue {
    fn from(v: Vec2) -> Self {
        TraitValue::Vec2(v)
    }
}

impl From<Vec3> for TraitValue {
    fn from(v: Vec3) -> Self {
        TraitValue::Vec3(v)
    }
}

impl From<Pose> for TraitValue {
    fn from(v: Pose) -> Self {
        TraitValue::Pose(v)
    }
}

/// A trait a candidate must carry, with the kind of value it must hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraitRequirement {
    pub name: String,
    pub kind: TraitKind,
}

impl TraitRequirement {
    pub fn new(name: impl Into<String>, kind: TraitKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ids() {
        assert!(!DataId::INVALID.is_valid());
        assert!(!DataId::UNSET.is_valid());
        assert!(DataId::IMMEDIATE_ENVIRONMENT.is_valid());
        assert!(DataId::LOCAL_USER.is_reserved());
        assert!(!DataId(0).is_reserved());
        assert!(QueryMatchId::default().is_null());
    }

    #[test]
    fn test_trait_value_kind() {
        assert_eq!(TraitValue::from(Vec2::new(0.5, 2.5)).kind(), TraitKind::Vec2);
        assert_eq!(TraitValue::from("floor").kind(), TraitKind::Text);
        assert_eq!(TraitValue::from(Pose::default()).kind(), TraitKind::Pose);
    }
}
