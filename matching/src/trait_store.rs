//! Trait Store
//!
//! Maps (data id, trait name) to a typed value. One typed store exists per
//! value kind; a trait name is bound to the kind it was first written with.
//! An entity exists while it carries at least one trait.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{trace, warn};

use crate::components::{DataId, Pose, TraitKind, TraitRequirement, TraitValue, Vec2, Vec3};
use crate::error::{MatchError, MatchResult};

// ============================================================================
// Typed stores
// ============================================================================

/// All values of one kind, keyed by trait name then data id.
#[derive(Debug, Clone)]
pub struct TypedTraitStore<T> {
    values: HashMap<String, BTreeMap<DataId, T>>,
}

impl<T> Default for TypedTraitStore<T> {
    fn default() -> Self {
        Self {
            values: HashMap::new(),
        }
    }
}

impl<T> TypedTraitStore<T> {
    pub fn try_get(&self, id: DataId, name: &str) -> Option<&T> {
        self.values.get(name)?.get(&id)
    }

    /// Insert or overwrite. Returns true when the trait was new for `id`.
    fn set(&mut self, id: DataId, name: &str, value: T) -> bool {
        if let Some(by_id) = self.values.get_mut(name) {
            return by_id.insert(id, value).is_none();
        }
        self.values
            .entry(name.to_string())
            .or_default()
            .insert(id, value)
            .is_none()
    }

    fn remove(&mut self, id: DataId, name: &str) -> bool {
        self.values
            .get_mut(name)
            .map(|by_id| by_id.remove(&id).is_some())
            .unwrap_or(false)
    }

    fn contains(&self, id: DataId, name: &str) -> bool {
        self.try_get(id, name).is_some()
    }

    /// Ids carrying `name`, ascending.
    fn ids(&self, name: &str) -> impl Iterator<Item = DataId> + '_ {
        self.values
            .get(name)
            .into_iter()
            .flat_map(|by_id| by_id.keys().copied())
    }

    fn count(&self, name: &str) -> usize {
        self.values.get(name).map(BTreeMap::len).unwrap_or(0)
    }
}

/// A Rust type stored in one of the typed trait stores.
pub trait TraitType: Sized + Clone {
    const KIND: TraitKind;
    fn store(db: &TraitDatabase) -> &TypedTraitStore<Self>;
}

macro_rules! impl_trait_type {
    ($ty:ty, $kind:ident, $field:ident) => {
        impl TraitType for $ty {
            const KIND: TraitKind = TraitKind::$kind;
            fn store(db: &TraitDatabase) -> &TypedTraitStore<Self> {
                &db.$field
            }
        }
    };
}

impl_trait_type!(bool, Bool, bools);
impl_trait_type!(f32, Float, floats);
impl_trait_type!(i32, Int, ints);
impl_trait_type!(String, Text, texts);
impl_trait_type!(Vec2, Vec2, vec2s);
impl_trait_type!(Vec3, Vec3, vec3s);
impl_trait_type!(Pose, Pose, poses);

// ============================================================================
// Database
// ============================================================================

/// Entities touched since the last [`TraitDatabase::take_changes`].
#[derive(Debug, Default, Clone)]
pub struct TraitChanges {
    /// Entities with at least one trait added, updated or removed.
    pub changed: BTreeSet<DataId>,
    /// Entities whose last trait was removed.
    pub removed: BTreeSet<DataId>,
}

impl TraitChanges {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Every typed store plus per-entity bookkeeping.
#[derive(Debug, Default)]
pub struct TraitDatabase {
    bools: TypedTraitStore<bool>,
    floats: TypedTraitStore<f32>,
    ints: TypedTraitStore<i32>,
    texts: TypedTraitStore<String>,
    vec2s: TypedTraitStore<Vec2>,
    vec3s: TypedTraitStore<Vec3>,
    poses: TypedTraitStore<Pose>,
    kinds: HashMap<String, TraitKind>,
    trait_counts: BTreeMap<DataId, usize>,
    changes: TraitChanges,
}

impl TraitDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trait that `id` does not carry yet. Returns false (and leaves
    /// the value untouched) if it already does.
    pub fn add(&mut self, id: DataId, name: &str, value: impl Into<TraitValue>) -> MatchResult<bool> {
        let value = value.into();
        self.check_write(id, name, value.kind())?;
        if self.contains(id, name) {
            return Ok(false);
        }
        self.write(id, name, value);
        Ok(true)
    }

    /// Overwrite a trait `id` already carries. Returns false if it does not.
    pub fn update(&mut self, id: DataId, name: &str, value: impl Into<TraitValue>) -> MatchResult<bool> {
        let value = value.into();
        self.check_write(id, name, value.kind())?;
        if !self.contains(id, name) {
            return Ok(false);
        }
        self.write(id, name, value);
        Ok(true)
    }

    pub fn add_or_update(&mut self, id: DataId, name: &str, value: impl Into<TraitValue>) -> MatchResult<()> {
        let value = value.into();
        self.check_write(id, name, value.kind())?;
        self.write(id, name, value);
        Ok(())
    }

    /// Remove one trait. Removing the last trait of an entity removes the entity.
    pub fn remove(&mut self, id: DataId, name: &str) -> bool {
        let Some(kind) = self.kinds.get(name).copied() else {
            return false;
        };
        let removed = match kind {
            TraitKind::Bool => self.bools.remove(id, name),
            TraitKind::Float => self.floats.remove(id, name),
            TraitKind::Int => self.ints.remove(id, name),
            TraitKind::Text => self.texts.remove(id, name),
            TraitKind::Vec2 => self.vec2s.remove(id, name),
            TraitKind::Vec3 => self.vec3s.remove(id, name),
            TraitKind::Pose => self.poses.remove(id, name),
        };
        if !removed {
            return false;
        }

        self.changes.changed.insert(id);
        if let Some(count) = self.trait_counts.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.trait_counts.remove(&id);
                self.changes.removed.insert(id);
                trace!("Entity {} removed with its last trait", id);
            }
        }
        true
    }

    /// Remove every trait of an entity.
    pub fn remove_entity(&mut self, id: DataId) -> bool {
        if !self.trait_counts.contains_key(&id) {
            return false;
        }
        let names: Vec<String> = self.kinds.keys().cloned().collect();
        for name in names {
            self.remove(id, &name);
        }
        true
    }

    pub fn try_get<T: TraitType>(&self, id: DataId, name: &str) -> Option<&T> {
        if self.kinds.get(name) != Some(&T::KIND) {
            return None;
        }
        T::store(self).try_get(id, name)
    }

    /// Owned copy of a trait value, whatever its kind.
    pub fn get_value(&self, id: DataId, name: &str) -> Option<TraitValue> {
        let kind = *self.kinds.get(name)?;
        match kind {
            TraitKind::Bool => self.bools.try_get(id, name).copied().map(TraitValue::Bool),
            TraitKind::Float => self.floats.try_get(id, name).copied().map(TraitValue::Float),
            TraitKind::Int => self.ints.try_get(id, name).copied().map(TraitValue::Int),
            TraitKind::Text => self.texts.try_get(id, name).cloned().map(TraitValue::Text),
            TraitKind::Vec2 => self.vec2s.try_get(id, name).copied().map(TraitValue::Vec2),
            TraitKind::Vec3 => self.vec3s.try_get(id, name).copied().map(TraitValue::Vec3),
            TraitKind::Pose => self.poses.try_get(id, name).copied().map(TraitValue::Pose),
        }
    }

    pub fn contains(&self, id: DataId, name: &str) -> bool {
        match self.kinds.get(name) {
            Some(kind) => self.contains_kind(id, name, *kind),
            None => false,
        }
    }

    pub fn contains_entity(&self, id: DataId) -> bool {
        self.trait_counts.contains_key(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.trait_counts.len()
    }

    pub fn kind_of(&self, name: &str) -> Option<TraitKind> {
        self.kinds.get(name).copied()
    }

    /// Whether `id` carries every requirement with the required kind.
    pub fn satisfies(&self, id: DataId, requirements: &[TraitRequirement]) -> bool {
        requirements
            .iter()
            .all(|req| self.kinds.get(&req.name) == Some(&req.kind) && self.contains_kind(id, &req.name, req.kind))
    }

    /// Fill `out` with every entity satisfying `requirements`, ascending.
    /// With no requirements every entity qualifies.
    pub fn collect_entities_with(&self, requirements: &[TraitRequirement], out: &mut Vec<DataId>) {
        out.clear();
        let Some(narrowest) = requirements.iter().min_by_key(|req| self.count_with(req)) else {
            out.extend(self.trait_counts.keys().copied());
            return;
        };
        if self.kinds.get(&narrowest.name) != Some(&narrowest.kind) {
            return;
        }
        let ids: Box<dyn Iterator<Item = DataId> + '_> = match narrowest.kind {
            TraitKind::Bool => Box::new(self.bools.ids(&narrowest.name)),
            TraitKind::Float => Box::new(self.floats.ids(&narrowest.name)),
            TraitKind::Int => Box::new(self.ints.ids(&narrowest.name)),
            TraitKind::Text => Box::new(self.texts.ids(&narrowest.name)),
            TraitKind::Vec2 => Box::new(self.vec2s.ids(&narrowest.name)),
            TraitKind::Vec3 => Box::new(self.vec3s.ids(&narrowest.name)),
            TraitKind::Pose => Box::new(self.poses.ids(&narrowest.name)),
        };
        out.extend(ids.filter(|id| self.satisfies(*id, requirements)));
    }

    /// Hand over the entities touched since the previous call.
    pub fn take_changes(&mut self) -> TraitChanges {
        mem::take(&mut self.changes)
    }

    fn count_with(&self, req: &TraitRequirement) -> usize {
        match req.kind {
            TraitKind::Bool => self.bools.count(&req.name),
            TraitKind::Float => self.floats.count(&req.name),
            TraitKind::Int => self.ints.count(&req.name),
            TraitKind::Text => self.texts.count(&req.name),
            TraitKind::Vec2 => self.vec2s.count(&req.name),
            TraitKind::Vec3 => self.vec3s.count(&req.name),
            TraitKind::Pose => self.poses.count(&req.name),
        }
    }

    fn contains_kind(&self, id: DataId, name: &str, kind: TraitKind) -> bool {
        match kind {
            TraitKind::Bool => self.bools.contains(id, name),
            TraitKind::Float => self.floats.contains(id, name),
            TraitKind::Int => self.ints.contains(id, name),
            TraitKind::Text => self.texts.contains(id, name),
            TraitKind::Vec2 => self.vec2s.contains(id, name),
            TraitKind::Vec3 => self.vec3s.contains(id, name),
            TraitKind::Pose => self.poses.contains(id, name),
        }
    }

    pub(crate) fn check_write(&self, id: DataId, name: &str, kind: TraitKind) -> MatchResult<()> {
        if !id.is_valid() {
            return Err(MatchError::ReservedDataId(id));
        }
        match self.kinds.get(name) {
            Some(existing) if *existing != kind => Err(MatchError::TraitTypeMismatch {
                name: name.to_string(),
                expected: *existing,
                found: kind,
            }),
            _ => Ok(()),
        }
    }

    fn write(&mut self, id: DataId, name: &str, value: TraitValue) {
        if !self.kinds.contains_key(name) {
            self.kinds.insert(name.to_string(), value.kind());
        }
        let inserted = match value {
            TraitValue::Bool(v) => self.bools.set(id, name, v),
            TraitValue::Float(v) => self.floats.set(id, name, v),
            TraitValue::Int(v) => self.ints.set(id, name, v),
            TraitValue::Text(v) => self.texts.set(id, name, v),
            TraitValue::Vec2(v) => self.vec2s.set(id, name, v),
            TraitValue::Vec3(v) => self.vec3s.set(id, name, v),
            TraitValue::Pose(v) => self.poses.set(id, name, v),
        };
        if inserted {
            *self.trait_counts.entry(id).or_insert(0) += 1;
            self.changes.removed.remove(&id);
        }
        self.changes.changed.insert(id);
    }
}

// ============================================================================
// Provider write queue
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum TraitWrite {
    Set {
        id: DataId,
        name: String,
        value: TraitValue,
    },
    Remove {
        id: DataId,
        name: String,
    },
}

/// Cloneable handle trait providers write through from any thread. Writes
/// become visible when the engine drains the queue at the start of a tick.
#[derive(Debug, Clone, Default)]
pub struct TraitWriteQueue {
    pending: Arc<Mutex<Vec<TraitWrite>>>,
}

impl TraitWriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_or_update(&self, id: DataId, name: &str, value: impl Into<TraitValue>) {
        self.push(TraitWrite::Set {
            id,
            name: name.to_string(),
            value: value.into(),
        });
    }

    pub fn remove(&self, id: DataId, name: &str) {
        self.push(TraitWrite::Remove {
            id,
            name: name.to_string(),
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Apply every queued write in submission order. Invalid writes are
    /// logged and skipped. Returns the number of writes applied.
    pub fn apply_to(&self, db: &mut TraitDatabase) -> usize {
        let writes = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            mem::take(&mut *pending)
        };

        let mut applied = 0;
        for write in writes {
            match write {
                TraitWrite::Set { id, name, value } => match db.add_or_update(id, &name, value) {
                    Ok(()) => applied += 1,
                    Err(e) => warn!("Dropping queued trait write for {}: {}", id, e),
                },
                TraitWrite::Remove { id, name } => {
                    if db.remove(id, &name) {
                        applied += 1;
                    }
                }
            }
        }
        applied
    }

    fn push(&self, write: TraitWrite) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::trait_names;

    #[test]
    fn test_add_update_remove() {
        let mut db = TraitDatabase::new();
        let id = DataId(3);
        assert!(db.add(id, trait_names::BOUNDS_2D, Vec2::new(1.0, 2.0)).unwrap());
        assert!(!db.add(id, trait_names::BOUNDS_2D, Vec2::new(9.0, 9.0)).unwrap());
        assert_eq!(db.try_get::<Vec2>(id, trait_names::BOUNDS_2D), Some(&Vec2::new(1.0, 2.0)));

        assert!(db.update(id, trait_names::BOUNDS_2D, Vec2::new(3.0, 4.0)).unwrap());
        assert!(!db.update(DataId(4), trait_names::BOUNDS_2D, Vec2::new(3.0, 4.0)).unwrap());
        assert_eq!(db.try_get::<Vec2>(id, trait_names::BOUNDS_2D), Some(&Vec2::new(3.0, 4.0)));

        assert!(db.remove(id, trait_names::BOUNDS_2D));
        assert!(!db.contains_entity(id));
        let changes = db.take_changes();
        assert!(changes.removed.contains(&id));
        assert!(db.take_changes().is_empty());
    }

    #[test]
    fn test_last_trait_removes_entity() {
        let mut db = TraitDatabase::new();
        let id = DataId(1);
        db.add_or_update(id, trait_names::POSE, Pose::default()).unwrap();
        db.add_or_update(id, "floor", true).unwrap();
        assert!(db.remove(id, "floor"));
        assert!(db.contains_entity(id));
        assert!(db.remove(id, trait_names::POSE));
        assert!(!db.contains_entity(id));
        assert_eq!(db.entity_count(), 0);
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let mut db = TraitDatabase::new();
        db.add_or_update(DataId(1), trait_names::POSE, Pose::default()).unwrap();
        let err = db.add_or_update(DataId(2), trait_names::POSE, Vec2::default());
        assert!(matches!(err, Err(MatchError::TraitTypeMismatch { .. })));
        assert!(db.try_get::<Vec2>(DataId(1), trait_names::POSE).is_none());
    }

    #[test]
    fn test_reserved_ids_rejected() {
        let mut db = TraitDatabase::new();
        assert!(db.add_or_update(DataId::INVALID, "floor", true).is_err());
        assert!(db
            .add_or_update(DataId::IMMEDIATE_ENVIRONMENT, trait_names::GEOLOCATION, Vec2::new(51.5, -0.1))
            .is_ok());
    }

    #[test]
    fn test_collect_entities_with_requirements() {
        let mut db = TraitDatabase::new();
        for i in 0..6 {
            db.add_or_update(DataId(i), trait_names::POSE, Pose::default()).unwrap();
            if i % 2 == 0 {
                db.add_or_update(DataId(i), trait_names::BOUNDS_2D, Vec2::new(1.0, 1.0)).unwrap();
            }
        }
        let reqs = vec![
            TraitRequirement::new(trait_names::POSE, TraitKind::Pose),
            TraitRequirement::new(trait_names::BOUNDS_2D, TraitKind::Vec2),
        ];
        let mut out = Vec::new();
        db.collect_entities_with(&reqs, &mut out);
        assert_eq!(out, vec![DataId(0), DataId(2), DataId(4)]);

        let wrong_kind = vec![TraitRequirement::new(trait_names::POSE, TraitKind::Vec2)];
        db.collect_entities_with(&wrong_kind, &mut out);
        assert!(out.is_empty());

        db.collect_entities_with(&[], &mut out);
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn test_write_queue_applies_in_order() {
        let mut db = TraitDatabase::new();
        let queue = TraitWriteQueue::new();
        let provider = queue.clone();
        provider.add_or_update(DataId(1), "floor", true);
        provider.add_or_update(DataId(1), "floor", false);
        provider.remove(DataId(2), "floor");
        assert_eq!(queue.pending_count(), 3);
        assert!(!db.contains_entity(DataId(1)));

        assert_eq!(queue.apply_to(&mut db), 2);
        assert_eq!(db.try_get::<bool>(DataId(1), "floor"), Some(&false));
        assert_eq!(queue.pending_count(), 0);
    }
}
