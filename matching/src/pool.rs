//! Object pools for the per-row buffers
//!
//! Rows take their collections from these pools on register and hand them
//! back on remove, so steady-state matching does not allocate.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use crate::components::DataId;
use crate::conditions::{CachedTraitCollection, ConditionRatingsData};

/// A value that can be reset for reuse without dropping its allocation.
pub trait Poolable: Default {
    fn reset(&mut self);
}

impl<T: Eq + Hash> Poolable for HashSet<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

impl<T> Poolable for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

impl<K: Eq + Hash, V> Poolable for HashMap<K, V> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Free list of owned buffers. Grows on demand and never shrinks.
#[derive(Debug)]
pub struct ObjectPool<T> {
    free: Vec<T>,
    created: usize,
}

impl<T> Default for ObjectPool<T> {
    fn default() -> Self {
        Self {
            free: Vec::new(),
            created: 0,
        }
    }
}

impl<T: Poolable> ObjectPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cleared instance, reused when one is free.
    pub fn get(&mut self) -> T {
        match self.free.pop() {
            Some(item) => item,
            None => {
                self.created += 1;
                T::default()
            }
        }
    }

    pub fn recycle(&mut self, mut item: T) {
        item.reset();
        self.free.push(item);
    }

    /// Instances ever allocated by this pool.
    pub fn created(&self) -> usize {
        self.created
    }

    /// Instances waiting for reuse.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// Per-engine pools, one per buffer kind a row owns.
#[derive(Debug, Default)]
pub struct Pools {
    pub trait_caches: ObjectPool<CachedTraitCollection>,
    pub condition_ratings: ObjectPool<ConditionRatingsData>,
    pub data_id_sets: ObjectPool<HashSet<DataId>>,
    pub ratings: ObjectPool<HashMap<DataId, f32>>,
    pub index_lists: ObjectPool<Vec<usize>>,
}

impl Pools {
    pub fn new() -> Self {
        Self::default()
    }
}
