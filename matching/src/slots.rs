//! Slot arena for columnar storage
//!
//! Hands out slot indices into a set of parallel columns, recycles freed
//! ones, and tracks which slots hold live rows. Columns themselves live with
//! the owner; the arena tells it when to grow them.

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::{MatchError, MatchResult};

/// Observer told about every resize as `(old_capacity, new_capacity)`.
/// Raw indices held across a resize stay valid; references do not.
pub type ResizeObserver = Box<dyn FnMut(usize, usize) + Send>;

pub struct SlotArena {
    capacity: usize,
    /// Free slots, smallest index handed out first.
    freed: BTreeSet<usize>,
    valid: BTreeSet<usize>,
    observers: Vec<ResizeObserver>,
}

impl std::fmt::Debug for SlotArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotArena")
            .field("capacity", &self.capacity)
            .field("freed", &self.freed)
            .field("valid", &self.valid)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl SlotArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            freed: (0..capacity).collect(),
            valid: BTreeSet::new(),
            observers: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.valid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }

    pub fn is_valid(&self, index: usize) -> bool {
        self.valid.contains(&index)
    }

    pub fn valid_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.valid.iter().copied()
    }

    pub fn freed_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.freed.iter().copied()
    }

    pub fn on_resize(&mut self, observer: ResizeObserver) {
        self.observers.push(observer);
    }

    /// Take a free slot. `None` means the owner must grow first.
    pub fn try_insert(&mut self) -> Option<usize> {
        let index = self.freed.pop_first()?;
        self.valid.insert(index);
        Some(index)
    }

    pub fn free(&mut self, index: usize) -> bool {
        if !self.valid.remove(&index) {
            return false;
        }
        self.freed.insert(index);
        true
    }

    /// Capacity to grow to when full: double, at least one slot.
    pub fn next_capacity(&self) -> MatchResult<usize> {
        self.capacity
            .max(1)
            .checked_mul(2)
            .filter(|n| *n <= isize::MAX as usize)
            .ok_or(MatchError::CapacityOverflow {
                requested: usize::MAX,
            })
    }

    /// Record a grown capacity; new slots become free. The owner grows its
    /// columns before calling this.
    pub fn grow(&mut self, new_capacity: usize) {
        let old = self.capacity;
        if new_capacity <= old {
            return;
        }
        self.freed.extend(old..new_capacity);
        self.capacity = new_capacity;
        debug!("Slot arena resized {} -> {}", old, new_capacity);
        for observer in &mut self.observers {
            observer(old, new_capacity);
        }
    }

    pub fn clear(&mut self) {
        self.valid.clear();
        self.freed = (0..self.capacity).collect();
    }
}

/// Grow a column to `capacity`, filling new slots with defaults.
pub fn grow_column<T: Default>(column: &mut Vec<T>, capacity: usize) {
    column.resize_with(capacity, T::default);
}
