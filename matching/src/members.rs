//! Parallel query-member storage
//!
//! One row per query member, every attribute in its own column so the
//! per-tick systems walk dense arrays. Slots come from a [`SlotArena`];
//! pooled buffers are taken on register and handed back on remove.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::components::{DataId, Exclusivity, ObjectRef, QueryMatchId, RowState, TraitRequirement};
use crate::conditions::{CachedTraitCollection, ConditionRatingsData, ProxyConditions};
use crate::error::{MatchError, MatchResult};
use crate::events::QueryResult;
use crate::pool::Pools;
use crate::relations::{Relation, RelationDescriptor, RelationMembership};
use crate::slots::{grow_column, ResizeObserver, SlotArena};

/// Everything needed to register one member of a query.
#[derive(Debug, Clone)]
pub struct MemberDescriptor {
    pub object: ObjectRef,
    pub conditions: ProxyConditions,
    pub trait_requirements: Vec<TraitRequirement>,
    pub exclusivity: Exclusivity,
    pub required: bool,
}

impl MemberDescriptor {
    pub fn new(object: ObjectRef) -> Self {
        Self {
            object,
            conditions: ProxyConditions::new(),
            trait_requirements: Vec::new(),
            exclusivity: Exclusivity::default(),
            required: true,
        }
    }

    pub fn conditions(mut self, conditions: ProxyConditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn require(mut self, requirement: TraitRequirement) -> Self {
        self.trait_requirements.push(requirement);
        self
    }

    pub fn exclusivity(mut self, exclusivity: Exclusivity) -> Self {
        self.exclusivity = exclusivity;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// A query as registered: its members, the relations between them, and how
/// long it may seek before giving up.
#[derive(Debug, Clone, Default)]
pub struct QueryDescriptor {
    pub members: Vec<MemberDescriptor>,
    pub relations: Vec<RelationDescriptor>,
    /// Seconds to seek before timing out; `None` uses the engine default,
    /// a negative value never times out.
    pub timeout_secs: Option<f32>,
}

impl QueryDescriptor {
    /// A query with a single member.
    pub fn single(member: MemberDescriptor) -> Self {
        Self {
            members: vec![member],
            ..Self::default()
        }
    }

    pub fn group(members: Vec<MemberDescriptor>) -> Self {
        Self {
            members,
            ..Self::default()
        }
    }

    pub fn relate(mut self, relation: Relation, first: usize, second: usize) -> Self {
        self.relations.push(RelationDescriptor {
            relation,
            members: (first, second),
        });
        self
    }

    pub fn timeout_secs(mut self, secs: f32) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Reject relations that point outside the query or at one object twice.
    pub fn validate_relations(&self) -> MatchResult<()> {
        for (relation, descriptor) in self.relations.iter().enumerate() {
            let (first, second) = descriptor.members;
            let invalid = MatchError::InvalidRelation {
                relation,
                members: descriptor.members,
            };
            let (Some(a), Some(b)) = (self.members.get(first), self.members.get(second)) else {
                return Err(invalid);
            };
            if first == second || a.object == b.object {
                return Err(invalid);
            }
        }
        Ok(())
    }
}

/// What a removed row held, handed back so the caller can report the loss.
#[derive(Debug)]
pub struct RemovedRow {
    pub index: usize,
    pub state: RowState,
    pub best_match: DataId,
    pub exclusivity: Exclusivity,
    pub result: Option<QueryResult>,
}

/// Counts of live rows per lifecycle bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberCounts {
    pub rows: usize,
    pub seeking: usize,
    pub tracking: usize,
    pub capacity: usize,
}

#[derive(Debug)]
pub struct ParallelGroupMemberData {
    arena: SlotArena,
    pub(crate) pools: Pools,

    /// Every row index registered for each query.
    pub(crate) match_id_to_index: HashMap<QueryMatchId, Vec<usize>>,

    pub(crate) query_match_ids: Vec<QueryMatchId>,
    pub(crate) states: Vec<RowState>,
    pub(crate) exclusivities: Vec<Exclusivity>,
    pub(crate) required: Vec<bool>,
    pub(crate) conditions: Vec<Option<ProxyConditions>>,
    pub(crate) trait_requirements: Vec<Option<Vec<TraitRequirement>>>,
    pub(crate) cached_traits: Vec<Option<CachedTraitCollection>>,
    pub(crate) condition_ratings: Vec<Option<ConditionRatingsData>>,
    /// Candidates that passed every condition.
    pub(crate) condition_match_sets: Vec<Option<HashSet<DataId>>>,
    /// Aggregate score of each candidate in the match set.
    pub(crate) reduced_condition_ratings: Vec<Option<HashMap<DataId, f32>>>,
    pub(crate) best_match_data_ids: Vec<DataId>,
    pub(crate) query_results: Vec<Option<QueryResult>>,
    pub(crate) object_references: Vec<Option<ObjectRef>>,
    pub(crate) relation_memberships: Vec<Vec<RelationMembership>>,

    /// Rows without a committed match.
    pub(crate) acquiring_indices: BTreeSet<usize>,
    /// Rows holding a match.
    pub(crate) updating_indices: BTreeSet<usize>,

    // Per-tick buckets, emptied by `clear_cycle_indices`
    pub(crate) filtered_acquiring_indices: Vec<usize>,
    pub(crate) potential_match_acquiring_indices: Vec<usize>,
    pub(crate) definite_match_acquire_indices: Vec<usize>,
}

impl ParallelGroupMemberData {
    pub fn new(initial_capacity: usize) -> Self {
        let mut data = Self {
            arena: SlotArena::new(0),
            pools: Pools::new(),
            match_id_to_index: HashMap::with_capacity(initial_capacity),
            query_match_ids: Vec::new(),
            states: Vec::new(),
            exclusivities: Vec::new(),
            required: Vec::new(),
            conditions: Vec::new(),
            trait_requirements: Vec::new(),
            cached_traits: Vec::new(),
            condition_ratings: Vec::new(),
            condition_match_sets: Vec::new(),
            reduced_condition_ratings: Vec::new(),
            best_match_data_ids: Vec::new(),
            query_results: Vec::new(),
            object_references: Vec::new(),
            relation_memberships: Vec::new(),
            acquiring_indices: BTreeSet::new(),
            updating_indices: BTreeSet::new(),
            filtered_acquiring_indices: Vec::new(),
            potential_match_acquiring_indices: Vec::new(),
            definite_match_acquire_indices: Vec::new(),
        };
        data.grow_columns(initial_capacity);
        data.arena.grow(initial_capacity);
        data
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register every member of a query, one row each. Nothing is stored
    /// when the query is rejected.
    pub fn register(&mut self, id: QueryMatchId, members: Vec<MemberDescriptor>) -> MatchResult<Vec<usize>> {
        if id.is_null() {
            return Err(MatchError::UnknownQuery(id));
        }
        if self.match_id_to_index.contains_key(&id) {
            warn!("Rejecting duplicate registration of query {}", id);
            return Err(MatchError::DuplicateQuery(id));
        }
        if members.is_empty() {
            return Err(MatchError::EmptyQuery);
        }
        if let Some(member) = members
            .iter()
            .position(|m| m.trait_requirements.is_empty() && m.conditions.is_empty())
        {
            return Err(MatchError::MissingTraitRequirements { member });
        }

        let needed = self.arena.len() + members.len();
        while self.arena.capacity() < needed {
            let next = self.arena.next_capacity()?;
            self.resize(next)?;
        }

        let mut indices = self.pools.index_lists.get();
        for _ in 0..members.len() {
            match self.arena.try_insert() {
                Some(index) => indices.push(index),
                None => {
                    for &index in &indices {
                        self.arena.free(index);
                    }
                    self.pools.index_lists.recycle(indices);
                    return Err(MatchError::CapacityOverflow { requested: needed });
                }
            }
        }
        for (&index, member) in indices.iter().zip(members) {
            self.add(index, id, member);
            self.acquiring_indices.insert(index);
        }
        let registered = indices.clone();
        self.match_id_to_index.insert(id, indices);
        debug!("Registered query {} at rows {:?}", id, registered);
        Ok(registered)
    }

    fn add(&mut self, index: usize, id: QueryMatchId, member: MemberDescriptor) {
        let mut ratings = self.pools.condition_ratings.get();
        ratings.prepare(member.conditions.len());

        self.query_match_ids[index] = id;
        self.states[index] = RowState::Seeking;
        self.object_references[index] = Some(member.object);
        self.exclusivities[index] = member.exclusivity;
        self.required[index] = member.required;
        self.best_match_data_ids[index] = DataId::INVALID;
        self.cached_traits[index] = Some(self.pools.trait_caches.get());
        self.conditions[index] = Some(member.conditions);
        self.trait_requirements[index] = Some(member.trait_requirements);
        self.relation_memberships[index].clear();
        self.condition_ratings[index] = Some(ratings);
        self.reduced_condition_ratings[index] = Some(self.pools.ratings.get());
        self.condition_match_sets[index] = Some(self.pools.data_id_sets.get());
        self.query_results[index] = Some(QueryResult::new(id, member.object));
    }

    pub fn set_relation_memberships(&mut self, index: usize, memberships: Vec<RelationMembership>) {
        if self.arena.is_valid(index) {
            self.relation_memberships[index] = memberships;
        }
    }

    // ------------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------------

    /// Remove every row of a query. False when the id is unknown.
    pub fn remove(&mut self, id: QueryMatchId) -> bool {
        self.remove_rows(id).is_some()
    }

    /// Remove every row of a query, returning what each row held.
    pub fn remove_rows(&mut self, id: QueryMatchId) -> Option<Vec<RemovedRow>> {
        let indices = self.match_id_to_index.remove(&id)?;
        let mut removed = Vec::with_capacity(indices.len());

        for &index in &indices {
            removed.push(RemovedRow {
                index,
                state: self.states[index],
                best_match: self.best_match_data_ids[index],
                exclusivity: self.exclusivities[index],
                // may still be referenced by a loss event, so it is handed out, not recycled
                result: self.query_results[index].take(),
            });

            self.query_match_ids[index] = QueryMatchId::NULL;
            self.states[index] = RowState::Vacant;
            self.object_references[index] = None;

            if let Some(cache) = self.cached_traits[index].take() {
                self.pools.trait_caches.recycle(cache);
            }
            if let Some(ratings) = self.condition_ratings[index].take() {
                self.pools.condition_ratings.recycle(ratings);
            }
            if let Some(set) = self.condition_match_sets[index].take() {
                self.pools.data_id_sets.recycle(set);
            }
            if let Some(ratings) = self.reduced_condition_ratings[index].take() {
                self.pools.ratings.recycle(ratings);
            }
            self.trait_requirements[index] = None;
            self.conditions[index] = None;
            self.relation_memberships[index].clear();

            self.exclusivities[index] = Exclusivity::default();
            self.best_match_data_ids[index] = DataId::INVALID;
            self.required[index] = false;

            self.arena.free(index);
            self.updating_indices.remove(&index);
            self.acquiring_indices.remove(&index);
        }

        self.filtered_acquiring_indices.retain(|i| !indices.contains(i));
        self.potential_match_acquiring_indices.retain(|i| !indices.contains(i));
        self.definite_match_acquire_indices.retain(|i| !indices.contains(i));
        self.pools.index_lists.recycle(indices);
        debug!("Removed query {}", id);
        Some(removed)
    }

    /// Drop every row. Pooled buffers go back to their pools.
    pub fn clear(&mut self) {
        let ids: Vec<QueryMatchId> = self.match_id_to_index.keys().copied().collect();
        for id in ids {
            self.remove_rows(id);
        }
        self.arena.clear();
        self.acquiring_indices.clear();
        self.updating_indices.clear();
        self.clear_cycle_indices();
    }

    pub fn clear_cycle_indices(&mut self) {
        self.filtered_acquiring_indices.clear();
        self.potential_match_acquiring_indices.clear();
        self.definite_match_acquire_indices.clear();
    }

    // ------------------------------------------------------------------------
    // Capacity
    // ------------------------------------------------------------------------

    /// Grow every column to `new_capacity`, keeping rows at their indices.
    /// Shrinking is ignored.
    pub fn resize(&mut self, new_capacity: usize) -> MatchResult<()> {
        if new_capacity <= self.arena.capacity() {
            return Ok(());
        }
        if new_capacity > isize::MAX as usize / std::mem::size_of::<QueryResult>().max(1) {
            return Err(MatchError::CapacityOverflow {
                requested: new_capacity,
            });
        }
        self.grow_columns(new_capacity);
        self.arena.grow(new_capacity);
        Ok(())
    }

    pub fn on_resize(&mut self, observer: ResizeObserver) {
        self.arena.on_resize(observer);
    }

    fn grow_columns(&mut self, capacity: usize) {
        grow_column(&mut self.query_match_ids, capacity);
        grow_column(&mut self.states, capacity);
        grow_column(&mut self.exclusivities, capacity);
        grow_column(&mut self.required, capacity);
        grow_column(&mut self.conditions, capacity);
        grow_column(&mut self.trait_requirements, capacity);
        grow_column(&mut self.cached_traits, capacity);
        grow_column(&mut self.condition_ratings, capacity);
        grow_column(&mut self.condition_match_sets, capacity);
        grow_column(&mut self.reduced_condition_ratings, capacity);
        self.best_match_data_ids.resize(capacity, DataId::INVALID);
        grow_column(&mut self.query_results, capacity);
        grow_column(&mut self.object_references, capacity);
        grow_column(&mut self.relation_memberships, capacity);
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Row indices of both members of a relation, found by object reference.
    pub fn try_get_relation_member_indices(
        &self,
        id: QueryMatchId,
        first: ObjectRef,
        second: ObjectRef,
    ) -> Option<(usize, usize)> {
        let indices = self.match_id_to_index.get(&id)?;
        let mut found = (None, None);
        for &index in indices {
            match self.object_references[index] {
                Some(object) if object == first => found.0 = Some(index),
                Some(object) if object == second => found.1 = Some(index),
                _ => {}
            }
        }
        match found {
            (Some(a), Some(b)) => Some((a, b)),
            _ => None,
        }
    }

    pub fn contains(&self, id: QueryMatchId) -> bool {
        self.match_id_to_index.contains_key(&id)
    }

    pub fn indices_of(&self, id: QueryMatchId) -> Option<&[usize]> {
        self.match_id_to_index.get(&id).map(Vec::as_slice)
    }

    pub fn query_ids(&self) -> impl Iterator<Item = QueryMatchId> + '_ {
        self.match_id_to_index.keys().copied()
    }

    pub fn is_live(&self, index: usize) -> bool {
        self.arena.is_valid(index)
    }

    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn freed_indices(&self) -> Vec<usize> {
        self.arena.freed_indices().collect()
    }

    pub fn valid_indices(&self) -> Vec<usize> {
        self.arena.valid_indices().collect()
    }

    pub fn query_match_id(&self, index: usize) -> Option<QueryMatchId> {
        self.is_live(index).then(|| self.query_match_ids[index])
    }

    pub fn state(&self, index: usize) -> RowState {
        self.states.get(index).copied().unwrap_or_default()
    }

    pub fn best_match(&self, index: usize) -> DataId {
        self.best_match_data_ids.get(index).copied().unwrap_or(DataId::INVALID)
    }

    pub fn object_reference(&self, index: usize) -> Option<ObjectRef> {
        self.object_references.get(index).copied().flatten()
    }

    pub fn exclusivity(&self, index: usize) -> Exclusivity {
        self.exclusivities.get(index).copied().unwrap_or_default()
    }

    pub fn is_required(&self, index: usize) -> bool {
        self.required.get(index).copied().unwrap_or(false)
    }

    pub fn trait_requirements(&self, index: usize) -> &[TraitRequirement] {
        self.trait_requirements
            .get(index)
            .and_then(Option::as_deref)
            .unwrap_or(&[])
    }

    pub fn condition_match_set(&self, index: usize) -> Option<&HashSet<DataId>> {
        self.condition_match_sets.get(index)?.as_ref()
    }

    pub fn reduced_ratings(&self, index: usize) -> Option<&HashMap<DataId, f32>> {
        self.reduced_condition_ratings.get(index)?.as_ref()
    }

    pub fn condition_ratings(&self, index: usize) -> Option<&ConditionRatingsData> {
        self.condition_ratings.get(index)?.as_ref()
    }

    pub fn query_result(&self, index: usize) -> Option<&QueryResult> {
        self.query_results.get(index)?.as_ref()
    }

    pub fn relation_memberships(&self, index: usize) -> &[RelationMembership] {
        self.relation_memberships.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    pub fn counts(&self) -> MemberCounts {
        MemberCounts {
            rows: self.arena.len(),
            seeking: self.acquiring_indices.len(),
            tracking: self.updating_indices.len(),
            capacity: self.arena.capacity(),
        }
    }

    // ------------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------------

    /// Commit a match: the row moves from seeking to tracking.
    pub(crate) fn commit_match(&mut self, index: usize, data: DataId, score: f32) {
        self.best_match_data_ids[index] = data;
        self.states[index] = RowState::Tracking;
        self.acquiring_indices.remove(&index);
        self.updating_indices.insert(index);
        if let Some(result) = self.query_results[index].as_mut() {
            result.data_id = data;
            result.score = score;
            result.terminated = false;
        }
    }

    /// Drop a row's match. The row goes back to seeking, or sits out as
    /// dropped until its query seeks again.
    pub(crate) fn release_match(&mut self, index: usize, reseek: bool) -> DataId {
        let data = std::mem::replace(&mut self.best_match_data_ids[index], DataId::INVALID);
        self.updating_indices.remove(&index);
        if reseek {
            self.states[index] = RowState::Seeking;
            self.acquiring_indices.insert(index);
        } else {
            self.states[index] = RowState::Dropped;
            self.acquiring_indices.remove(&index);
        }
        if let Some(result) = self.query_results[index].as_mut() {
            result.data_id = DataId::INVALID;
            result.score = 0.0;
        }
        data
    }

    /// Put a dropped row back into the seeking set.
    pub(crate) fn reseek(&mut self, index: usize) {
        if self.states[index] == RowState::Dropped {
            self.states[index] = RowState::Seeking;
            self.acquiring_indices.insert(index);
        }
    }
}
