//! Match World - main orchestrator
//!
//! Owns the trait database, the member store and every piece of per-query
//! bookkeeping, and runs the systems in a fixed order each tick.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::components::{DataId, ObjectRef, QueryMatchId, QueryState, RowState, TraitValue};
use crate::config::{timeout_from_secs, EngineConfig};
use crate::error::{MatchError, MatchResult};
use crate::events::{dispatch, DispatchReport, MatchEvent, MatchHandler, TickReport};
use crate::members::{MemberCounts, ParallelGroupMemberData, QueryDescriptor};
use crate::relations::{QueryRelation, RelationMembership, RelationStore};
use crate::systems::{self, DataClaims, QueryTimer};
use crate::trait_store::{TraitDatabase, TraitWriteQueue};

pub struct MatchWorld {
    traits: TraitDatabase,
    writer: TraitWriteQueue,
    members: ParallelGroupMemberData,
    relations: RelationStore,
    claims: DataClaims,
    timers: HashMap<QueryMatchId, QueryTimer>,
    events: Vec<MatchEvent>,
    /// Queries unmatched without reseeking. Re-registering an id takes it out.
    unset_standalone_ids: BTreeSet<QueryMatchId>,
    next_query_id: u64,
    tick_count: u64,
    config: EngineConfig,
}

impl MatchWorld {
    /// A world configured from [`EngineConfig::global`].
    pub fn new() -> Self {
        Self::with_config(EngineConfig::global().clone())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            traits: TraitDatabase::new(),
            writer: TraitWriteQueue::new(),
            members: ParallelGroupMemberData::new(config.initial_capacity),
            relations: RelationStore::default(),
            claims: DataClaims::default(),
            timers: HashMap::new(),
            events: Vec::new(),
            unset_standalone_ids: BTreeSet::new(),
            next_query_id: 1,
            tick_count: 0,
            config,
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Register a query under a fresh id.
    pub fn register_query(&mut self, descriptor: QueryDescriptor) -> MatchResult<QueryMatchId> {
        let id = QueryMatchId(self.next_query_id);
        self.register_query_with_id(id, descriptor)?;
        Ok(id)
    }

    /// Register a query under an id chosen by the caller.
    pub fn register_query_with_id(&mut self, id: QueryMatchId, descriptor: QueryDescriptor) -> MatchResult<()> {
        if let Err(e) = descriptor.validate_relations() {
            warn!("Rejecting query {}: {}", id, e);
            return Err(e);
        }
        let QueryDescriptor {
            members,
            relations,
            timeout_secs,
        } = descriptor;
        let objects: Vec<ObjectRef> = members.iter().map(|m| m.object).collect();
        let member_count = members.len();
        // the last id saturates; fresh registrations then fail as duplicates
        let next_query_id = self.next_query_id.max(id.0.saturating_add(1));

        let rows = self.members.register(id, members)?;

        let mut memberships = vec![Vec::new(); member_count];
        let mut query_relations = Vec::with_capacity(relations.len());
        for (relation_index, descriptor) in relations.iter().enumerate() {
            let (first, second) = descriptor.members;
            memberships[first].push(RelationMembership {
                relation_index,
                is_first: true,
            });
            memberships[second].push(RelationMembership {
                relation_index,
                is_first: false,
            });
            query_relations.push(QueryRelation {
                relation: descriptor.relation,
                first: objects[first],
                second: objects[second],
            });
        }
        for (&index, row_memberships) in rows.iter().zip(memberships) {
            self.members.set_relation_memberships(index, row_memberships);
        }
        self.relations.insert(id, query_relations);

        let timeout = match timeout_secs {
            Some(secs) => timeout_from_secs(secs),
            None => self.config.default_timeout(),
        };
        self.timers.insert(id, QueryTimer::new(Instant::now(), timeout));
        self.next_query_id = next_query_id;
        self.unset_standalone_ids.remove(&id);

        info!(
            "Registered query {} with {} member(s), {} relation(s)",
            id,
            member_count,
            relations.len()
        );
        Ok(())
    }

    /// Remove a query immediately. Tracking members report a terminated loss.
    pub fn remove_query(&mut self, id: QueryMatchId) -> bool {
        let Some(lost) =
            systems::terminate_query(&mut self.members, &mut self.claims, &mut self.relations, id, &mut self.events)
        else {
            return false;
        };
        self.timers.remove(&id);
        info!("Removed query {} ({} match(es) lost)", id, lost);
        true
    }

    /// Drop a query's current matches. With `seek_new_match` the query seeks
    /// again from the next tick; otherwise it is terminated and removed.
    /// Returns whether any member held a match.
    pub fn unmatch(&mut self, id: QueryMatchId, seek_new_match: bool) -> MatchResult<bool> {
        if !self.members.contains(id) {
            return Err(MatchError::UnknownQuery(id));
        }
        if seek_new_match {
            let lost = systems::reseek_query(&mut self.members, &mut self.claims, id, &mut self.events);
            if let Some(timer) = self.timers.get_mut(&id) {
                timer.restart(Instant::now());
            }
            debug!("Query {} unmatched, seeking again", id);
            return Ok(lost > 0);
        }

        let lost = systems::terminate_query(&mut self.members, &mut self.claims, &mut self.relations, id, &mut self.events)
            .unwrap_or(0);
        self.timers.remove(&id);
        self.unset_standalone_ids.insert(id);
        info!("Query {} unmatched and terminated", id);
        Ok(lost > 0)
    }

    pub fn query_state(&self, id: QueryMatchId) -> QueryState {
        match self.members.indices_of(id) {
            Some(rows) if rows.iter().any(|&i| self.members.state(i) == RowState::Tracking) => QueryState::Tracking,
            Some(_) => QueryState::Seeking,
            None if self.unset_standalone_ids.contains(&id) => QueryState::Terminated,
            None => QueryState::Unknown,
        }
    }

    /// Data matched to each member of a query, in member order.
    /// Unmatched members report [`DataId::INVALID`].
    pub fn matches(&self, id: QueryMatchId) -> Vec<(ObjectRef, DataId)> {
        self.members
            .indices_of(id)
            .unwrap_or(&[])
            .iter()
            .filter_map(|&index| {
                self.members
                    .object_reference(index)
                    .map(|object| (object, self.members.best_match(index)))
            })
            .collect()
    }

    pub fn unset_standalone_ids(&self) -> &BTreeSet<QueryMatchId> {
        &self.unset_standalone_ids
    }

    // ------------------------------------------------------------------------
    // Traits
    // ------------------------------------------------------------------------

    /// Queue a trait write for the next tick, rejecting it up front if it
    /// targets a reserved id or conflicts with the trait's registered kind.
    pub fn add_or_update_trait(&mut self, id: DataId, name: &str, value: impl Into<TraitValue>) -> MatchResult<()> {
        let value = value.into();
        self.traits.check_write(id, name, value.kind())?;
        self.writer.add_or_update(id, name, value);
        Ok(())
    }

    /// Queue a trait removal for the next tick. Returns whether `id`
    /// currently carries the trait.
    pub fn remove_trait(&mut self, id: DataId, name: &str) -> bool {
        self.writer.remove(id, name);
        self.traits.contains(id, name)
    }

    /// Queue handle for providers; writes land at the start of the next tick.
    pub fn trait_writer(&self) -> TraitWriteQueue {
        self.writer.clone()
    }

    pub fn traits(&self) -> &TraitDatabase {
        &self.traits
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    pub fn tick(&mut self) -> TickReport {
        self.tick_at(Instant::now())
    }

    /// Run a tick now instead of waiting for the runner.
    pub fn force_update(&mut self) -> TickReport {
        debug!("Forced update at tick {}", self.tick_count + 1);
        self.tick()
    }

    /// Run one tick with `now` as the current time.
    pub fn tick_at(&mut self, now: Instant) -> TickReport {
        self.tick_count += 1;
        let first_event = self.events.len();
        let mut report = TickReport {
            tick: self.tick_count,
            ..TickReport::default()
        };

        report.trait_writes_applied = self.writer.apply_to(&mut self.traits) as u32;
        let changes = self.traits.take_changes();

        let reseeking = systems::tracking_system(
            &mut self.members,
            &mut self.claims,
            &self.relations,
            &self.traits,
            &changes,
            self.config.emit_updates,
            &mut self.events,
        );
        for id in reseeking {
            if let Some(timer) = self.timers.get_mut(&id) {
                timer.restart(now);
            }
        }

        let expired = systems::timeout_system(
            &mut self.members,
            &mut self.claims,
            &mut self.relations,
            &self.timers,
            now,
            &mut self.events,
        );
        for id in expired {
            self.timers.remove(&id);
        }

        systems::rating_system(&mut self.members, &self.traits, self.config.parallel_rating_threshold);
        systems::selection_system(
            &mut self.members,
            &mut self.claims,
            &self.relations,
            &self.traits,
            self.config.max_group_candidates,
            &mut self.events,
        );
        self.members.clear_cycle_indices();

        for event in &self.events[first_event..] {
            report.record(event);
        }
        let counts = self.members.counts();
        report.seeking_rows = counts.seeking as u32;
        report.tracking_rows = counts.tracking as u32;
        trace!(
            "Tick {}: +{} ~{} -{} timeouts {} (seeking {}, tracking {})",
            report.tick,
            report.acquired,
            report.updated,
            report.lost,
            report.timed_out,
            report.seeking_rows,
            report.tracking_rows
        );
        report
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Take every queued event in the order it happened.
    pub fn drain_events(&mut self) -> Vec<MatchEvent> {
        std::mem::take(&mut self.events)
    }

    /// Hand every queued event to `handler`, isolating its failures.
    pub fn dispatch_events<H: MatchHandler + ?Sized>(&mut self, handler: &mut H) -> DispatchReport {
        let events = self.drain_events();
        dispatch(events, handler)
    }

    pub fn pending_events(&self) -> &[MatchEvent] {
        &self.events
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn members(&self) -> &ParallelGroupMemberData {
        &self.members
    }

    pub fn counts(&self) -> MemberCounts {
        self.members.counts()
    }

    pub fn claims(&self) -> &DataClaims {
        &self.claims
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}

impl Default for MatchWorld {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{trait_names, Pose, TraitKind, TraitRequirement, Vec2, Vec3};
    use crate::conditions::{Condition, ProxyConditions};
    use crate::members::MemberDescriptor;
    use crate::relations::Relation;

    fn world() -> MatchWorld {
        MatchWorld::with_config(EngineConfig::default())
    }

    fn bounds_member(clients: &mut hecs::World) -> MemberDescriptor {
        MemberDescriptor::new(clients.spawn(()))
            .require(TraitRequirement::new(trait_names::BOUNDS_2D, TraitKind::Vec2))
            .conditions(ProxyConditions::new().with(Condition::Bounds2D {
                target: Vec2::new(0.5, 2.5),
                tolerance: 0.5,
            }))
    }

    #[test]
    fn test_register_assigns_increasing_ids() {
        let mut clients = hecs::World::new();
        let mut world = world();
        let a = world.register_query(QueryDescriptor::single(bounds_member(&mut clients))).unwrap();
        let b = world.register_query(QueryDescriptor::single(bounds_member(&mut clients))).unwrap();
        assert_eq!((a, b), (QueryMatchId(1), QueryMatchId(2)));

        world
            .register_query_with_id(QueryMatchId(10), QueryDescriptor::single(bounds_member(&mut clients)))
            .unwrap();
        let c = world.register_query(QueryDescriptor::single(bounds_member(&mut clients))).unwrap();
        assert_eq!(c, QueryMatchId(11));
    }

    #[test]
    fn test_invalid_relation_rejected() {
        let mut clients = hecs::World::new();
        let mut world = world();
        let descriptor = QueryDescriptor::group(vec![bounds_member(&mut clients), bounds_member(&mut clients)])
            .relate(Relation::Distance { min: 0.0, max: 1.0 }, 0, 2);
        match world.register_query(descriptor) {
            Err(MatchError::InvalidRelation { relation: 0, members: (0, 2) }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(world.counts().rows == 0);
    }

    #[test]
    fn test_direct_writes_visible_on_next_tick() {
        let mut clients = hecs::World::new();
        let mut world = world();
        let id = world.register_query(QueryDescriptor::single(bounds_member(&mut clients))).unwrap();
        world.add_or_update_trait(DataId(3), trait_names::BOUNDS_2D, Vec2::new(0.5, 2.5)).unwrap();

        let report = world.tick();
        assert_eq!(report.acquired, 1);
        assert_eq!(world.query_state(id), QueryState::Tracking);
        assert_eq!(world.matches(id)[0].1, DataId(3));
    }

    #[test]
    fn test_remove_unknown_query() {
        let mut world = world();
        assert!(!world.remove_query(QueryMatchId(99)));
        assert!(matches!(world.unmatch(QueryMatchId(99), true), Err(MatchError::UnknownQuery(_))));
        assert_eq!(world.query_state(QueryMatchId(99)), QueryState::Unknown);
    }

    #[test]
    fn test_group_relation_registered_by_object() {
        let mut clients = hecs::World::new();
        let mut world = world();
        for (id, x) in [(1, 0.0), (2, 0.8), (3, 9.0)] {
            world.add_or_update_trait(DataId(id), trait_names::BOUNDS_2D, Vec2::new(0.5, 2.5)).unwrap();
            world.add_or_update_trait(DataId(id), trait_names::POSE, Pose::at(Vec3::new(x, 0.0, 0.0))).unwrap();
        }
        let descriptor = QueryDescriptor::group(vec![bounds_member(&mut clients), bounds_member(&mut clients)])
            .relate(Relation::Distance { min: 0.5, max: 1.0 }, 0, 1);
        let id = world.register_query(descriptor).unwrap();

        world.tick();
        let matched: Vec<DataId> = world.matches(id).into_iter().map(|(_, data)| data).collect();
        assert_eq!(matched, vec![DataId(1), DataId(2)]);
    }

    #[test]
    fn test_broken_relation_fails_both_members() {
        let mut clients = hecs::World::new();
        let mut world = world();
        for (id, x) in [(1, 0.0), (2, 0.8), (3, 9.0)] {
            world.add_or_update_trait(DataId(id), trait_names::BOUNDS_2D, Vec2::new(0.5, 2.5)).unwrap();
            world.add_or_update_trait(DataId(id), trait_names::POSE, Pose::at(Vec3::new(x, 0.0, 0.0))).unwrap();
        }
        let descriptor = QueryDescriptor::group(vec![bounds_member(&mut clients), bounds_member(&mut clients)])
            .relate(Relation::Distance { min: 0.5, max: 1.0 }, 0, 1);
        let id = world.register_query(descriptor).unwrap();
        world.tick();
        assert_eq!(world.query_state(id), QueryState::Tracking);
        world.drain_events();

        // nothing else lies within range of either member
        world.add_or_update_trait(DataId(2), trait_names::POSE, Pose::at(Vec3::new(5.0, 0.0, 0.0))).unwrap();
        let report = world.tick();
        assert_eq!((report.lost, report.acquired), (2, 0));
        let lost: Vec<DataId> = world
            .drain_events()
            .into_iter()
            .filter_map(|event| match event {
                MatchEvent::Loss(result) => Some(result.data_id),
                _ => None,
            })
            .collect();
        assert_eq!(lost, vec![DataId(1), DataId(2)]);
        assert_eq!(world.query_state(id), QueryState::Seeking);
        assert!(world.matches(id).iter().all(|&(_, data)| data == DataId::INVALID));
        let rows = world.members().indices_of(id).unwrap();
        assert!(rows.iter().all(|&index| world.members().state(index) == RowState::Seeking));
    }

    #[test]
    fn test_removed_trait_never_leaves_stale_match() {
        let mut clients = hecs::World::new();
        let mut world = world();
        let id = world.register_query(QueryDescriptor::single(bounds_member(&mut clients))).unwrap();
        world.add_or_update_trait(DataId(3), trait_names::BOUNDS_2D, Vec2::new(0.5, 2.5)).unwrap();
        world.tick();
        assert_eq!(world.matches(id)[0].1, DataId(3));

        assert!(world.remove_trait(DataId(3), trait_names::BOUNDS_2D));
        let best = world.matches(id)[0].1;
        assert!(best == DataId::INVALID || world.traits().contains_entity(best));

        let report = world.tick();
        assert_eq!(report.lost, 1);
        assert_eq!(world.matches(id)[0].1, DataId::INVALID);
        assert!(!world.traits().contains_entity(DataId(3)));
    }

    #[test]
    fn test_invalid_direct_writes_rejected_up_front() {
        let mut world = world();
        assert!(matches!(
            world.add_or_update_trait(DataId::INVALID, trait_names::BOUNDS_2D, Vec2::new(1.0, 1.0)),
            Err(MatchError::ReservedDataId(_))
        ));
        world.add_or_update_trait(DataId(1), trait_names::BOUNDS_2D, Vec2::new(1.0, 1.0)).unwrap();
        world.tick();
        assert!(matches!(
            world.add_or_update_trait(DataId(2), trait_names::BOUNDS_2D, true),
            Err(MatchError::TraitTypeMismatch { .. })
        ));
        assert_eq!(world.tick().trait_writes_applied, 0);
    }

    #[test]
    fn test_register_with_highest_id() {
        let mut clients = hecs::World::new();
        let mut world = world();
        let last = QueryMatchId(u64::MAX);
        world
            .register_query_with_id(last, QueryDescriptor::single(bounds_member(&mut clients)))
            .unwrap();
        assert_eq!(world.query_state(last), QueryState::Seeking);
        assert!(matches!(
            world.register_query(QueryDescriptor::single(bounds_member(&mut clients))),
            Err(MatchError::DuplicateQuery(_))
        ));
        assert_eq!(world.counts().rows, 1);
    }

    #[test]
    fn test_steady_state_ticks_reuse_pooled_buffers() {
        let mut clients = hecs::World::new();
        let mut world = world();
        for id in 1..=3 {
            world.add_or_update_trait(DataId(id), trait_names::BOUNDS_2D, Vec2::new(0.5, 2.5)).unwrap();
        }
        for _ in 0..2 {
            world.register_query(QueryDescriptor::single(bounds_member(&mut clients))).unwrap();
        }
        world.tick();
        world.tick();
        assert_eq!(world.counts().tracking, 2);

        let created = |world: &MatchWorld| {
            let pools = world.members().pools();
            (
                pools.trait_caches.created(),
                pools.condition_ratings.created(),
                pools.data_id_sets.created(),
                pools.ratings.created(),
            )
        };
        let before = created(&world);
        for _ in 0..10 {
            world.add_or_update_trait(DataId(1), trait_names::BOUNDS_2D, Vec2::new(0.5, 2.5)).unwrap();
            world.tick();
        }
        assert_eq!(world.counts().tracking, 2);
        assert_eq!(created(&world), before);
    }

    #[test]
    fn test_reregistered_id_leaves_terminated_set() {
        let mut clients = hecs::World::new();
        let mut world = world();
        let id = world.register_query(QueryDescriptor::single(bounds_member(&mut clients))).unwrap();
        world.unmatch(id, false).unwrap();
        assert_eq!(world.query_state(id), QueryState::Terminated);
        assert!(world.unset_standalone_ids().contains(&id));

        world
            .register_query_with_id(id, QueryDescriptor::single(bounds_member(&mut clients)))
            .unwrap();
        assert_eq!(world.query_state(id), QueryState::Seeking);
        assert!(world.unset_standalone_ids().is_empty());
    }
}
