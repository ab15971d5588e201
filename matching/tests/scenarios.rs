//! End-to-end matching scenarios driven through `MatchWorld`.

use std::time::{Duration, Instant};

use matching::clients::ProxyClients;
use matching::components::{
    trait_names, DataId, Exclusivity, Pose, QueryMatchId, QueryState, RowState, TraitKind, TraitRequirement, Vec2,
    Vec3,
};
use matching::conditions::{Condition, ProxyConditions};
use matching::events::{MatchEvent, MatchHandler, QueryResult};
use matching::members::{MemberDescriptor, ParallelGroupMemberData, QueryDescriptor};
use matching::{EngineConfig, MatchWorld};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn world() -> MatchWorld {
    MatchWorld::with_config(EngineConfig::default())
}

fn bounds_member(clients: &mut ProxyClients, target: Vec2) -> MemberDescriptor {
    let proxy = clients.spawn_proxy("surface");
    clients
        .member(proxy)
        .require(TraitRequirement::new(trait_names::BOUNDS_2D, TraitKind::Vec2))
        .conditions(ProxyConditions::new().with(Condition::Bounds2D { target, tolerance: 0.25 }))
}

/// 20 entities with distinct bounds and a pose; entity 7 sits on (0.5, 2.5).
fn seed_surfaces(world: &mut MatchWorld) {
    for i in 0..20 {
        let bounds = if i == 7 {
            Vec2::new(0.5, 2.5)
        } else {
            Vec2::new(3.0 + i as f32, 0.1 * i as f32)
        };
        world.add_or_update_trait(DataId(i), trait_names::BOUNDS_2D, bounds).unwrap();
        world
            .add_or_update_trait(DataId(i), trait_names::POSE, Pose::at(Vec3::new(i as f32, 0.0, 0.0)))
            .unwrap();
    }
}

fn losses(events: &[MatchEvent]) -> Vec<&QueryResult> {
    events
        .iter()
        .filter_map(|e| match e {
            MatchEvent::Loss(r) => Some(r),
            _ => None,
        })
        .collect()
}

#[test]
fn exact_bounds_entity_wins() {
    let mut clients = ProxyClients::new();
    let mut world = world();
    seed_surfaces(&mut world);
    let id = world
        .register_query(QueryDescriptor::single(bounds_member(&mut clients, Vec2::new(0.5, 2.5))))
        .unwrap();

    world.tick();
    assert_eq!(world.matches(id)[0].1, DataId(7));
    assert_eq!(world.query_state(id), QueryState::Tracking);
}

#[test]
fn best_match_is_sentinel_or_present_entity() {
    let mut clients = ProxyClients::new();
    let mut world = world();
    seed_surfaces(&mut world);
    let requirement = [TraitRequirement::new(trait_names::BOUNDS_2D, TraitKind::Vec2)];
    let matched = world
        .register_query(QueryDescriptor::single(bounds_member(&mut clients, Vec2::new(0.5, 2.5))))
        .unwrap();
    let unmatched = world
        .register_query(QueryDescriptor::single(bounds_member(&mut clients, Vec2::new(40.0, 40.0))))
        .unwrap();

    for _ in 0..3 {
        world.tick();
        for id in [matched, unmatched] {
            for (_, data) in world.matches(id) {
                assert!(data == DataId::INVALID || world.traits().satisfies(data, &requirement));
            }
        }
    }

    world.remove_trait(DataId(7), trait_names::POSE);
    world.remove_trait(DataId(7), trait_names::BOUNDS_2D);
    world.tick();
    assert_eq!(world.matches(matched)[0].1, DataId::INVALID);
    assert!(!world.traits().contains_entity(DataId(7)));
}

#[test]
fn rating_is_deterministic_across_worlds() {
    let run = || {
        let mut rng = StdRng::seed_from_u64(7);
        let mut clients = ProxyClients::new();
        let mut world = world();
        for i in 0..200 {
            let bounds = Vec2::new(rng.gen_range(0.0..3.0), rng.gen_range(0.0..3.0));
            world.add_or_update_trait(DataId(i), trait_names::BOUNDS_2D, bounds).unwrap();
        }
        let ids: Vec<QueryMatchId> = (0..30)
            .map(|_| {
                let target = Vec2::new(rng.gen_range(0.0..3.0), rng.gen_range(0.0..3.0));
                world
                    .register_query(QueryDescriptor::single(bounds_member(&mut clients, target)))
                    .unwrap()
            })
            .collect();
        world.tick();
        ids.iter().map(|&id| world.matches(id)[0].1).collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
}

#[test]
fn exact_tie_resolves_to_lowest_id() {
    let mut clients = ProxyClients::new();
    let mut world = world();
    for id in [12, 5, 9] {
        world
            .add_or_update_trait(DataId(id), trait_names::BOUNDS_2D, Vec2::new(1.0, 1.0))
            .unwrap();
    }
    let id = world
        .register_query(QueryDescriptor::single(bounds_member(&mut clients, Vec2::new(1.0, 1.0))))
        .unwrap();
    world.tick();
    assert_eq!(world.matches(id)[0].1, DataId(5));
}

#[test]
fn group_waits_until_every_required_member_can_match() {
    let mut clients = ProxyClients::new();
    let mut world = world();
    world.add_or_update_trait(DataId(1), trait_names::BOUNDS_2D, Vec2::new(1.0, 1.0)).unwrap();
    let descriptor = QueryDescriptor::group(vec![
        bounds_member(&mut clients, Vec2::new(1.0, 1.0)),
        bounds_member(&mut clients, Vec2::new(2.0, 2.0)),
    ]);
    let id = world.register_query(descriptor).unwrap();

    let report = world.tick();
    assert_eq!(report.acquired, 0);
    assert!(world.matches(id).iter().all(|(_, data)| *data == DataId::INVALID));

    world.add_or_update_trait(DataId(2), trait_names::BOUNDS_2D, Vec2::new(2.0, 2.0)).unwrap();
    let report = world.tick();
    assert_eq!(report.acquired, 2);
    let events = world.drain_events();
    assert!(events.iter().all(|e| e.query_match_id() == id));
}

#[test]
fn exclusive_data_never_matches_two_queries() {
    let mut clients = ProxyClients::new();
    let mut world = world();
    world.add_or_update_trait(DataId(1), trait_names::BOUNDS_2D, Vec2::new(1.0, 1.0)).unwrap();
    let first = world
        .register_query(QueryDescriptor::single(bounds_member(&mut clients, Vec2::new(1.0, 1.0))))
        .unwrap();
    let second = world
        .register_query(QueryDescriptor::single(bounds_member(&mut clients, Vec2::new(1.0, 1.0))))
        .unwrap();
    let reader = world
        .register_query(QueryDescriptor::single(
            bounds_member(&mut clients, Vec2::new(1.0, 1.0)).exclusivity(Exclusivity::ReadOnly),
        ))
        .unwrap();

    world.tick();
    assert_eq!(world.matches(first)[0].1, DataId(1));
    assert_eq!(world.matches(second)[0].1, DataId::INVALID);
    assert_eq!(world.matches(reader)[0].1, DataId(1));

    // the second query takes over once the first lets go
    world.remove_query(first);
    world.tick();
    assert_eq!(world.matches(second)[0].1, DataId(1));
}

#[test]
fn unmatch_without_reseek_terminates() {
    let mut clients = ProxyClients::new();
    let mut world = world();
    seed_surfaces(&mut world);
    let id = world
        .register_query(QueryDescriptor::single(bounds_member(&mut clients, Vec2::new(0.5, 2.5))))
        .unwrap();
    world.tick();
    world.drain_events();

    assert!(world.unmatch(id, false).unwrap());
    assert_eq!(world.query_state(id), QueryState::Terminated);
    assert!(!world.members().contains(id));
    assert_eq!(world.unset_standalone_ids().iter().copied().collect::<Vec<_>>(), vec![id]);

    let events = world.drain_events();
    let lost = losses(&events);
    assert_eq!(lost.len(), 1);
    assert!(lost[0].terminated);
    assert_eq!(lost[0].data_id, DataId(7));

    world.tick();
    assert!(world.drain_events().is_empty());
}

#[test]
fn unmatch_with_reseek_reacquires() {
    let mut clients = ProxyClients::new();
    let mut world = world();
    seed_surfaces(&mut world);
    let id = world
        .register_query(QueryDescriptor::single(bounds_member(&mut clients, Vec2::new(0.5, 2.5))))
        .unwrap();
    world.tick();
    world.drain_events();

    assert!(world.unmatch(id, true).unwrap());
    assert_eq!(world.query_state(id), QueryState::Seeking);
    world.tick();

    let events = world.drain_events();
    assert_eq!(losses(&events).len(), 1);
    assert!(matches!(events.last(), Some(MatchEvent::Acquire(r)) if r.data_id == DataId(7)));
    assert!(world.unset_standalone_ids().is_empty());
}

#[test]
fn removed_query_leaves_no_rows_and_slots_are_reused() {
    let mut clients = ProxyClients::new();
    let mut world = world();
    seed_surfaces(&mut world);
    let id = world
        .register_query(QueryDescriptor::single(bounds_member(&mut clients, Vec2::new(0.5, 2.5))))
        .unwrap();
    world.tick();
    let row = world.members().indices_of(id).unwrap()[0];

    assert!(world.remove_query(id));
    assert!(world.members().indices_of(id).is_none());
    assert_eq!(world.members().query_match_id(row), None);
    assert!(losses(&world.drain_events())[0].terminated);

    let next = world
        .register_query(QueryDescriptor::single(bounds_member(&mut clients, Vec2::new(0.5, 2.5))))
        .unwrap();
    assert_eq!(world.members().indices_of(next).unwrap(), &[row]);
}

#[test]
fn resize_preserves_rows_and_free_slots() {
    let mut world = hecs::World::new();
    let mut data = ParallelGroupMemberData::new(8);
    let member = |world: &mut hecs::World| {
        MemberDescriptor::new(world.spawn(()))
            .require(TraitRequirement::new(trait_names::BOUNDS_2D, TraitKind::Vec2))
    };
    for q in 1..=5 {
        data.register(QueryMatchId(q), vec![member(&mut world)]).unwrap();
    }
    let before: Vec<_> = (0..5).map(|i| (data.query_match_id(i), data.object_reference(i))).collect();

    data.resize(16).unwrap();
    assert_eq!(data.capacity(), 16);
    let after: Vec<_> = (0..5).map(|i| (data.query_match_id(i), data.object_reference(i))).collect();
    assert_eq!(before, after);
    assert!((0..5).all(|i| data.state(i) == RowState::Seeking && data.best_match(i) == DataId::INVALID));

    let free = data.freed_indices();
    assert_eq!(free.len(), 11);
    assert_eq!(&free[..3], &[5, 6, 7]);
    assert!(free[3..].iter().all(|&i| data.best_match(i) == DataId::INVALID));
}

#[test]
fn seeking_query_times_out_once() {
    let mut clients = ProxyClients::new();
    let mut world = world();
    let id = world
        .register_query(
            QueryDescriptor::single(bounds_member(&mut clients, Vec2::new(1.0, 1.0))).timeout_secs(0.05),
        )
        .unwrap();

    let now = Instant::now();
    world.tick_at(now);
    assert!(world.drain_events().is_empty());

    let report = world.tick_at(now + Duration::from_secs(1));
    assert_eq!(report.timed_out, 1);
    assert_eq!(world.drain_events(), vec![MatchEvent::Timeout(id)]);
    assert!(!world.members().contains(id));

    world.tick_at(now + Duration::from_secs(2));
    assert!(world.drain_events().is_empty());
}

#[test]
fn negative_timeout_never_expires() {
    let mut clients = ProxyClients::new();
    let mut world = world();
    let id = world
        .register_query(QueryDescriptor::single(bounds_member(&mut clients, Vec2::new(1.0, 1.0))))
        .unwrap();
    world.tick_at(Instant::now() + Duration::from_secs(3600));
    assert_eq!(world.query_state(id), QueryState::Seeking);
}

struct RejectFirst {
    seen: Vec<DataId>,
}

impl MatchHandler for RejectFirst {
    fn on_acquire(&mut self, result: &QueryResult) -> anyhow::Result<()> {
        if self.seen.is_empty() && result.data_id == DataId(1) {
            self.seen.push(DataId::INVALID);
            anyhow::bail!("spawner unavailable");
        }
        self.seen.push(result.data_id);
        Ok(())
    }

    fn on_loss(&mut self, _result: QueryResult) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn failing_handler_does_not_block_later_events() {
    let mut clients = ProxyClients::new();
    let mut world = world();
    for id in [1, 2] {
        world.add_or_update_trait(DataId(id), trait_names::BOUNDS_2D, Vec2::new(1.0, 1.0)).unwrap();
    }
    for _ in 0..2 {
        world
            .register_query(QueryDescriptor::single(bounds_member(&mut clients, Vec2::new(1.0, 1.0))))
            .unwrap();
    }
    world.tick();

    let mut handler = RejectFirst { seen: Vec::new() };
    let report = world.dispatch_events(&mut handler);
    assert_eq!((report.delivered, report.failed), (1, 1));
    assert_eq!(handler.seen, vec![DataId::INVALID, DataId(2)]);
}

#[test]
fn queued_writes_wait_for_next_tick() {
    let mut clients = ProxyClients::new();
    let mut world = world();
    let id = world
        .register_query(QueryDescriptor::single(bounds_member(&mut clients, Vec2::new(1.0, 1.0))))
        .unwrap();
    let writer = world.trait_writer();
    writer.add_or_update(DataId(4), trait_names::BOUNDS_2D, Vec2::new(1.0, 1.0));

    assert!(!world.traits().contains_entity(DataId(4)));
    assert_eq!(writer.pending_count(), 1);

    let report = world.tick();
    assert_eq!(report.trait_writes_applied, 1);
    assert_eq!(report.acquired, 1);
    assert_eq!(world.matches(id)[0].1, DataId(4));
}

#[test]
fn proxy_clients_follow_match_lifecycle() {
    let mut clients = ProxyClients::new();
    let mut world = world();
    world.add_or_update_trait(DataId(1), trait_names::BOUNDS_2D, Vec2::new(1.0, 1.0)).unwrap();

    let (group, members) = clients.spawn_group("desk", &["top", "lamp"]);
    let descriptors = members
        .iter()
        .enumerate()
        .map(|(i, &m)| {
            let member = clients
                .member(m)
                .require(TraitRequirement::new(trait_names::BOUNDS_2D, TraitKind::Vec2));
            if i == 0 {
                member
            } else {
                member.optional()
            }
        })
        .collect();
    let id = world.register_query(QueryDescriptor::group(descriptors)).unwrap();
    clients.link(group, id).unwrap();

    world.tick();
    world.dispatch_events(&mut clients);
    assert!(clients.is_active(members[0]));
    assert!(!clients.is_active(members[1]));
    assert_eq!(clients.matched_data(members[0]), Some(DataId(1)));

    world.unmatch(id, false).unwrap();
    let report = world.dispatch_events(&mut clients);
    assert_eq!(report.failed, 0);
    assert!(!clients.contains(group));
    assert!(members.iter().all(|&m| !clients.contains(m)));
}
