//! LiveMatch Matching Benchmark
//!
//! Standalone benchmark for the matching engine: a few thousand surfaces
//! drift around while proxies seek, track and lose them.

use std::time::Instant;

use anyhow::Context;
use matching::clients::ProxyClients;
use matching::components::{trait_names, DataId, Pose, TraitKind, TraitRequirement, Vec2, Vec3};
use matching::conditions::{Condition, ProxyConditions};
use matching::members::QueryDescriptor;
use matching::relations::Relation;
use matching::{EngineConfig, MatchWorld};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const SURFACES: i32 = 5_000;
const PROXIES: usize = 1_000;
const GROUPS: usize = 100;
const TICKS: u32 = 120;

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("LiveMatch matching engine benchmark starting...");

    let config = EngineConfig::global().clone();
    config.validate().context("engine config")?;
    let mut world = MatchWorld::with_config(config);
    let mut clients = ProxyClients::new();
    let mut rng = StdRng::seed_from_u64(42);

    let size = Normal::new(1.5_f32, 0.6).context("size distribution")?;
    let height = Normal::new(0.0_f32, 0.8).context("height distribution")?;

    info!("Seeding {} surfaces...", SURFACES);
    for id in 0..SURFACES {
        let bounds = Vec2::new(size.sample(&mut rng).abs(), size.sample(&mut rng).abs());
        let position = Vec3::new(rng.gen_range(-50.0..50.0), height.sample(&mut rng), rng.gen_range(-50.0..50.0));
        world.add_or_update_trait(DataId(id), trait_names::BOUNDS_2D, bounds)?;
        world.add_or_update_trait(DataId(id), trait_names::POSE, Pose::at(position))?;
    }

    info!("Registering {} proxies and {} groups...", PROXIES, GROUPS);
    for i in 0..PROXIES {
        let proxy = clients.spawn_proxy(&format!("proxy_{i}"));
        let target = Vec2::new(rng.gen_range(0.5..2.5), rng.gen_range(0.5..2.5));
        let member = clients
            .member(proxy)
            .require(TraitRequirement::new(trait_names::BOUNDS_2D, TraitKind::Vec2))
            .conditions(ProxyConditions::new().with(Condition::Bounds2D { target, tolerance: 0.5 }));
        let id = world.register_query(QueryDescriptor::single(member))?;
        clients.link(proxy, id)?;
    }
    for i in 0..GROUPS {
        let (group, members) = clients.spawn_group(&format!("group_{i}"), &["table", "chair"]);
        let descriptors = members
            .iter()
            .map(|&m| {
                clients
                    .member(m)
                    .require(TraitRequirement::new(trait_names::POSE, TraitKind::Pose))
                    .conditions(ProxyConditions::new().with(Condition::MinBounds2D { min: Vec2::new(1.0, 1.0) }))
            })
            .collect();
        let descriptor =
            QueryDescriptor::group(descriptors).relate(Relation::Distance { min: 0.5, max: 3.0 }, 0, 1);
        let id = world.register_query(descriptor)?;
        clients.link(group, id)?;
    }

    let writer = world.trait_writer();
    let drift = Normal::new(0.0_f32, 0.05).context("drift distribution")?;

    info!("Running {} ticks...", TICKS);
    let start = Instant::now();
    let mut failed = 0;
    for _ in 0..TICKS {
        // nudge a slice of surfaces each tick
        for _ in 0..SURFACES / 20 {
            let id = rng.gen_range(0..SURFACES);
            let bounds = Vec2::new(
                (1.5 + drift.sample(&mut rng) * 10.0).abs(),
                (1.5 + drift.sample(&mut rng) * 10.0).abs(),
            );
            writer.add_or_update(DataId(id), trait_names::BOUNDS_2D, bounds);
        }
        world.tick();
        failed += world.dispatch_events(&mut clients).failed;
    }
    let elapsed = start.elapsed();

    let counts = world.counts();
    info!(
        "Benchmark complete: {:?} total, {:?} per tick, {} active proxies, {} rows tracking, {} seeking, {} handler failures",
        elapsed,
        elapsed / TICKS,
        clients.active_count(),
        counts.tracking,
        counts.seeking,
        failed
    );
    if let Some(usage) = memory_stats::memory_stats() {
        info!("Physical memory: {} MB", usage.physical_mem / (1024 * 1024));
    }

    Ok(())
}
