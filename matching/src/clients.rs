//! Proxy Clients - the consumer side of matching
//!
//! Proxies are entities in a `hecs` world standing for content that should
//! appear on real-world data. A proxy group owns several member proxies that
//! share one query. Match events toggle their components: acquire marks a
//! proxy active with its matched data, loss clears it, and a terminated loss
//! despawns it.

use anyhow::{bail, Context};
use hecs::{Entity, World};
use tracing::debug;

use crate::components::{DataId, QueryMatchId};
use crate::events::{MatchHandler, QueryResult};
use crate::members::MemberDescriptor;

/// A piece of content waiting to be placed.
#[derive(Debug, Clone)]
pub struct Proxy {
    pub name: String,
}

/// A proxy that owns member proxies matched together.
#[derive(Debug, Clone)]
pub struct ProxyGroup {
    pub name: String,
    pub members: Vec<Entity>,
}

/// The query a proxy (or group) is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLink(pub QueryMatchId);

/// The data a proxy currently sits on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchedData {
    pub data_id: DataId,
    pub score: f32,
}

/// Marker: the proxy's content is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentActive;

pub struct ProxyClients {
    pub world: World,
}

impl ProxyClients {
    pub fn new() -> Self {
        Self { world: World::new() }
    }

    pub fn spawn_proxy(&mut self, name: &str) -> Entity {
        self.world.spawn((Proxy { name: name.to_string() },))
    }

    /// Spawn a group entity with one member proxy per name.
    pub fn spawn_group(&mut self, name: &str, member_names: &[&str]) -> (Entity, Vec<Entity>) {
        let members: Vec<Entity> = member_names.iter().map(|n| self.spawn_proxy(n)).collect();
        let group = self.world.spawn((ProxyGroup {
            name: name.to_string(),
            members: members.clone(),
        },));
        (group, members)
    }

    /// A member descriptor for a proxy, to be filled with its requirements.
    pub fn member(&self, proxy: Entity) -> MemberDescriptor {
        MemberDescriptor::new(proxy)
    }

    /// Record the query a proxy, or a group and all its members, runs under.
    pub fn link(&mut self, entity: Entity, id: QueryMatchId) -> anyhow::Result<()> {
        let members = self
            .world
            .get::<&ProxyGroup>(entity)
            .map(|group| group.members.clone())
            .unwrap_or_default();
        self.world
            .insert_one(entity, QueryLink(id))
            .with_context(|| format!("linking query {id}"))?;
        for member in members {
            self.world
                .insert_one(member, QueryLink(id))
                .with_context(|| format!("linking group member to query {id}"))?;
        }
        Ok(())
    }

    pub fn query_of(&self, entity: Entity) -> Option<QueryMatchId> {
        self.world.get::<&QueryLink>(entity).ok().map(|link| link.0)
    }

    pub fn is_active(&self, entity: Entity) -> bool {
        self.world.get::<&ContentActive>(entity).is_ok()
    }

    pub fn matched_data(&self, entity: Entity) -> Option<DataId> {
        self.world.get::<&MatchedData>(entity).ok().map(|m| m.data_id)
    }

    pub fn active_count(&self) -> usize {
        self.world.query::<&ContentActive>().iter().count()
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.world.contains(entity)
    }

    /// Despawn every entity linked to `id`.
    fn despawn_query(&mut self, id: QueryMatchId) -> usize {
        let linked: Vec<Entity> = self
            .world
            .query::<&QueryLink>()
            .iter()
            .filter(|(_, link)| link.0 == id)
            .map(|(entity, _)| entity)
            .collect();
        for &entity in &linked {
            // already gone is fine
            let _ = self.world.despawn(entity);
        }
        linked.len()
    }
}

impl Default for ProxyClients {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchHandler for ProxyClients {
    fn on_acquire(&mut self, result: &QueryResult) -> anyhow::Result<()> {
        if !self.world.contains(result.member) {
            bail!("proxy for query {} no longer exists", result.query_match_id);
        }
        self.world.insert(
            result.member,
            (
                ContentActive,
                MatchedData {
                    data_id: result.data_id,
                    score: result.score,
                },
            ),
        )?;
        debug!("Proxy activated on data {}", result.data_id);
        Ok(())
    }

    fn on_update(&mut self, result: &QueryResult) -> anyhow::Result<()> {
        let mut matched = self
            .world
            .get::<&mut MatchedData>(result.member)
            .with_context(|| format!("updating inactive proxy of query {}", result.query_match_id))?;
        matched.data_id = result.data_id;
        matched.score = result.score;
        Ok(())
    }

    fn on_loss(&mut self, result: QueryResult) -> anyhow::Result<()> {
        if result.terminated {
            self.despawn_query(result.query_match_id);
            return Ok(());
        }
        // a proxy that never became active has nothing to clear
        let _ = self.world.remove::<(ContentActive, MatchedData)>(result.member);
        Ok(())
    }

    fn on_timeout(&mut self, id: QueryMatchId) -> anyhow::Result<()> {
        let despawned = self.despawn_query(id);
        debug!("Despawned {} proxies of timed out query {}", despawned, id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(member: Entity, data: i32, terminated: bool) -> QueryResult {
        QueryResult {
            data_id: DataId(data),
            score: 1.0,
            terminated,
            ..QueryResult::new(QueryMatchId(1), member)
        }
    }

    #[test]
    fn test_acquire_and_loss_toggle_content() {
        let mut clients = ProxyClients::new();
        let proxy = clients.spawn_proxy("table");
        clients.link(proxy, QueryMatchId(1)).unwrap();

        clients.on_acquire(&result(proxy, 4, false)).unwrap();
        assert!(clients.is_active(proxy));
        assert_eq!(clients.matched_data(proxy), Some(DataId(4)));

        clients.on_loss(result(proxy, 4, false)).unwrap();
        assert!(!clients.is_active(proxy));
        assert!(clients.contains(proxy));
    }

    #[test]
    fn test_terminated_loss_despawns_group() {
        let mut clients = ProxyClients::new();
        let (group, members) = clients.spawn_group("room", &["floor", "wall"]);
        clients.link(group, QueryMatchId(1)).unwrap();
        assert!(members.iter().all(|&m| clients.query_of(m) == Some(QueryMatchId(1))));

        clients.on_loss(result(members[0], 2, true)).unwrap();
        assert!(!clients.contains(group));
        assert!(members.iter().all(|&m| !clients.contains(m)));
    }

    #[test]
    fn test_update_on_inactive_proxy_fails() {
        let mut clients = ProxyClients::new();
        let proxy = clients.spawn_proxy("lamp");
        assert!(clients.on_update(&result(proxy, 1, false)).is_err());
    }
}
