//! Lifecycle System
//!
//! Keeps committed matches honest. Every tick each tracking row is checked
//! against the current trait data; rows that no longer hold are lost, and a
//! lost required row takes its whole query back to seeking. Seeking queries
//! that outlive their timeout are dropped.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::components::{DataId, QueryMatchId, RowState};
use crate::events::MatchEvent;
use crate::members::ParallelGroupMemberData;
use crate::relations::RelationStore;
use crate::systems::rating::{rate_candidates, RatingBuffers};
use crate::systems::selection::{relation_links, DataClaims};
use crate::trait_store::{TraitChanges, TraitDatabase};

/// When a query started its current seek, and how long it may seek.
#[derive(Debug, Clone, Copy)]
pub struct QueryTimer {
    pub seeking_since: Instant,
    pub timeout: Option<Duration>,
}

impl QueryTimer {
    pub fn new(now: Instant, timeout: Option<Duration>) -> Self {
        Self {
            seeking_since: now,
            timeout,
        }
    }

    pub fn restart(&mut self, now: Instant) {
        self.seeking_since = now;
    }

    pub fn expired(&self, now: Instant) -> bool {
        match self.timeout {
            Some(timeout) => now.saturating_duration_since(self.seeking_since) >= timeout,
            None => false,
        }
    }
}

/// Release a tracking row's claim and match, queuing its loss.
fn lose_row(
    data: &mut ParallelGroupMemberData,
    claims: &mut DataClaims,
    index: usize,
    reseek: bool,
    events: &mut Vec<MatchEvent>,
) {
    let matched = data.best_match(index);
    claims.release(matched, data.exclusivity(index));
    if let Some(result) = data.query_result(index) {
        events.push(MatchEvent::Loss(result.clone()));
    }
    data.release_match(index, reseek);
}

/// Score of `matched` for row `index` against current data, `None` when the
/// match no longer holds.
fn revalidate(data: &mut ParallelGroupMemberData, db: &TraitDatabase, index: usize, matched: DataId) -> Option<f32> {
    if !db.contains_entity(matched) || !db.satisfies(matched, data.trait_requirements(index)) {
        return None;
    }
    let conditions = data.conditions[index].as_ref()?;

    let mut cache = data.pools.trait_caches.get();
    let mut ratings = data.pools.condition_ratings.get();
    let mut match_set: HashSet<DataId> = data.pools.data_id_sets.get();
    let mut reduced: HashMap<DataId, f32> = data.pools.ratings.get();
    rate_candidates(
        conditions,
        db,
        &[matched],
        RatingBuffers {
            cache: &mut cache,
            ratings: &mut ratings,
            match_set: &mut match_set,
            reduced: &mut reduced,
        },
    );
    let score = reduced.get(&matched).copied();

    data.pools.trait_caches.recycle(cache);
    data.pools.condition_ratings.recycle(ratings);
    data.pools.data_id_sets.recycle(match_set);
    data.pools.ratings.recycle(reduced);
    score
}

/// Check every tracking row. Returns the queries that went back to seeking.
pub fn tracking_system(
    data: &mut ParallelGroupMemberData,
    claims: &mut DataClaims,
    relations: &RelationStore,
    db: &TraitDatabase,
    changes: &TraitChanges,
    emit_updates: bool,
    events: &mut Vec<MatchEvent>,
) -> Vec<QueryMatchId> {
    let tracking_queries: BTreeSet<QueryMatchId> =
        data.updating_indices.iter().map(|&index| data.query_match_ids[index]).collect();

    let mut reseeking = Vec::new();
    for id in tracking_queries {
        let Some(rows) = data.indices_of(id).map(<[usize]>::to_vec) else {
            continue;
        };
        let links = relation_links(data, relations, id, &rows);

        let mut scores: Vec<Option<f32>> = vec![None; rows.len()];
        let mut failed = vec![false; rows.len()];
        for (pos, &index) in rows.iter().enumerate() {
            if data.state(index) != RowState::Tracking {
                continue;
            }
            let matched = data.best_match(index);
            scores[pos] = revalidate(data, db, index, matched);
            failed[pos] = scores[pos].is_none();
        }

        // a broken relation fails both of its members
        for (pos, row_links) in links.iter().enumerate() {
            for link in row_links {
                if scores[pos].is_none() || scores[link.other].is_none() {
                    continue;
                }
                let own = data.best_match(rows[pos]);
                let other = data.best_match(rows[link.other]);
                if link.rate(db, own, other).is_none() {
                    failed[pos] = true;
                    failed[link.other] = true;
                }
            }
        }

        let tracking: Vec<usize> = (0..rows.len())
            .filter(|&pos| data.state(rows[pos]) == RowState::Tracking)
            .collect();
        let required_lost = tracking.iter().any(|&pos| failed[pos] && data.is_required(rows[pos]));
        let all_lost = tracking.iter().all(|&pos| failed[pos]);

        if required_lost || all_lost {
            debug!("Query {} lost its match, seeking again", id);
            for &index in &rows {
                match data.state(index) {
                    RowState::Tracking => lose_row(data, claims, index, true, events),
                    RowState::Dropped => data.reseek(index),
                    _ => {}
                }
            }
            reseeking.push(id);
            continue;
        }

        for &pos in &tracking {
            let index = rows[pos];
            if failed[pos] {
                trace!("Optional member of query {} at row {} dropped", id, index);
                lose_row(data, claims, index, false, events);
                continue;
            }
            let matched = data.best_match(index);
            if !emit_updates || !changes.changed.contains(&matched) {
                continue;
            }
            if let (Some(result), Some(score)) = (data.query_results[index].as_mut(), scores[pos]) {
                result.score = score;
                events.push(MatchEvent::Update(result.clone()));
            }
        }
    }
    reseeking
}

/// Drop a query's matches and put every row back to seeking.
/// Returns the number of rows that lost a match.
pub fn reseek_query(
    data: &mut ParallelGroupMemberData,
    claims: &mut DataClaims,
    id: QueryMatchId,
    events: &mut Vec<MatchEvent>,
) -> usize {
    let Some(rows) = data.indices_of(id).map(<[usize]>::to_vec) else {
        return 0;
    };
    let mut lost = 0;
    for index in rows {
        match data.state(index) {
            RowState::Tracking => {
                lose_row(data, claims, index, true, events);
                lost += 1;
            }
            RowState::Dropped => data.reseek(index),
            _ => {}
        }
    }
    lost
}

/// Remove a query for good. Tracking rows report a terminated loss.
/// `None` when the id is unknown, else the number of rows that lost a match.
pub fn terminate_query(
    data: &mut ParallelGroupMemberData,
    claims: &mut DataClaims,
    relations: &mut RelationStore,
    id: QueryMatchId,
    events: &mut Vec<MatchEvent>,
) -> Option<usize> {
    let removed = data.remove_rows(id)?;
    relations.remove(id);

    let mut lost = 0;
    for row in removed {
        if row.state != RowState::Tracking {
            continue;
        }
        claims.release(row.best_match, row.exclusivity);
        if let Some(mut result) = row.result {
            result.terminated = true;
            events.push(MatchEvent::Loss(result));
        }
        lost += 1;
    }
    Some(lost)
}

/// Remove seeking queries whose timer ran out. Returns the removed ids.
pub fn timeout_system(
    data: &mut ParallelGroupMemberData,
    claims: &mut DataClaims,
    relations: &mut RelationStore,
    timers: &HashMap<QueryMatchId, QueryTimer>,
    now: Instant,
    events: &mut Vec<MatchEvent>,
) -> Vec<QueryMatchId> {
    let mut expired: Vec<QueryMatchId> = timers
        .iter()
        .filter(|(_, timer)| timer.expired(now))
        .map(|(id, _)| *id)
        .filter(|id| {
            data.indices_of(*id)
                .is_some_and(|rows| rows.iter().all(|&index| data.state(index) != RowState::Tracking))
        })
        .collect();
    expired.sort_unstable();

    for &id in &expired {
        warn!("Query {} timed out while seeking", id);
        terminate_query(data, claims, relations, id, events);
        events.push(MatchEvent::Timeout(id));
    }
    expired
}
