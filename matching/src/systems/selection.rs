//! Selection System
//!
//! Turns rated rows into committed matches. Queries are visited in ascending
//! id order; each one sees the claims left by the queries before it. A group
//! query is solved as a whole: either every required member gets data that
//! satisfies the group's relations, or nothing is committed for it.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use tracing::trace;

use crate::components::{DataId, Exclusivity, QueryMatchId, RowState};
use crate::events::MatchEvent;
use crate::members::ParallelGroupMemberData;
use crate::relations::{Relation, RelationStore};
use crate::systems::rating::ranked_candidates;
use crate::trait_store::TraitDatabase;

/// Which data is held by which kind of row.
///
/// Exclusive rows block every other exclusive or shared use of their data;
/// shared rows block exclusive use. Read-only rows neither claim nor block.
#[derive(Debug, Default)]
pub struct DataClaims {
    exclusive: HashMap<DataId, QueryMatchId>,
    shared: HashMap<DataId, usize>,
}

impl DataClaims {
    pub fn is_available(&self, data: DataId, exclusivity: Exclusivity) -> bool {
        match exclusivity {
            Exclusivity::ReadOnly => true,
            Exclusivity::Shared => !self.exclusive.contains_key(&data),
            Exclusivity::ExclusiveBestMatch => {
                !self.exclusive.contains_key(&data) && self.shared_count(data) == 0
            }
        }
    }

    pub fn claim(&mut self, data: DataId, exclusivity: Exclusivity, owner: QueryMatchId) {
        match exclusivity {
            Exclusivity::ReadOnly => {}
            Exclusivity::Shared => *self.shared.entry(data).or_insert(0) += 1,
            Exclusivity::ExclusiveBestMatch => {
                self.exclusive.insert(data, owner);
            }
        }
    }

    pub fn release(&mut self, data: DataId, exclusivity: Exclusivity) {
        match exclusivity {
            Exclusivity::ReadOnly => {}
            Exclusivity::Shared => {
                if let Some(count) = self.shared.get_mut(&data) {
                    *count -= 1;
                    if *count == 0 {
                        self.shared.remove(&data);
                    }
                }
            }
            Exclusivity::ExclusiveBestMatch => {
                self.exclusive.remove(&data);
            }
        }
    }

    pub fn exclusive_owner(&self, data: DataId) -> Option<QueryMatchId> {
        self.exclusive.get(&data).copied()
    }

    pub fn shared_count(&self, data: DataId) -> usize {
        self.shared.get(&data).copied().unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.exclusive.clear();
        self.shared.clear();
    }
}

/// A relation seen from its later member: `other` is an earlier position in
/// the query's row list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RelationLink {
    pub other: usize,
    pub relation: Relation,
    /// Whether the row owning this link is the relation's first member.
    pub is_first: bool,
}

impl RelationLink {
    /// Rate the relation with this row holding `own` and the other `other`.
    pub fn rate(&self, db: &TraitDatabase, own: DataId, other: DataId) -> Option<f32> {
        if self.is_first {
            self.relation.rate(db, own, other)
        } else {
            self.relation.rate(db, other, own)
        }
    }
}

/// Relation links per position of `rows`, each relation stored once at the
/// position of its later member.
pub(crate) fn relation_links(
    data: &ParallelGroupMemberData,
    relations: &RelationStore,
    id: QueryMatchId,
    rows: &[usize],
) -> Vec<Vec<RelationLink>> {
    let query_relations = relations.get(id);
    let mut links = vec![Vec::new(); rows.len()];
    if query_relations.is_empty() {
        return links;
    }
    for (pos, &index) in rows.iter().enumerate() {
        for membership in data.relation_memberships(index) {
            let Some(relation) = query_relations.get(membership.relation_index) else {
                continue;
            };
            let Some((first, second)) = data.try_get_relation_member_indices(id, relation.first, relation.second)
            else {
                continue;
            };
            let other_index = if membership.is_first { second } else { first };
            let Some(other) = rows.iter().position(|&i| i == other_index) else {
                continue;
            };
            if other < pos {
                links[pos].push(RelationLink {
                    other,
                    relation: relation.relation,
                    is_first: membership.is_first,
                });
            }
        }
    }
    links
}

type Assignment = Vec<Option<(DataId, f32)>>;

/// Exhaustive search over capped candidate lists with a score bound.
struct GroupSolver<'a> {
    candidates: &'a [Vec<(DataId, f32)>],
    required: &'a [bool],
    links: &'a [Vec<RelationLink>],
    db: &'a TraitDatabase,
    /// Best score still reachable from each position onward.
    optimistic: Vec<f32>,
    current: Assignment,
    best: Option<(f32, Assignment)>,
}

impl<'a> GroupSolver<'a> {
    fn new(
        candidates: &'a [Vec<(DataId, f32)>],
        required: &'a [bool],
        links: &'a [Vec<RelationLink>],
        db: &'a TraitDatabase,
    ) -> Self {
        let n = candidates.len();
        let mut optimistic = vec![0.0; n + 1];
        for pos in (0..n).rev() {
            let top = candidates[pos].first().map_or(0.0, |(_, score)| *score);
            // relation scores never exceed 1
            optimistic[pos] = optimistic[pos + 1] + top + links[pos].len() as f32;
        }
        Self {
            candidates,
            required,
            links,
            db,
            optimistic,
            current: vec![None; n],
            best: None,
        }
    }

    fn solve(mut self) -> Option<Assignment> {
        if self.candidates.is_empty() {
            return None;
        }
        self.search(0, 0.0);
        self.best.map(|(_, assignment)| assignment)
    }

    fn search(&mut self, pos: usize, score: f32) {
        if let Some((best, _)) = &self.best {
            if score + self.optimistic[pos] < *best {
                return;
            }
        }
        if pos == self.candidates.len() {
            self.offer(score);
            return;
        }

        for c in 0..self.candidates[pos].len() {
            let (data, member_score) = self.candidates[pos][c];
            if self.current[..pos].iter().flatten().any(|(taken, _)| *taken == data) {
                continue;
            }
            let Some(relation_score) = self.relation_score(pos, data) else {
                continue;
            };
            self.current[pos] = Some((data, member_score));
            self.search(pos + 1, score + member_score + relation_score);
            self.current[pos] = None;
        }

        if !self.required[pos] {
            self.search(pos + 1, score);
        }
    }

    /// Sum of relation scores against already assigned rows, `None` when one
    /// fails. Relations with an unassigned optional member are skipped.
    fn relation_score(&self, pos: usize, data: DataId) -> Option<f32> {
        let mut total = 0.0;
        for link in &self.links[pos] {
            if let Some((other, _)) = self.current[link.other] {
                total += link.rate(self.db, data, other)?;
            }
        }
        Some(total)
    }

    fn offer(&mut self, score: f32) {
        if self.current.iter().all(Option::is_none) {
            return;
        }
        let better = match &self.best {
            None => true,
            Some((best, assignment)) => match score.total_cmp(best) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => compare_assignments(&self.current, assignment) == Ordering::Less,
            },
        };
        if better {
            self.best = Some((score, self.current.clone()));
        }
    }
}

/// Row by row on data id; an unassigned row sorts after any assigned one.
fn compare_assignments(a: &Assignment, b: &Assignment) -> Ordering {
    let key = |slot: &Option<(DataId, f32)>| slot.map_or(i64::MAX, |(id, _)| i64::from(id.0));
    a.iter().map(key).cmp(b.iter().map(key))
}

/// Commit the best available matches for every seeking query. Returns the
/// number of rows that acquired.
pub fn selection_system(
    data: &mut ParallelGroupMemberData,
    claims: &mut DataClaims,
    relations: &RelationStore,
    db: &TraitDatabase,
    max_group_candidates: usize,
    events: &mut Vec<MatchEvent>,
) -> u32 {
    data.potential_match_acquiring_indices.clear();
    for i in 0..data.filtered_acquiring_indices.len() {
        let index = data.filtered_acquiring_indices[i];
        if data.condition_match_set(index).is_some_and(|set| !set.is_empty()) {
            data.potential_match_acquiring_indices.push(index);
        }
    }

    let seeking_queries: BTreeSet<QueryMatchId> = data
        .potential_match_acquiring_indices
        .iter()
        .map(|&index| data.query_match_ids[index])
        .collect();

    let mut acquired = 0;
    for id in seeking_queries {
        let Some(rows) = data.indices_of(id).map(<[usize]>::to_vec) else {
            continue;
        };
        if rows.iter().any(|&index| data.state(index) != RowState::Seeking) {
            continue;
        }

        let candidates: Vec<Vec<(DataId, f32)>> = rows
            .iter()
            .map(|&index| {
                let exclusivity = data.exclusivity(index);
                data.reduced_ratings(index)
                    .map(|reduced| {
                        ranked_candidates(reduced)
                            .into_iter()
                            .filter(|(candidate, _)| claims.is_available(*candidate, exclusivity))
                            .take(max_group_candidates.max(1))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            })
            .collect();
        let required: Vec<bool> = rows.iter().map(|&index| data.is_required(index)).collect();
        let links = relation_links(data, relations, id, &rows);

        let Some(assignment) = GroupSolver::new(&candidates, &required, &links, db).solve() else {
            trace!("Query {} found no acceptable assignment", id);
            continue;
        };

        for (&index, slot) in rows.iter().zip(assignment) {
            match slot {
                Some((chosen, score)) => {
                    claims.claim(chosen, data.exclusivity(index), id);
                    data.commit_match(index, chosen, score);
                    data.definite_match_acquire_indices.push(index);
                    if let Some(result) = data.query_result(index) {
                        events.push(MatchEvent::Acquire(result.clone()));
                    }
                    acquired += 1;
                }
                // unmatched optional members wait for the next reseek
                None => {
                    data.release_match(index, false);
                }
            }
        }
    }
    acquired
}
