//! Rating System
//!
//! Scores every candidate of every seeking row against the row's conditions.
//! A candidate must carry all of the row's trait requirements to be rated;
//! it joins the row's match set only if it passes every condition.

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;

use crate::components::{DataId, RowState, TraitRequirement};
use crate::conditions::{CachedTraitCollection, ConditionRatingsData, ProxyConditions};
use crate::members::ParallelGroupMemberData;
use crate::trait_store::TraitDatabase;

/// Buffers one row rates into.
pub struct RatingBuffers<'a> {
    pub cache: &'a mut CachedTraitCollection,
    pub ratings: &'a mut ConditionRatingsData,
    pub match_set: &'a mut HashSet<DataId>,
    pub reduced: &'a mut HashMap<DataId, f32>,
}

/// Rate `candidates` against `conditions`, replacing the buffers' contents.
pub fn rate_candidates(
    conditions: &ProxyConditions,
    db: &TraitDatabase,
    candidates: &[DataId],
    buffers: RatingBuffers<'_>,
) {
    let RatingBuffers {
        cache,
        ratings,
        match_set,
        reduced,
    } = buffers;

    cache.refresh(conditions, db, candidates);
    ratings.prepare(conditions.len());
    match_set.clear();
    reduced.clear();

    for &id in candidates {
        let mut passed = true;
        for (i, entry) in conditions.entries.iter().enumerate() {
            match cache.get(i, id).and_then(|value| entry.condition.rate(value)) {
                Some(score) => ratings.insert(i, id, score),
                // a missing trait only fails this condition
                None => passed = false,
            }
        }
        if passed {
            let score = conditions.reduce((0..conditions.len()).map(|i| ratings.get(i, id).unwrap_or(0.0)));
            match_set.insert(id);
            reduced.insert(id, score);
        }
    }
}

/// Gather candidates satisfying `requirements` and rate them.
pub fn rate_row(
    conditions: &ProxyConditions,
    requirements: &[TraitRequirement],
    db: &TraitDatabase,
    candidates: &mut Vec<DataId>,
    buffers: RatingBuffers<'_>,
) {
    db.collect_entities_with(requirements, candidates);
    rate_candidates(conditions, db, candidates, buffers);
}

/// Candidates of a rated row, best first: highest score, then lowest id.
pub fn ranked_candidates(reduced: &HashMap<DataId, f32>) -> Vec<(DataId, f32)> {
    let mut ranked: Vec<(DataId, f32)> = reduced.iter().map(|(id, score)| (*id, *score)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
}

/// Rate every seeking row. Fans out across threads once the number of
/// seeking rows reaches `parallel_threshold`. Returns the rows rated.
pub fn rating_system(data: &mut ParallelGroupMemberData, db: &TraitDatabase, parallel_threshold: usize) -> usize {
    let seeking = data.acquiring_indices.len();
    if seeking == 0 {
        return 0;
    }
    if seeking >= parallel_threshold {
        rate_parallel(data, db);
    } else {
        rate_serial(data, db);
    }
    seeking
}

fn rate_serial(data: &mut ParallelGroupMemberData, db: &TraitDatabase) {
    let ParallelGroupMemberData {
        acquiring_indices,
        filtered_acquiring_indices,
        conditions,
        trait_requirements,
        cached_traits,
        condition_ratings,
        condition_match_sets,
        reduced_condition_ratings,
        ..
    } = data;

    filtered_acquiring_indices.clear();
    filtered_acquiring_indices.extend(acquiring_indices.iter().copied());

    let mut candidates = Vec::new();
    for &index in filtered_acquiring_indices.iter() {
        let (Some(conds), Some(reqs), Some(cache), Some(ratings), Some(match_set), Some(reduced)) = (
            conditions[index].as_ref(),
            trait_requirements[index].as_deref(),
            cached_traits[index].as_mut(),
            condition_ratings[index].as_mut(),
            condition_match_sets[index].as_mut(),
            reduced_condition_ratings[index].as_mut(),
        ) else {
            continue;
        };
        rate_row(
            conds,
            reqs,
            db,
            &mut candidates,
            RatingBuffers {
                cache,
                ratings,
                match_set,
                reduced,
            },
        );
    }
}

fn rate_parallel(data: &mut ParallelGroupMemberData, db: &TraitDatabase) {
    let ParallelGroupMemberData {
        acquiring_indices,
        filtered_acquiring_indices,
        states,
        conditions,
        trait_requirements,
        cached_traits,
        condition_ratings,
        condition_match_sets,
        reduced_condition_ratings,
        ..
    } = data;

    filtered_acquiring_indices.clear();
    filtered_acquiring_indices.extend(acquiring_indices.iter().copied());

    (
        states.par_iter(),
        conditions.par_iter(),
        trait_requirements.par_iter(),
        cached_traits.par_iter_mut(),
        condition_ratings.par_iter_mut(),
        condition_match_sets.par_iter_mut(),
        reduced_condition_ratings.par_iter_mut(),
    )
        .into_par_iter()
        .for_each_init(Vec::new, |candidates, (state, conds, reqs, cache, ratings, match_set, reduced)| {
            if *state != RowState::Seeking {
                return;
            }
            let (Some(conds), Some(reqs), Some(cache), Some(ratings), Some(match_set), Some(reduced)) = (
                conds.as_ref(),
                reqs.as_deref(),
                cache.as_mut(),
                ratings.as_mut(),
                match_set.as_mut(),
                reduced.as_mut(),
            ) else {
                return;
            };
            rate_row(
                conds,
                reqs,
                db,
                candidates,
                RatingBuffers {
                    cache,
                    ratings,
                    match_set,
                    reduced,
                },
            );
        });
}
