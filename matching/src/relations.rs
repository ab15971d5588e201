//! Relations between two members of one query
//!
//! A relation constrains the data matched to two members, e.g. the two poses
//! being within a distance band. Relations only exist inside group queries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::components::{trait_names, DataId, ObjectRef, Pose, QueryMatchId};
use crate::conditions::range_score;
use crate::trait_store::TraitDatabase;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Relation {
    /// Distance between both poses inside `[min, max]`.
    Distance { min: f32, max: f32 },
    /// Height of the second pose minus the first inside `[min, max]`.
    ElevationDifference { min: f32, max: f32 },
}

impl Relation {
    /// Score the pair of matched data, `None` when the relation does not hold
    /// or either pose is missing.
    pub fn rate(&self, db: &TraitDatabase, first: DataId, second: DataId) -> Option<f32> {
        let a = db.try_get::<Pose>(first, trait_names::POSE)?;
        let b = db.try_get::<Pose>(second, trait_names::POSE)?;
        match *self {
            Relation::Distance { min, max } => range_score(a.position.distance(&b.position), min, max),
            Relation::ElevationDifference { min, max } => {
                range_score(b.position.y - a.position.y, min, max)
            }
        }
    }
}

/// A relation as declared on a query descriptor, members by position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelationDescriptor {
    pub relation: Relation,
    pub members: (usize, usize),
}

/// A registered relation, members by their object reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryRelation {
    pub relation: Relation,
    pub first: ObjectRef,
    pub second: ObjectRef,
}

/// A row's part in one of its query's relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationMembership {
    pub relation_index: usize,
    pub is_first: bool,
}

/// Relations of every registered group query.
#[derive(Debug, Default)]
pub struct RelationStore {
    by_query: HashMap<QueryMatchId, Vec<QueryRelation>>,
}

impl RelationStore {
    pub fn insert(&mut self, id: QueryMatchId, relations: Vec<QueryRelation>) {
        if !relations.is_empty() {
            self.by_query.insert(id, relations);
        }
    }

    pub fn remove(&mut self, id: QueryMatchId) -> Option<Vec<QueryRelation>> {
        self.by_query.remove(&id)
    }

    pub fn get(&self, id: QueryMatchId) -> &[QueryRelation] {
        self.by_query.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn clear(&mut self) {
        self.by_query.clear();
    }
}
