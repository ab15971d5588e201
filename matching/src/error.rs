//! Error types for query registration, trait writes and configuration

use thiserror::Error;

use crate::components::{DataId, QueryMatchId, TraitKind};

/// Errors reported by the matching engine.
///
/// Transient data gaps (a trait missing for a tick) are never errors; they
/// only exclude a candidate from a match set.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("query {0} is already registered")]
    DuplicateQuery(QueryMatchId),

    #[error("query has no members")]
    EmptyQuery,

    #[error("member {member} declares neither trait requirements nor conditions")]
    MissingTraitRequirements { member: usize },

    #[error("query {0} is not registered")]
    UnknownQuery(QueryMatchId),

    #[error("relation {relation} references members {members:?} outside the query")]
    InvalidRelation {
        relation: usize,
        members: (usize, usize),
    },

    #[error("data id {0} cannot carry traits")]
    ReservedDataId(DataId),

    #[error("trait '{name}' is stored as {found}, not {expected}")]
    TraitTypeMismatch {
        name: String,
        expected: TraitKind,
        found: TraitKind,
    },

    #[error("member storage cannot grow to {requested} slots")]
    CapacityOverflow { requested: usize },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("failed to read config file: {0}")]
    ConfigRead(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

pub type MatchResult<T> = Result<T, MatchError>;
