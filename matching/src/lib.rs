//! LiveMatch Matching Engine
//!
//! Matches declarative queries against a changing pool of real-world data.
//! Each tick rates candidates for seeking query members, commits the best
//! available assignment, and keeps tracking members honest as data changes.

pub mod clients;
pub mod components;
pub mod conditions;
pub mod config;
pub mod error;
pub mod events;
pub mod members;
pub mod pool;
pub mod relations;
pub mod slots;
pub mod systems;
pub mod tick_runner;
pub mod trait_store;
pub mod world;

pub use components::*;
pub use conditions::{Condition, ProxyConditions};
pub use config::EngineConfig;
pub use error::{MatchError, MatchResult};
pub use events::{MatchEvent, MatchHandler, QueryResult, TickReport};
pub use members::{MemberDescriptor, ParallelGroupMemberData, QueryDescriptor};
pub use relations::Relation;
pub use tick_runner::TickRunner;
pub use trait_store::{TraitDatabase, TraitWriteQueue};
pub use world::MatchWorld;
