//! Per-tick systems - run by `MatchWorld::tick_at` in this order:
//! lifecycle (tracking, then timeouts), rating, selection.

pub mod lifecycle;
pub mod rating;
pub mod selection;

pub use lifecycle::{reseek_query, terminate_query, timeout_system, tracking_system, QueryTimer};
pub use rating::{rate_candidates, rating_system};
pub use selection::{selection_system, DataClaims};
