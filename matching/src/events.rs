//! Transition events and their delivery to consumers
//!
//! The driver queues events in the order transitions happen; consumers
//! drain the queue or hand it to a [`MatchHandler`]. Each handler call is
//! isolated: a failing handler is logged and the rest still run.

use serde::Serialize;
use tracing::error;

use crate::components::{DataId, ObjectRef, QueryMatchId};

/// What a consumer learns about one member's match.
///
/// Never pooled: a loss event hands the result over to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub query_match_id: QueryMatchId,
    pub member: ObjectRef,
    pub data_id: DataId,
    pub score: f32,
    /// Set on loss when the query will not seek again.
    pub terminated: bool,
}

impl QueryResult {
    pub fn new(query_match_id: QueryMatchId, member: ObjectRef) -> Self {
        Self {
            query_match_id,
            member,
            data_id: DataId::INVALID,
            score: 0.0,
            terminated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchEvent {
    Acquire(QueryResult),
    Update(QueryResult),
    Loss(QueryResult),
    Timeout(QueryMatchId),
}

impl MatchEvent {
    pub fn query_match_id(&self) -> QueryMatchId {
        match self {
            MatchEvent::Acquire(r) | MatchEvent::Update(r) | MatchEvent::Loss(r) => r.query_match_id,
            MatchEvent::Timeout(id) => *id,
        }
    }
}

/// Consumer of transition events (scene spawners, recorders, UI).
pub trait MatchHandler {
    fn on_acquire(&mut self, result: &QueryResult) -> anyhow::Result<()>;

    fn on_update(&mut self, _result: &QueryResult) -> anyhow::Result<()> {
        Ok(())
    }

    /// Takes ownership of the result.
    fn on_loss(&mut self, result: QueryResult) -> anyhow::Result<()>;

    fn on_timeout(&mut self, _id: QueryMatchId) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: u32,
    pub failed: u32,
}

/// Deliver events in order. A handler error is logged and counted, then
/// delivery continues with the next event.
pub fn dispatch<H, I>(events: I, handler: &mut H) -> DispatchReport
where
    H: MatchHandler + ?Sized,
    I: IntoIterator<Item = MatchEvent>,
{
    let mut report = DispatchReport::default();
    for event in events {
        let id = event.query_match_id();
        let (kind, outcome) = match event {
            MatchEvent::Acquire(result) => ("acquire", handler.on_acquire(&result)),
            MatchEvent::Update(result) => ("update", handler.on_update(&result)),
            MatchEvent::Loss(result) => ("loss", handler.on_loss(result)),
            MatchEvent::Timeout(id) => ("timeout", handler.on_timeout(id)),
        };
        match outcome {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                error!("{} handler for query {} failed: {:#}", kind, id, e);
                report.failed += 1;
            }
        }
    }
    report
}

/// Counts of what happened during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub trait_writes_applied: u32,
    pub acquired: u32,
    pub updated: u32,
    pub lost: u32,
    pub timed_out: u32,
    pub seeking_rows: u32,
    pub tracking_rows: u32,
}

impl TickReport {
    pub fn record(&mut self, event: &MatchEvent) {
        match event {
            MatchEvent::Acquire(_) => self.acquired += 1,
            MatchEvent::Update(_) => self.updated += 1,
            MatchEvent::Loss(_) => self.lost += 1,
            MatchEvent::Timeout(_) => self.timed_out += 1,
        }
    }
}
