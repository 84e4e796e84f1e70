//! Scheduler error taxonomy.
//!
//! Evaluator failures are never represented here: they flow back as exit
//! statuses and participate in branch selection. Errors in this module are
//! either intake rejections (the command is skipped) or invariant
//! violations that indicate a scheduler bug.

use thiserror::Error;

use crate::graph::NodeId;

/// A malformed `CommandTree` reached the access analyzer.
///
/// The offending command is skipped; the scheduler keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyzerError {
    /// `VarAssign` must wrap a `Simple` carrying only assignments.
    #[error("VarAssign must wrap an assignment-only simple command")]
    MalformedVarAssign,
    /// A pipeline with no members.
    #[error("empty pipeline")]
    EmptyPipeline,
    /// `Eof` is an intake signal, not a schedulable command.
    #[error("Eof cannot be scheduled")]
    EofInGraph,
}

/// Errors surfaced at the scheduler boundary.
#[derive(Debug, Error)]
pub enum SchedError {
    /// Intake rejected the command tree; it was not queued.
    #[error("intake rejected command: {0}")]
    Analyzer(#[from] AnalyzerError),
    /// A dispatched node had unresolved dependencies. Scheduler bug; fatal
    /// for the session.
    #[error("dependency invariant violated: node {0} dispatched with {1} unresolved")]
    DependencyInvariant(NodeId, usize),
    /// Completion reported for a node the scheduler no longer tracks.
    #[error("completion for unknown node {0}")]
    UnknownNode(NodeId),
    /// New work submitted after EOF was signalled.
    #[error("submit after EOF")]
    AfterEof,
}
