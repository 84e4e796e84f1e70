//! parsh-kernel: the parallel command scheduler of parsh.
//!
//! Parsed command trees become nodes of a directed dependency graph whose
//! ready set — the *frontier* — feeds worker tasks, while static
//! read/write analysis of files and variables preserves the happens-before
//! order the shell semantics require.
//!
//! This crate provides:
//!
//! - **Access analysis**: a command's file/variable read-write footprint
//!   and the conflict predicate over footprints
//! - **Dependency graph**: nodes, edges from write collisions, and the
//!   unresolved-dependency accounting
//! - **Frontier**: the ordered runnables list with its dispatch cursor
//! - **Compound expansion**: and/or/if/while/until/for sentinels that
//!   expand their bodies as test statuses are observed
//! - **Variable versioning**: per-assignment versions that let readers
//!   block on exactly the writer they depend on
//! - **Cancellation**: break/continue pruning of queued loop work
//! - **Intake**: normalization of raw parsed trees, builtin bypass
//!
//! The parser and the command evaluator are external collaborators: the
//! parser feeds [`Scheduler::submit`], workers loop on
//! [`Scheduler::pull`] / [`Scheduler::complete`] around an [`Evaluator`].

pub mod access;
mod cancel;
pub mod error;
pub mod evaluator;
mod expand;
mod frontier;
pub mod graph;
mod intake;
pub mod scheduler;
mod vars;
pub mod worker;

pub use error::{AnalyzerError, SchedError};
pub use evaluator::Evaluator;
pub use graph::{NodeId, SchedStats};
pub use scheduler::{Lease, Pull, Scheduler, SubmitOutcome};
pub use vars::VersionId;
pub use worker::run_worker;

// Re-export the interface types alongside the kernel for convenience.
pub use parsh_types::{Assign, CommandTree, ExitStatus, Redirect, RedirectKind, RedirectTarget, Word};
