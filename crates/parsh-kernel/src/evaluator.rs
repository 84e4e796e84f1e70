//! The evaluator seam.
//!
//! The scheduler orders commands; an [`Evaluator`] runs them. Before
//! executing, an evaluator resolves `$name` references through
//! [`Scheduler::read_var`] — by the time a command is dispatched, every
//! writer it depends on has published and no later writer has run. After
//! executing an assignment, the evaluator must call [`Scheduler::publish`]
//! with the computed value; a writer that fails without publishing is
//! backstopped by the scheduler, which carries the prior value forward.

use async_trait::async_trait;
use parsh_types::ExitStatus;

use crate::scheduler::{Lease, Scheduler};

/// Executes a single leased command tree and reports its exit status.
///
/// Failures are statuses, never scheduler errors: a nonzero status feeds
/// and/or/if/while/until selection like any other result.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, sched: &Scheduler, lease: &Lease) -> ExitStatus;
}
