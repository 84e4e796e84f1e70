//! The worker loop: pull, evaluate, complete, until EOF.

use std::sync::Arc;

use tracing::debug;

use crate::error::SchedError;
use crate::evaluator::Evaluator;
use crate::scheduler::{Pull, Scheduler};

/// Drive one worker until the scheduler signals EOF.
///
/// Spawn as many of these as the evaluator can keep busy:
///
/// ```ignore
/// for _ in 0..workers {
///     tokio::spawn(run_worker(sched.clone(), evaluator.clone()));
/// }
/// ```
pub async fn run_worker(
    sched: Arc<Scheduler>,
    evaluator: Arc<dyn Evaluator>,
) -> Result<(), SchedError> {
    loop {
        match sched.pull().await? {
            Pull::Lease(lease) => {
                let status = evaluator.evaluate(&sched, &lease).await;
                sched.complete(lease, status)?;
            }
            Pull::Eof => {
                debug!("worker draining on EOF");
                return Ok(());
            }
        }
    }
}
