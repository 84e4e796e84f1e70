//! The scheduler boundary: submit, pull, complete.
//!
//! One `std::sync::Mutex` guards the whole scheduler state — frontier,
//! graph, variable table. Critical sections are short and never span an
//! await or an evaluator run: `pull` clones the command out and releases
//! the lock before returning work. Recursive transitions (add → expand →
//! add, complete → expand) happen as `&mut SchedState` methods inside a
//! single acquisition, so the lock needs no reentrancy.
//!
//! `pull` suspends on a [`tokio::sync::Notify`]: the frontier condition.
//! The `Notified` future is registered *before* the state probe so a
//! completion slipping in between cannot be missed.

use std::sync::{Arc, Mutex, MutexGuard};

use parsh_types::{CommandTree, ExitStatus};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::SchedError;
use crate::graph::{NodeId, SchedState, SchedStats};
use crate::intake::{self, Classified};

/// What `submit` did with a tree.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Queued into the graph.
    Queued,
    /// A `cd`/`exit` builtin: evaluate it synchronously, off the graph.
    Sync(CommandTree),
    /// End of input acknowledged.
    Eof,
}

/// A unit of work handed to a worker. Complete it exactly once.
#[derive(Debug)]
pub struct Lease {
    pub(crate) id: NodeId,
    /// The command to evaluate; shared with the scheduler.
    pub command: Arc<CommandTree>,
}

/// What a worker gets from `pull`.
#[derive(Debug)]
pub enum Pull {
    Lease(Lease),
    /// Input is exhausted and the graph has drained; the worker exits.
    Eof,
}

/// The parallel command scheduler.
pub struct Scheduler {
    state: Mutex<SchedState>,
    /// Frontier condition: signalled whenever a node may have become
    /// dispatchable or EOF may have been reached.
    wake: Notify,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedState::new()),
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Feed one parsed tree into the scheduler. Sequences are flattened;
    /// each element is analyzed and added to the graph. `cd`/`exit` come
    /// back for synchronous evaluation. An analyzer rejection skips the
    /// offending command and is surfaced to the caller.
    pub fn submit(&self, tree: CommandTree) -> Result<SubmitOutcome, SchedError> {
        match intake::classify(tree) {
            Classified::Eof => {
                let mut st = self.lock();
                st.frontier.eof = true;
                drop(st);
                debug!("EOF submitted");
                self.wake.notify_waiters();
                Ok(SubmitOutcome::Eof)
            }
            Classified::Sync(tree) => Ok(SubmitOutcome::Sync(tree)),
            Classified::Graph(parts) => {
                let mut st = self.lock();
                if st.frontier.eof {
                    return Err(SchedError::AfterEof);
                }
                let mut result = Ok(SubmitOutcome::Queued);
                for part in parts {
                    if let Err(err) = st.add_root(part) {
                        result = Err(err.into());
                    }
                }
                drop(st);
                self.wake.notify_waiters();
                result
            }
        }
    }

    /// Non-blocking pull. `None` means nothing is dispatchable right now.
    pub fn try_pull(&self) -> Result<Option<Pull>, SchedError> {
        let mut st = self.lock();
        let pulled = st.next_dispatch()?;
        let drained = st.frontier.eof && st.nodes.is_empty();
        drop(st);
        match pulled {
            Some((id, command)) => Ok(Some(Pull::Lease(Lease { id, command }))),
            None if drained => Ok(Some(Pull::Eof)),
            None => Ok(None),
        }
    }

    /// Blocking worker entry: waits until a command is dispatchable or
    /// until EOF with a drained graph.
    pub async fn pull(&self) -> Result<Pull, SchedError> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            // register before probing so no wakeup can fall in the gap
            notified.as_mut().enable();

            if let Some(pull) = self.try_pull()? {
                // A pull can retire directives in place and release their
                // dependents, and an EOF must be seen by every worker:
                // wake the others to re-probe.
                self.wake.notify_waiters();
                return Ok(pull);
            }
            notified.await;
        }
    }

    /// Report a leased command's exit status. Releases dependents, drives
    /// compound expansion, and reaps cancelled completions.
    pub fn complete(&self, lease: Lease, status: ExitStatus) -> Result<(), SchedError> {
        let mut st = self.lock();
        let known = st.nodes.get(&lease.id).is_some_and(|n| n.leased);
        if !known {
            return Err(SchedError::UnknownNode(lease.id));
        }
        st.complete_node(lease.id, status);
        drop(st);
        self.wake.notify_waiters();
        Ok(())
    }

    /// The newest published value of a variable — what an evaluator
    /// resolving `$name` just before execution sees. The dependency edges
    /// guarantee this is the most recent lexically-preceding write: every
    /// earlier writer has published, every later writer is still held off.
    pub fn read_var(&self, name: &str) -> Option<String> {
        self.lock().vars.latest_value(name).map(String::from)
    }

    /// Publish the computed value of one of the leased command's
    /// assignments, releasing any readers blocked on it.
    pub fn publish(&self, lease: &Lease, name: &str, value: impl Into<String>) -> bool {
        let mut st = self.lock();
        let published = st.publish_assignment(lease.id, name, value.into());
        drop(st);
        if published {
            self.wake.notify_waiters();
        }
        published
    }

    /// True once EOF has been signalled and every node has completed.
    pub fn is_quiescent(&self) -> bool {
        let st = self.lock();
        st.frontier.eof && st.nodes.is_empty()
    }

    /// Counters for observability and tests.
    pub fn stats(&self) -> SchedStats {
        self.lock().stats()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
