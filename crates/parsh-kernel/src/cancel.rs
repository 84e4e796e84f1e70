//! Break/continue cancellation.
//!
//! A `break`/`continue` node is never handed to a worker: reaching the
//! dispatch cursor *is* its execution. The engine walks up the parent
//! chain to the targeted loop and prunes the in-flight children the
//! directive claims — `continue` takes the rest of the current iteration
//! at or below the target nest, `break` takes every remaining iteration
//! and demotes the loop so its next test cannot re-expand.
//!
//! Pruning cancels scheduling only: a command already running is merely
//! marked, and its eventual completion is reaped without propagating
//! status. The directive itself and the sentinels on its own ancestor
//! chain are never pruned; they complete through normal child accounting.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::access::AccessKind;
use crate::graph::{NodeId, Pending, SchedState};

impl SchedState {
    /// Run the cancellation engine for a completing directive node.
    pub(crate) fn run_directive(&mut self, id: NodeId, kind: AccessKind, target: u32) {
        // Walk up to the loop whose body nest is the target, remembering
        // the ancestor directly below it: that ancestor's iteration stamp
        // is the loop iteration the directive executes in.
        let mut below = id;
        let mut cur = self.nodes.get(&id).and_then(|n| n.parent);
        let mut found = None;
        while let Some(pid) = cur {
            let Some(p) = self.nodes.get(&pid) else { break };
            if p.is_loop && p.nest + 1 == target {
                found = Some(pid);
                break;
            }
            below = pid;
            cur = p.parent;
        }
        let Some(loop_id) = found else {
            warn!("{kind:?} directive {id} has no enclosing loop at nest {target}");
            return;
        };
        if matches!(self.nodes[&loop_id].pending, Pending::Reduced) {
            // already broken out of
            return;
        }
        let iteration = self.nodes[&below].iteration;
        debug!("{kind:?} in loop {loop_id} iteration {iteration}, pruning nest >= {target}");

        // The directive's own chain up to the loop survives pruning, but
        // any loop buried on it is wholly inside the skipped iteration:
        // demote those so they drain instead of re-expanding.
        let mut spared = HashSet::new();
        spared.insert(id);
        let mut cur = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(pid) = cur {
            if pid == loop_id {
                break;
            }
            spared.insert(pid);
            let p = self.nodes.get_mut(&pid);
            let next = p.as_ref().and_then(|n| n.parent);
            if let Some(p) = p
                && p.is_loop
            {
                p.pending = Pending::Reduced;
            }
            cur = next;
        }

        // Demote the target before the sweep so draining children cannot
        // re-expand it.
        if kind == AccessKind::Break
            && let Some(l) = self.nodes.get_mut(&loop_id)
        {
            l.pending = Pending::Reduced;
        }

        let mut targets = Vec::new();
        self.collect_prune(loop_id, kind, target, iteration, &spared, &mut targets);

        for &t in &targets {
            if let Some(n) = self.nodes.get_mut(&t) {
                n.cancelled = true;
                n.access.clear();
            }
        }
        for t in targets {
            if self.nodes.get(&t).is_some_and(|n| !n.leased) {
                self.finalize_cancelled(t);
            }
        }
    }

    /// Collect the loop's descendants the directive claims. A matching
    /// compound takes its entire subtree with it; spared ancestors are
    /// descended into so their other children are still considered.
    fn collect_prune(
        &self,
        parent: NodeId,
        kind: AccessKind,
        target: u32,
        iteration: u64,
        spared: &HashSet<NodeId>,
        out: &mut Vec<NodeId>,
    ) {
        let children = match self.nodes.get(&parent) {
            Some(n) => n.children.clone(),
            None => return,
        };
        for c in children {
            let Some(cn) = self.nodes.get(&c) else {
                continue;
            };
            if spared.contains(&c) {
                self.collect_prune(c, kind, target, iteration, spared, out);
                continue;
            }
            let claimed = cn.nest >= target
                && match kind {
                    AccessKind::Continue => cn.iteration == iteration,
                    AccessKind::Break => cn.iteration >= iteration,
                    _ => false,
                };
            if claimed {
                self.collect_subtree(c, out);
            } else {
                self.collect_prune(c, kind, target, iteration, spared, out);
            }
        }
    }

    /// A pruned compound takes everything it spawned.
    fn collect_subtree(&self, id: NodeId, out: &mut Vec<NodeId>) {
        out.push(id);
        if let Some(n) = self.nodes.get(&id) {
            for &c in &n.children {
                self.collect_subtree(c, out);
            }
        }
    }
}
