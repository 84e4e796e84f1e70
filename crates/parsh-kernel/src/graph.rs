//! The directed dependency graph.
//!
//! A node represents one schedulable command; its dependents are the
//! commands that must wait for it. Nodes whose `unresolved` count is zero
//! sit on the frontier. Compound constructs (and/or/if/while/until/for)
//! enter the graph as *sentinel* nodes that expand their test segment on
//! reaching the frontier and their body once the test's exit status is
//! known; see the `expand` module.
//!
//! Nodes are kept in an id-keyed arena. Ids are never reused, so a stale
//! reference (a finished child's parent pointer, a pruned node left in a
//! dependents list) is detected by a failed map lookup rather than by
//! chasing freed memory.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use parsh_types::{CommandTree, ExitStatus, Redirect, Word};
use tracing::{debug, trace, warn};

use crate::access::{self, AccessKind, AccessSet, AccessView, Clash};
use crate::error::{AnalyzerError, SchedError};
use crate::frontier::Frontier;
use crate::vars::{VarTable, VersionId};

/// Graph node identifier. Monotone, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Sentinel state machine for compound nodes. `Simple` marks an ordinary
/// dispatchable command; everything else is a sentinel that is skipped by
/// dispatch and completes through child accounting.
#[derive(Debug)]
pub(crate) enum Pending {
    Simple,
    And {
        left: Option<CommandTree>,
        right: Option<CommandTree>,
    },
    Or {
        left: Option<CommandTree>,
        right: Option<CommandTree>,
    },
    If {
        test: Option<CommandTree>,
        then_branch: Option<CommandTree>,
        else_branch: Option<CommandTree>,
    },
    While {
        test: CommandTree,
        body: CommandTree,
    },
    Until {
        test: CommandTree,
        body: CommandTree,
    },
    For {
        var: String,
        items: VecDeque<Word>,
        body: CommandTree,
    },
    /// Expansion finished (or cut short by `break`); removable once the
    /// last child completes.
    Reduced,
}

impl Pending {
    pub fn is_sentinel(&self) -> bool {
        !matches!(self, Pending::Simple)
    }

    pub fn is_loop(&self) -> bool {
        matches!(
            self,
            Pending::While { .. } | Pending::Until { .. } | Pending::For { .. }
        )
    }
}

/// One node of the graph. Its id is its key in the arena.
pub(crate) struct GraphNode {
    /// The command as submitted; shared with the evaluator on dispatch.
    pub command: Arc<CommandTree>,
    /// Static access approximation; the placeholder for sentinels.
    pub access: AccessSet,
    /// Downstream nodes waiting on this one, insertion-ordered.
    pub dependents: Vec<NodeId>,
    /// Upstream completions (and variable publications) still owed.
    pub unresolved: usize,
    /// Enclosing compound sentinel, if this node was spawned by expansion.
    pub parent: Option<NodeId>,
    /// Spawned children still alive (sentinels only).
    pub children: Vec<NodeId>,
    /// Count of `children`; the sentinel completes when it reaches zero
    /// after reduction.
    pub active: usize,
    /// Loop-nesting depth: root commands are 0, a single loop's body is 1.
    pub nest: u32,
    /// Iteration stamp: the innermost enclosing loop's counter at creation.
    /// Never changes; cancellation targets match against it.
    pub iteration: u64,
    /// Loop sentinels only: this loop's own iteration counter, bumped each
    /// time the body expands and stamped onto the new body children.
    pub loop_iteration: u64,
    /// Last command of a compound's test segment; its status drives
    /// expansion.
    pub test_tail: bool,
    /// Last command of a compound's body; its status becomes the
    /// compound's status.
    pub body_tail: bool,
    /// Pruned by break/continue; dispatch skips it, completion is reaped.
    pub cancelled: bool,
    /// Currently handed to a worker.
    pub leased: bool,
    /// Last observed exit status (sentinels: the compound's status).
    pub status: ExitStatus,
    pub pending: Pending,
    /// True for while/until/for cores, surviving demotion to `Reduced`.
    pub is_loop: bool,
    /// Set when the core command is a `break`/`continue` directive.
    pub directive: Option<(AccessKind, u32)>,
    /// Redirections peeled off a compound's wrappers, re-applied to every
    /// expanded child.
    pub wrap_redirects: Vec<Redirect>,
    /// Variable versions this node registered on as a reader.
    pub reads: Vec<(String, VersionId)>,
    /// Variable versions this node will publish as a writer.
    pub writes: Vec<(String, VersionId)>,
}

/// Counters exposed for observability and quiescence checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedStats {
    pub nodes: usize,
    pub frontier: usize,
    pub waiters: usize,
    pub versions: usize,
    pub obsolete_versions: usize,
}

/// The scheduler state behind the one lock. All graph transitions —
/// including the recursive add → expand → add and complete → expand paths —
/// run as `&mut self` methods inside a single acquisition, which is what
/// lets the lock stay non-reentrant.
pub(crate) struct SchedState {
    pub nodes: HashMap<NodeId, GraphNode>,
    next_id: u64,
    pub frontier: Frontier,
    pub vars: VarTable,
}

impl SchedState {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            next_id: 1,
            frontier: Frontier::new(),
            vars: VarTable::new(),
        }
    }

    // ── node creation ────────────────────────────────────────────────

    /// Build a node for `tree`. Compound cores become sentinels carrying
    /// their unexpanded segments; `Background`/`Redir` wrappers around a
    /// compound are peeled, with their redirections re-applied to every
    /// expanded child.
    fn create_node(
        &mut self,
        tree: CommandTree,
        parent: Option<NodeId>,
        nest: u32,
        iteration: u64,
        test_tail: bool,
        body_tail: bool,
    ) -> Result<NodeId, AnalyzerError> {
        let access = access::analyze(&tree, nest)?;

        let (core, wrap_redirects) = peel(&tree);
        let pending = match core {
            CommandTree::And(a, b) => Pending::And {
                left: Some((**a).clone()),
                right: Some((**b).clone()),
            },
            CommandTree::Or(a, b) => Pending::Or {
                left: Some((**a).clone()),
                right: Some((**b).clone()),
            },
            CommandTree::If {
                test,
                then_branch,
                else_branch,
            } => Pending::If {
                test: Some((**test).clone()),
                then_branch: Some((**then_branch).clone()),
                else_branch: else_branch.as_ref().map(|e| (**e).clone()),
            },
            CommandTree::While { test, body } => Pending::While {
                test: (**test).clone(),
                body: (**body).clone(),
            },
            CommandTree::Until { test, body } => Pending::Until {
                test: (**test).clone(),
                body: (**body).clone(),
            },
            CommandTree::For { var, items, body } => Pending::For {
                var: var.clone(),
                items: items.iter().cloned().collect(),
                body: (**body).clone(),
            },
            _ => Pending::Simple,
        };
        let is_loop = pending.is_loop();
        let directive = match core {
            CommandTree::Break(_) | CommandTree::Continue(_) => access.directive(),
            _ => None,
        };

        let id = NodeId(self.next_id);
        self.next_id += 1;

        if let Some(pid) = parent
            && let Some(p) = self.nodes.get_mut(&pid)
        {
            p.active += 1;
            p.children.push(id);
        }

        trace!("create {id} nest={nest} iter={iteration} access={access:?}");
        self.nodes.insert(
            id,
            GraphNode {
                command: Arc::new(tree),
                access,
                dependents: Vec::new(),
                unresolved: 0,
                parent,
                children: Vec::new(),
                active: 0,
                nest,
                iteration,
                loop_iteration: 0,
                test_tail,
                body_tail,
                cancelled: false,
                leased: false,
                status: ExitStatus::SUCCESS,
                pending,
                is_loop,
                directive,
                wrap_redirects,
                reads: Vec::new(),
                writes: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Register the node's variable traffic: reads bind to the latest
    /// version (queueing if unpublished), writes create fresh versions.
    /// Reads first — an assignment whose value mentions its own variable
    /// must bind to the previous version.
    fn register_vars(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if node.pending.is_sentinel() {
            // Sentinels stand in through their access set alone; the
            // expanded children do the actual version traffic.
            return;
        }
        let read_names: Vec<String> = node.access.var_reads().map(String::from).collect();
        let write_names: Vec<String> = node.access.var_writes().map(String::from).collect();

        for name in read_names {
            if let Some(vid) = self.vars.read_latest(&name) {
                if self.vars.queue_reader(&name, vid, id) {
                    self.nodes.get_mut(&id).unwrap().unresolved += 1;
                }
                self.nodes.get_mut(&id).unwrap().reads.push((name, vid));
            }
        }
        for name in write_names {
            let vid = self.vars.create_version(&name);
            self.nodes.get_mut(&id).unwrap().writes.push((name, vid));
        }
    }

    // ── graph add ────────────────────────────────────────────────────

    /// Add a top-level command (from intake).
    pub fn add_root(&mut self, tree: CommandTree) -> Result<NodeId, AnalyzerError> {
        let id = self.create_node(tree, None, 0, 0, false, false)?;
        self.register_vars(id);
        self.scan_and_attach(id, None);
        self.settle(id);
        Ok(id)
    }

    /// Add an expanded child of a compound sentinel. Its dependency scan is
    /// scoped to the sentinel's subtree: ordering against everything
    /// outside is already mediated by the sentinel itself.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        tree: CommandTree,
        nest: u32,
        iteration: u64,
        test_tail: bool,
        body_tail: bool,
    ) -> Result<NodeId, AnalyzerError> {
        let id = self.create_node(tree, Some(parent), nest, iteration, test_tail, body_tail)?;
        self.register_vars(id);
        self.scan_and_attach(id, Some(parent));
        self.settle(id);
        Ok(id)
    }

    /// Walk the frontier in insertion order and record dependencies.
    /// Ancestors are never scanned — a child must not wait on its own
    /// enclosing sentinel. The scan covers the whole frontier: cutting it
    /// short after a dependency lands on a loop sentinel would miss
    /// collisions with nodes reachable only through later entries, and
    /// `dep_add`'s duplicate suppression already keeps the extra walking
    /// from stacking redundant edges.
    pub fn scan_and_attach(&mut self, id: NodeId, scope: Option<NodeId>) {
        let ancestors = self.ancestor_set(id);
        for f in self.frontier.snapshot() {
            if f == id || ancestors.contains(&f) {
                continue;
            }
            if let Some(root) = scope
                && !self.in_subtree(f, root)
            {
                continue;
            }
            let added = self.dep_add(id, f);
            if added > 0 {
                self.nodes.get_mut(&id).unwrap().unresolved += added;
            }
        }
    }

    /// Frontier the node if nothing holds it.
    pub fn settle(&mut self, id: NodeId) {
        if self.nodes.get(&id).is_some_and(|n| n.unresolved == 0) {
            self.frontier_add(id);
        }
    }

    /// Establish dependencies of `new_id` on `node_id` and, transitively,
    /// on its dependents. Returns the number of edges charged to `new_id`.
    ///
    /// The first write collision along a path appends `new_id` as a direct
    /// dependent; if the recursion already attached it further down, the
    /// node is reachable and no direct edge is added. Concurrent reads
    /// never order. The recursion descends through non-conflicting nodes
    /// too: a blocked dependent may conflict on a name its upstream never
    /// touches, and skipping past it would let the new command race it.
    fn dep_add(&mut self, new_id: NodeId, node_id: NodeId) -> usize {
        if new_id == node_id {
            return 0;
        }
        let clash = self.clash_between(new_id, node_id);
        let dependents = match self.nodes.get(&node_id) {
            Some(n) => n.dependents.clone(),
            None => return 0,
        };
        if dependents.contains(&new_id) {
            return 0;
        }
        let mut deps = 0;
        for d in dependents {
            if self.nodes.contains_key(&d) {
                deps += self.dep_add(new_id, d);
            }
        }
        if deps == 0 && clash == Clash::WriteCollision {
            trace!("edge {node_id} -> {new_id}");
            self.nodes.get_mut(&node_id).unwrap().dependents.push(new_id);
            deps = 1;
        }
        deps
    }

    fn clash_between(&self, a: NodeId, b: NodeId) -> Clash {
        let (Some(na), Some(nb)) = (self.nodes.get(&a), self.nodes.get(&b)) else {
            return Clash::NoClash;
        };
        access::conflict(view(na), view(nb))
    }

    // ── frontier ─────────────────────────────────────────────────────

    /// Put a node whose dependencies have all resolved onto the frontier.
    /// A compound sentinel expands its test segment on arrival.
    pub fn frontier_add(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        debug_assert_eq!(node.unresolved, 0, "frontier_add with unresolved deps");
        debug!("frontier add {id}");
        self.frontier.push(id);
        if node.pending.is_sentinel() {
            self.expand_arrival(id);
        }
    }

    /// Advance the dispatch cursor to the next node a worker should run.
    ///
    /// Sentinels are stepped over (they complete through child
    /// accounting); cancelled nodes are reaped in place; break/continue
    /// directives are never dispatched — reaching the cursor *is* their
    /// execution, which runs the cancellation engine.
    pub fn next_dispatch(&mut self) -> Result<Option<(NodeId, Arc<CommandTree>)>, SchedError> {
        loop {
            let Some(id) = self.frontier.at_cursor() else {
                return Ok(None);
            };
            let Some(node) = self.nodes.get(&id) else {
                self.frontier.remove(id);
                continue;
            };
            if node.cancelled {
                self.finalize_cancelled(id);
                continue;
            }
            if node.unresolved != 0 {
                return Err(SchedError::DependencyInvariant(id, node.unresolved));
            }
            if node.pending.is_sentinel() {
                self.frontier.advance();
                continue;
            }
            if node.directive.is_some() {
                self.complete_node(id, ExitStatus::SUCCESS);
                continue;
            }
            let command = node.command.clone();
            self.nodes.get_mut(&id).unwrap().leased = true;
            self.frontier.advance();
            debug!("dispatch {id}");
            return Ok(Some((id, command)));
        }
    }

    // ── completion ───────────────────────────────────────────────────

    /// Remove a finished (or reaped) node: flush its variable traffic,
    /// run the cancellation engine for directives, release dependents,
    /// then propagate tail status into the parent sentinel and complete
    /// the sentinel itself once its last child is gone.
    ///
    /// A cancelled node takes the same path minus directive handling and
    /// status propagation.
    pub fn complete_node(&mut self, id: NodeId, status: ExitStatus) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let cancelled = node.cancelled;
        debug!("complete {id} status={status} cancelled={cancelled}");

        self.flush_writes(id);
        self.release_reads(id);

        if !cancelled
            && let Some((kind, target)) = self.nodes.get(&id).and_then(|n| n.directive)
        {
            self.run_directive(id, kind, target);
        }

        let dependents = match self.nodes.get_mut(&id) {
            Some(n) => std::mem::take(&mut n.dependents),
            None => return,
        };
        for d in dependents {
            if let Some(dn) = self.nodes.get_mut(&d) {
                dn.unresolved -= 1;
                if dn.unresolved == 0 {
                    self.frontier_add(d);
                }
            }
        }

        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        self.frontier.remove(id);

        if let Some(pid) = node.parent
            && self.nodes.contains_key(&pid)
        {
            if !node.cancelled {
                if node.test_tail {
                    self.on_test_complete(pid, status);
                }
                if node.body_tail
                    && let Some(p) = self.nodes.get_mut(&pid)
                {
                    p.status = status;
                }
            }
            let mut sentinel_done = None;
            if let Some(p) = self.nodes.get_mut(&pid) {
                p.active = p.active.saturating_sub(1);
                p.children.retain(|&c| c != id);
                if p.active == 0 && matches!(p.pending, Pending::Reduced) {
                    sentinel_done = Some((pid, p.status));
                }
            }
            if let Some((pid, pstatus)) = sentinel_done {
                self.complete_node(pid, pstatus);
            }
        }
    }

    /// Reap a cancelled node that is not running: cascade through its
    /// children (running ones are only marked; their completion finds the
    /// parent gone and stops there), then take the normal removal path,
    /// which skips status propagation for cancelled nodes.
    pub fn finalize_cancelled(&mut self, id: NodeId) {
        let children = self
            .nodes
            .get(&id)
            .map(|n| n.children.clone())
            .unwrap_or_default();
        for c in children {
            let Some(cn) = self.nodes.get_mut(&c) else {
                continue;
            };
            cn.cancelled = true;
            cn.access.clear();
            if !cn.leased {
                self.finalize_cancelled(c);
            }
        }
        self.complete_node(id, ExitStatus::SUCCESS);
    }

    // ── variable plumbing ────────────────────────────────────────────

    /// Publish a value for one of the node's pending assignment versions
    /// (the evaluator's write path). Returns false if the node has no
    /// unpublished version for `name`.
    pub fn publish_assignment(&mut self, id: NodeId, name: &str, value: String) -> bool {
        let writes = match self.nodes.get(&id) {
            Some(n) => n.writes.clone(),
            None => return false,
        };
        let Some(vid) = writes
            .iter()
            .find(|(n, v)| n == name && !self.vars.is_published(n, *v))
            .map(|(_, v)| *v)
        else {
            return false;
        };
        let released = self.vars.publish(name, vid, value);
        self.release_waiters(released);
        true
    }

    /// Publish fallbacks for versions whose writer never did: the previous
    /// version's value, or empty. Keeps blocked readers from stranding
    /// when a writer fails or is pruned.
    fn flush_writes(&mut self, id: NodeId) {
        let writes = self
            .nodes
            .get(&id)
            .map(|n| n.writes.clone())
            .unwrap_or_default();
        for (name, vid) in writes {
            if !self.vars.is_published(&name, vid) {
                let fallback = self
                    .vars
                    .prior_value(&name, vid)
                    .unwrap_or_default()
                    .to_string();
                warn!("writer of ${name} finished without publishing; carrying prior value");
                let released = self.vars.publish(&name, vid, fallback);
                self.release_waiters(released);
            }
        }
    }

    fn release_reads(&mut self, id: NodeId) {
        let reads = self
            .nodes
            .get(&id)
            .map(|n| n.reads.clone())
            .unwrap_or_default();
        for (name, vid) in reads {
            self.vars.release_accessor(&name, vid);
        }
    }

    fn release_waiters(&mut self, released: Vec<NodeId>) {
        for r in released {
            if let Some(rn) = self.nodes.get_mut(&r) {
                rn.unresolved -= 1;
                if rn.unresolved == 0 {
                    self.frontier_add(r);
                }
            }
        }
    }

    // ── helpers ──────────────────────────────────────────────────────

    /// Is `f` a strict descendant of `root` through parent links?
    pub fn in_subtree(&self, mut f: NodeId, root: NodeId) -> bool {
        if f == root {
            return false;
        }
        while let Some(p) = self.nodes.get(&f).and_then(|n| n.parent) {
            if p == root {
                return true;
            }
            f = p;
        }
        false
    }

    fn ancestor_set(&self, id: NodeId) -> HashSet<NodeId> {
        let mut out = HashSet::new();
        let mut cur = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(p) = cur {
            out.insert(p);
            cur = self.nodes.get(&p).and_then(|n| n.parent);
        }
        out
    }

    pub fn stats(&self) -> SchedStats {
        SchedStats {
            nodes: self.nodes.len(),
            frontier: self.frontier.len(),
            waiters: self.vars.waiter_count(),
            versions: self.vars.version_count(),
            obsolete_versions: self.vars.obsolete_count(),
        }
    }
}

fn view(node: &GraphNode) -> AccessView<'_> {
    AccessView {
        access: &node.access,
        nest: node.nest,
        iteration: node.iteration,
    }
}

/// Strip `Background`/`Redir` wrappers, accumulating their redirections,
/// so a wrapped compound still drives the sentinel machinery.
fn peel(tree: &CommandTree) -> (&CommandTree, Vec<Redirect>) {
    let mut cur = tree;
    let mut redirects = Vec::new();
    loop {
        match cur {
            CommandTree::Background { inner, redirects: r } => {
                redirects.extend(r.iter().cloned());
                cur = inner;
            }
            CommandTree::Redir { redirects: r, inner } => {
                redirects.extend(r.iter().cloned());
                cur = inner;
            }
            _ => return (cur, redirects),
        }
    }
}
