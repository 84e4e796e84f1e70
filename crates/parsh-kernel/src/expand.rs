//! Compound-node expansion.
//!
//! A compound reaching the frontier stays there as a *sentinel*: it is
//! never dispatched, it owns a placeholder access set so later siblings
//! serialize correctly, and it is the parent under which test and body
//! commands are spawned. Its test segment expands on arrival; the body
//! expands once the test tail's exit status is observed.
//!
//! Loops pipeline: a passing test expands the body *and* the next test
//! together, so iteration N+1's test can run while iteration N's body is
//! still in flight. Ordering between them, when it matters, falls out of
//! the ordinary access conflicts among the children.

use parsh_types::{CommandTree, ExitStatus, Redirect};
use tracing::{debug, warn};

use crate::access::{self, AccessSet};
use crate::graph::{NodeId, Pending, SchedState};

/// Which tail flag the last command of a segment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    Test,
    Body,
}

/// What a state-machine step decided to do, extracted under a short
/// borrow of the sentinel so the spawning itself can re-borrow freely.
enum Step {
    /// Expand a test segment, optionally swapping in a placeholder access.
    Test {
        seg: Option<CommandTree>,
        placeholder: Option<AccessSet>,
    },
    /// Branch selected: reduce, maybe record a status, expand the body,
    /// re-check suspended dependents.
    Branch {
        seg: Option<CommandTree>,
        skipped_status: Option<ExitStatus>,
    },
    /// While/until step.
    Loop {
        test: CommandTree,
        body: CommandTree,
        again: bool,
    },
    /// For step: body of the new iteration plus the next binding, if any.
    ForStep {
        body: CommandTree,
        next: Option<CommandTree>,
    },
    /// Empty for-list: reduce and finish.
    Finished,
    Nothing,
}

impl SchedState {
    /// Expand a sentinel's test segment the moment it reaches the
    /// frontier, and install the placeholder access set later siblings
    /// should serialize against. Loop sentinels keep their full static
    /// access; and/or/if narrow theirs to the untested side.
    pub(crate) fn expand_arrival(&mut self, id: NodeId) {
        // Loop children are stamped with the loop's own counter; and/or/if
        // children inherit the sentinel's stamp — those constructs do not
        // open a new loop context.
        let Some((nest, iteration)) = self
            .nodes
            .get(&id)
            .map(|n| (n.nest, if n.is_loop { n.loop_iteration } else { n.iteration }))
        else {
            return;
        };
        debug!("expand arrival {id}");

        let step = {
            let Some(node) = self.nodes.get_mut(&id) else {
                return;
            };
            match &mut node.pending {
                Pending::And { left, right } | Pending::Or { left, right } => Step::Test {
                    seg: left.take(),
                    placeholder: Some(
                        right
                            .as_ref()
                            .and_then(|r| access::analyze(r, nest).ok())
                            .unwrap_or_default(),
                    ),
                },
                Pending::If {
                    test,
                    then_branch,
                    else_branch,
                } => {
                    let mut placeholder = then_branch
                        .as_ref()
                        .and_then(|t| access::analyze(t, nest).ok())
                        .unwrap_or_default();
                    if let Some(els) = else_branch.as_ref()
                        && let Ok(extra) = access::analyze(els, nest)
                    {
                        placeholder.extend(extra);
                    }
                    Step::Test {
                        seg: test.take(),
                        placeholder: Some(placeholder),
                    }
                }
                Pending::While { test, .. } | Pending::Until { test, .. } => Step::Test {
                    seg: Some(test.clone()),
                    placeholder: None,
                },
                Pending::For { var, items, .. } => match items.pop_front() {
                    Some(item) => Step::Test {
                        seg: Some(CommandTree::assignment(var.clone(), item)),
                        placeholder: None,
                    },
                    None => Step::Finished,
                },
                Pending::Simple | Pending::Reduced => Step::Nothing,
            }
        };
        self.apply_step(id, step, nest, iteration);
    }

    /// Drive the sentinel state machine with the observed status of its
    /// test tail.
    pub(crate) fn on_test_complete(&mut self, id: NodeId, status: ExitStatus) {
        let Some(nest) = self.nodes.get(&id).map(|n| n.nest) else {
            return;
        };
        debug!("test of {id} completed with status {status}");

        let step = {
            let Some(node) = self.nodes.get_mut(&id) else {
                return;
            };
            match &mut node.pending {
                Pending::And { right, .. } => {
                    let right = right.take();
                    if status.success() {
                        Step::Branch {
                            seg: right,
                            skipped_status: None,
                        }
                    } else {
                        Step::Branch {
                            seg: None,
                            skipped_status: Some(status),
                        }
                    }
                }
                Pending::Or { right, .. } => {
                    let right = right.take();
                    if status.success() {
                        Step::Branch {
                            seg: None,
                            skipped_status: Some(status),
                        }
                    } else {
                        Step::Branch {
                            seg: right,
                            skipped_status: None,
                        }
                    }
                }
                Pending::If {
                    then_branch,
                    else_branch,
                    ..
                } => Step::Branch {
                    seg: if status.success() {
                        then_branch.take()
                    } else {
                        else_branch.take()
                    },
                    skipped_status: None,
                },
                Pending::While { test, body } => Step::Loop {
                    test: test.clone(),
                    body: body.clone(),
                    again: status.success(),
                },
                Pending::Until { test, body } => Step::Loop {
                    test: test.clone(),
                    body: body.clone(),
                    again: !status.success(),
                },
                Pending::For { var, items, body } => Step::ForStep {
                    body: body.clone(),
                    next: items
                        .pop_front()
                        .map(|item| CommandTree::assignment(var.clone(), item)),
                },
                // a break demoted the loop mid-flight; the in-flight test
                // drains without re-expanding
                Pending::Reduced | Pending::Simple => Step::Nothing,
            }
        };
        // Only `Step::Branch` consumes this: and/or/if children carry the
        // sentinel's own stamp forward.
        let iteration = self.nodes.get(&id).map(|n| n.iteration).unwrap_or_default();
        self.apply_step(id, step, nest, iteration);
    }

    fn apply_step(&mut self, id: NodeId, step: Step, nest: u32, iteration: u64) {
        match step {
            Step::Test { seg, placeholder } => {
                if let Some(access) = placeholder
                    && let Some(n) = self.nodes.get_mut(&id)
                {
                    n.access = access;
                }
                self.spawn_segment(id, seg, nest, iteration, Tail::Test);
            }
            Step::Branch {
                seg,
                skipped_status,
            } => {
                if let Some(n) = self.nodes.get_mut(&id) {
                    n.pending = Pending::Reduced;
                    if let Some(st) = skipped_status {
                        n.status = st;
                    }
                }
                self.spawn_segment(id, seg, nest, iteration, Tail::Body);
                self.recheck_dependents(id);
            }
            Step::Loop { test, body, again } => {
                if again {
                    let iteration = self.bump_iteration(id);
                    self.spawn_segment(id, Some(body), nest + 1, iteration, Tail::Body);
                    self.spawn_segment(id, Some(test), nest, iteration, Tail::Test);
                } else if let Some(n) = self.nodes.get_mut(&id) {
                    n.pending = Pending::Reduced;
                }
            }
            Step::ForStep { body, next } => {
                let iteration = self.bump_iteration(id);
                self.spawn_segment(id, Some(body), nest + 1, iteration, Tail::Body);
                match next {
                    Some(binding) => {
                        self.spawn_segment(id, Some(binding), nest, iteration, Tail::Test);
                    }
                    None => {
                        if let Some(n) = self.nodes.get_mut(&id) {
                            n.pending = Pending::Reduced;
                        }
                    }
                }
            }
            Step::Finished => {
                if let Some(n) = self.nodes.get_mut(&id) {
                    n.pending = Pending::Reduced;
                }
                self.try_complete_sentinel(id);
            }
            Step::Nothing => {}
        }
    }

    fn bump_iteration(&mut self, id: NodeId) -> u64 {
        match self.nodes.get_mut(&id) {
            Some(n) => {
                n.loop_iteration += 1;
                n.loop_iteration
            }
            None => 0,
        }
    }

    /// Expand one segment (a Semi chain) into child nodes of `parent`,
    /// marking the last with the given tail flag. An empty test segment
    /// completes with status 0 on the spot; an empty body leaves only the
    /// reduction to finish.
    fn spawn_segment(
        &mut self,
        parent: NodeId,
        seg: Option<CommandTree>,
        nest: u32,
        iteration: u64,
        tail: Tail,
    ) {
        let mut cmds = Vec::new();
        if let Some(seg) = seg {
            flatten(seg, &mut cmds);
        }

        if cmds.is_empty() {
            match tail {
                Tail::Test => {
                    if self.nodes.get(&parent).is_some_and(|n| n.is_loop) {
                        // A loop whose test vanished would re-expand
                        // forever; degenerate to done.
                        warn!("loop {parent} has an empty test; finishing it");
                        if let Some(n) = self.nodes.get_mut(&parent) {
                            n.pending = Pending::Reduced;
                        }
                        self.try_complete_sentinel(parent);
                    } else {
                        self.on_test_complete(parent, ExitStatus::SUCCESS);
                    }
                }
                Tail::Body => self.try_complete_sentinel(parent),
            }
            return;
        }

        let wrap = self
            .nodes
            .get(&parent)
            .map(|n| n.wrap_redirects.clone())
            .unwrap_or_default();
        let last = cmds.len() - 1;
        let mut tail_failed = false;
        for (i, cmd) in cmds.into_iter().enumerate() {
            let cmd = rewrap(cmd, &wrap);
            let (test_tail, body_tail) = match tail {
                Tail::Test => (i == last, false),
                Tail::Body => (false, i == last),
            };
            if let Err(err) = self.add_child(parent, cmd, nest, iteration, test_tail, body_tail) {
                warn!("skipping malformed expansion child of {parent}: {err}");
                tail_failed = i == last;
            }
        }
        if tail_failed {
            // The tail carries the segment's status; without it the
            // sentinel would wait forever. Report the shell's
            // syntax-error status instead.
            match tail {
                Tail::Test => self.on_test_complete(parent, ExitStatus(2)),
                Tail::Body => {
                    if let Some(n) = self.nodes.get_mut(&parent) {
                        n.status = ExitStatus(2);
                    }
                    self.try_complete_sentinel(parent);
                }
            }
        }
    }

    /// After an and/or/if selects its branch, the sentinel no longer
    /// stands in for any access: clear the placeholder, detach the
    /// suspended dependents, and route each back through dependency
    /// analysis against the freshly-spawned children. Edges that were
    /// over-approximations dissolve; real ones re-attach to the concrete
    /// body commands.
    fn recheck_dependents(&mut self, id: NodeId) {
        let deps = match self.nodes.get_mut(&id) {
            Some(node) => {
                node.access.clear();
                std::mem::take(&mut node.dependents)
            }
            None => return,
        };
        for &d in &deps {
            if let Some(dn) = self.nodes.get_mut(&d) {
                dn.unresolved -= 1;
            }
        }
        for d in deps {
            if !self.nodes.contains_key(&d) {
                continue;
            }
            self.scan_and_attach(d, Some(id));
            self.settle(d);
        }
    }

    /// Complete a sentinel immediately if it has no live children. Used
    /// when reduction happens outside the child-completion path (empty
    /// segments, empty for-lists).
    fn try_complete_sentinel(&mut self, id: NodeId) {
        let ready = self
            .nodes
            .get(&id)
            .is_some_and(|n| n.active == 0 && matches!(n.pending, Pending::Reduced));
        if ready {
            let status = self.nodes[&id].status;
            self.complete_node(id, status);
        }
    }
}

/// Flatten a Semi chain into its command list, dropping empty simples.
fn flatten(tree: CommandTree, out: &mut Vec<CommandTree>) {
    match tree {
        CommandTree::Semi(a, b) => {
            flatten(*a, out);
            flatten(*b, out);
        }
        CommandTree::Simple {
            ref args,
            ref assigns,
            ref redirects,
        } if args.is_empty() && assigns.is_empty() && redirects.is_empty() => {}
        other => out.push(other),
    }
}

/// Re-apply a compound wrapper's redirections to an expanded child.
fn rewrap(cmd: CommandTree, wrap: &[Redirect]) -> CommandTree {
    if wrap.is_empty() {
        cmd
    } else {
        CommandTree::Redir {
            redirects: wrap.to_vec(),
            inner: Box::new(cmd),
        }
    }
}
