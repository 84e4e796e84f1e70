//! Static read/write analysis of command trees.
//!
//! Every command is reduced to an [`AccessSet`] before it enters the graph:
//! the file paths its redirections touch, the variables its words read and
//! its assignments write, and any `break`/`continue` directives that escape
//! the subtree. Variables share the file namespace under a `$` prefix, so a
//! variable `foo` never collides with a file `foo` and one conflict check
//! covers both.
//!
//! The analysis is deliberately conservative: argument lists are not parsed
//! for file names, and redirection targets are compared literally (a target
//! containing `$i` keeps its sigil spelling).

use parsh_types::{CommandTree, Redirect, RedirectTarget, Word};

use crate::error::AnalyzerError;

/// Read/write discrimination for one access entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    /// A `continue` escaping this subtree; `target_nest` names the loop.
    Continue,
    /// A `break` escaping this subtree; `target_nest` names the loop.
    Break,
}

/// One `(kind, name)` access entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    pub kind: AccessKind,
    /// Path, or `$name` for variables. Empty for directives.
    pub name: String,
    /// For directives: the absolute loop-body nest this targets (>= 1).
    pub target_nest: u32,
}

impl Access {
    fn read(name: impl Into<String>) -> Self {
        Access {
            kind: AccessKind::Read,
            name: name.into(),
            target_nest: 0,
        }
    }

    fn write(name: impl Into<String>) -> Self {
        Access {
            kind: AccessKind::Write,
            name: name.into(),
            target_nest: 0,
        }
    }

    fn directive(kind: AccessKind, target_nest: u32) -> Self {
        Access {
            kind,
            name: String::new(),
            target_nest,
        }
    }

    /// True for `Continue`/`Break` entries.
    pub fn is_directive(&self) -> bool {
        matches!(self.kind, AccessKind::Continue | AccessKind::Break)
    }
}

/// The access entries of one command tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessSet {
    entries: Vec<Access>,
}

impl AccessSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[Access] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all entries (a sentinel whose body has been expanded no longer
    /// stands in for it).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Union in another set's entries.
    pub fn extend(&mut self, other: AccessSet) {
        self.entries.extend(other.entries);
    }

    /// Variable names this set reads (`$x` entries, sigil stripped).
    pub fn var_reads(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|a| match a.kind {
            AccessKind::Read => a.name.strip_prefix('$'),
            _ => None,
        })
    }

    /// Variable names this set writes (`$x` entries, sigil stripped).
    pub fn var_writes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|a| match a.kind {
            AccessKind::Write => a.name.strip_prefix('$'),
            _ => None,
        })
    }

    /// The first escaping directive, if any.
    pub fn directive(&self) -> Option<(AccessKind, u32)> {
        self.entries
            .iter()
            .find(|a| a.is_directive())
            .map(|a| (a.kind, a.target_nest))
    }
}

/// Result of crossing two access sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clash {
    NoClash,
    /// Same name touched, all readers. Does not order the commands.
    ConcurrentRead,
    /// Same name touched with at least one writer, or a directive claims
    /// the other node's loop iteration. Orders the commands.
    WriteCollision,
}

/// The node attributes the conflict predicate needs alongside the set:
/// directives compare against the other node's loop position.
#[derive(Debug, Clone, Copy)]
pub struct AccessView<'a> {
    pub access: &'a AccessSet,
    pub nest: u32,
    pub iteration: u64,
}

/// Cross-check two access views.
///
/// Name conflicts: identical names clash, write-vs-anything collides,
/// read-vs-read merely overlaps. Directive conflicts: a `continue` claims
/// every node at or below its target nest in the same iteration, a `break`
/// every such node in the same or a later iteration, in either direction.
pub fn conflict(a: AccessView<'_>, b: AccessView<'_>) -> Clash {
    let mut clash = Clash::NoClash;

    for ea in a.access.entries() {
        if ea.is_directive() {
            if directive_claims(ea, a.iteration, b.nest, b.iteration) {
                return Clash::WriteCollision;
            }
            continue;
        }
        for eb in b.access.entries() {
            if eb.is_directive() {
                continue;
            }
            if ea.name == eb.name {
                if ea.kind == AccessKind::Write || eb.kind == AccessKind::Write {
                    return Clash::WriteCollision;
                }
                clash = Clash::ConcurrentRead;
            }
        }
    }

    for eb in b.access.entries() {
        if eb.is_directive() && directive_claims(eb, b.iteration, a.nest, a.iteration) {
            return Clash::WriteCollision;
        }
    }

    clash
}

/// Does a directive carried at `dir_iter` claim a node at `(nest, iter)`?
fn directive_claims(dir: &Access, dir_iter: u64, nest: u32, iter: u64) -> bool {
    if nest < dir.target_nest {
        return false;
    }
    match dir.kind {
        AccessKind::Continue => iter == dir_iter,
        AccessKind::Break => iter >= dir_iter,
        _ => false,
    }
}

/// Build the access set of `tree` for a graph node stamped at `node_nest`.
pub fn analyze(tree: &CommandTree, node_nest: u32) -> Result<AccessSet, AnalyzerError> {
    let mut set = AccessSet::new();
    walk(tree, node_nest, 0, &mut set)?;
    Ok(set)
}

/// Recursive walk. `rel_depth` counts loop bodies entered inside this tree;
/// a directive escapes only when it targets more levels than that.
fn walk(
    tree: &CommandTree,
    node_nest: u32,
    rel_depth: u32,
    set: &mut AccessSet,
) -> Result<(), AnalyzerError> {
    match tree {
        CommandTree::Simple {
            args,
            assigns,
            redirects,
        } => {
            for word in args {
                word_reads(word, set);
            }
            // Assignment prefixes on a plain command scope to that command
            // only; their values are still read.
            for assign in assigns {
                word_reads(&assign.value, set);
            }
            redirect_accesses(redirects, set);
        }
        CommandTree::VarAssign(inner) => {
            let CommandTree::Simple {
                args,
                assigns,
                redirects,
            } = inner.as_ref()
            else {
                return Err(AnalyzerError::MalformedVarAssign);
            };
            if !args.is_empty() || assigns.is_empty() {
                return Err(AnalyzerError::MalformedVarAssign);
            }
            for assign in assigns {
                word_reads(&assign.value, set);
                set.entries.push(Access::write(format!("${}", assign.name)));
            }
            redirect_accesses(redirects, set);
        }
        CommandTree::Background { inner, redirects } => {
            redirect_accesses(redirects, set);
            walk(inner, node_nest, rel_depth, set)?;
        }
        CommandTree::Redir { redirects, inner } => {
            redirect_accesses(redirects, set);
            walk(inner, node_nest, rel_depth, set)?;
        }
        CommandTree::Pipe(list) => {
            if list.is_empty() {
                return Err(AnalyzerError::EmptyPipeline);
            }
            for member in list {
                walk(member, node_nest, rel_depth, set)?;
            }
        }
        CommandTree::Semi(a, b) | CommandTree::And(a, b) | CommandTree::Or(a, b) => {
            walk(a, node_nest, rel_depth, set)?;
            walk(b, node_nest, rel_depth, set)?;
        }
        CommandTree::Not(inner) => walk(inner, node_nest, rel_depth, set)?,
        CommandTree::If {
            test,
            then_branch,
            else_branch,
        } => {
            walk(test, node_nest, rel_depth, set)?;
            walk(then_branch, node_nest, rel_depth, set)?;
            if let Some(els) = else_branch {
                walk(els, node_nest, rel_depth, set)?;
            }
        }
        CommandTree::While { test, body } | CommandTree::Until { test, body } => {
            walk(test, node_nest, rel_depth, set)?;
            walk(body, node_nest, rel_depth + 1, set)?;
        }
        CommandTree::For { var, items, body } => {
            set.entries.push(Access::write(format!("${var}")));
            for item in items {
                word_reads(item, set);
            }
            walk(body, node_nest, rel_depth + 1, set)?;
        }
        CommandTree::Break(levels) => {
            directive_entry(AccessKind::Break, *levels, node_nest, rel_depth, set);
        }
        CommandTree::Continue(levels) => {
            directive_entry(AccessKind::Continue, *levels, node_nest, rel_depth, set);
        }
        CommandTree::Eof => return Err(AnalyzerError::EofInGraph),
    }
    Ok(())
}

/// Emit an escaping directive entry, or nothing if it is buried: a
/// `break k` that targets fewer levels than it is nested inside this tree
/// resolves entirely within a loop that has not been scheduled yet.
fn directive_entry(
    kind: AccessKind,
    levels: Option<usize>,
    node_nest: u32,
    rel_depth: u32,
    set: &mut AccessSet,
) {
    // `break 0` behaves as `break 1`.
    let k = levels.unwrap_or(1).max(1) as u32;
    if k <= rel_depth {
        return;
    }
    // Absolute body nest of the targeted loop, clamped so an over-deep
    // directive breaks every enclosing loop.
    let target = (node_nest + rel_depth).saturating_sub(k - 1).max(1);
    set.entries.push(Access::directive(kind, target));
}

fn redirect_accesses(redirects: &[Redirect], set: &mut AccessSet) {
    for redirect in redirects {
        match &redirect.target {
            RedirectTarget::File(word) => {
                word_reads(word, set);
                let name = word.to_string();
                if redirect.kind.writes() {
                    set.entries.push(Access::write(name));
                } else {
                    set.entries.push(Access::read(name));
                }
            }
            // fd duplication touches no file the scheduler can name
            RedirectTarget::Fd(_) => {}
        }
    }
}

fn word_reads(word: &Word, set: &mut AccessSet) {
    let mut refs = Vec::new();
    word.var_refs(&mut refs);
    for name in refs {
        set.entries.push(Access::read(format!("${name}")));
    }
}
