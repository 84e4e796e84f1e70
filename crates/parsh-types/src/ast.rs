//! AST type definitions for parsed shell commands.
//!
//! The parser produces one `CommandTree` per logical command and hands it to
//! the scheduler, which only inspects variant tags, redirections, and word
//! structure; argument semantics belong to the evaluator.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A parsed command tree.
///
/// Ownership passes to the scheduler on submit. The scheduler derives the
/// command's file/variable access set from this structure and otherwise
/// treats it as opaque payload for the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandTree {
    /// Simple command: `tool arg1 arg2`, possibly with leading assignments
    /// and redirections.
    Simple {
        args: Vec<Word>,
        assigns: Vec<Assign>,
        redirects: Vec<Redirect>,
    },
    /// Command detached from the foreground with `&`.
    Background {
        inner: Box<CommandTree>,
        redirects: Vec<Redirect>,
    },
    /// Assignment-only simple command: `x=5`.
    VarAssign(Box<CommandTree>),
    /// Pipeline: `a | b | c`. Internal data flow is the evaluator's concern.
    Pipe(Vec<CommandTree>),
    /// Sequence: `a ; b`.
    Semi(Box<CommandTree>, Box<CommandTree>),
    /// Short-circuit and: `a && b`.
    And(Box<CommandTree>, Box<CommandTree>),
    /// Short-circuit or: `a || b`.
    Or(Box<CommandTree>, Box<CommandTree>),
    /// Negation: `! a`.
    Not(Box<CommandTree>),
    /// Conditional: `if test; then ...; else ...; fi`.
    If {
        test: Box<CommandTree>,
        then_branch: Box<CommandTree>,
        else_branch: Option<Box<CommandTree>>,
    },
    /// `while test; do body; done`.
    While {
        test: Box<CommandTree>,
        body: Box<CommandTree>,
    },
    /// `until test; do body; done`.
    Until {
        test: Box<CommandTree>,
        body: Box<CommandTree>,
    },
    /// `for var in items; do body; done`.
    For {
        var: String,
        items: Vec<Word>,
        body: Box<CommandTree>,
    },
    /// `break` / `break N`.
    Break(Option<usize>),
    /// `continue` / `continue N`.
    Continue(Option<usize>),
    /// A subtree with redirections applied: `{ ... } > file`.
    Redir {
        redirects: Vec<Redirect>,
        inner: Box<CommandTree>,
    },
    /// End of input.
    Eof,
}

impl CommandTree {
    /// Convenience constructor for a plain command.
    pub fn simple(args: Vec<Word>) -> Self {
        CommandTree::Simple {
            args,
            assigns: Vec::new(),
            redirects: Vec::new(),
        }
    }

    /// Convenience constructor for an assignment-only command.
    pub fn assignment(name: impl Into<String>, value: Word) -> Self {
        CommandTree::VarAssign(Box::new(CommandTree::Simple {
            args: Vec::new(),
            assigns: vec![Assign {
                name: name.into(),
                value,
            }],
            redirects: Vec::new(),
        }))
    }

    /// The first argument word, if this is a simple command with one.
    pub fn command_name(&self) -> Option<&str> {
        match self {
            CommandTree::Simple { args, .. } => match args.first() {
                Some(Word::Literal(name)) => Some(name),
                _ => None,
            },
            _ => None,
        }
    }
}

/// One argument or item word. Variable references are structured rather
/// than marked in-band, so the scheduler can see them without re-lexing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Word {
    /// Literal text.
    Literal(String),
    /// A variable reference: `$name`.
    Var(String),
    /// Adjacent parts glued together: `f$i`, `"$a/$b"`.
    Concat(Vec<Word>),
}

impl Word {
    pub fn lit(s: impl Into<String>) -> Self {
        Word::Literal(s.into())
    }

    pub fn var(name: impl Into<String>) -> Self {
        Word::Var(name.into())
    }

    /// Collect the names of every variable referenced in this word.
    pub fn var_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Word::Literal(_) => {}
            Word::Var(name) => out.push(name),
            Word::Concat(parts) => {
                for part in parts {
                    part.var_refs(out);
                }
            }
        }
    }
}

/// Words render to their source-ish spelling; the scheduler compares
/// redirection targets by this literal form.
impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Word::Literal(s) => write!(f, "{s}"),
            Word::Var(name) => write!(f, "${name}"),
            Word::Concat(parts) => {
                for part in parts {
                    write!(f, "{part}")?;
                }
                Ok(())
            }
        }
    }
}

/// A variable assignment prefix: `NAME=value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assign {
    pub name: String,
    pub value: Word,
}

/// I/O redirection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub target: RedirectTarget,
}

impl Redirect {
    pub fn to_file(kind: RedirectKind, path: Word) -> Self {
        Self {
            kind,
            target: RedirectTarget::File(path),
        }
    }
}

/// Type of redirection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedirectKind {
    /// `<` stdin from file.
    In,
    /// `>` stdout to file (overwrite).
    Out,
    /// `>>` stdout to file (append).
    Append,
    /// `>|` stdout to file (clobber noclobber).
    Clobber,
}

impl RedirectKind {
    /// True for redirections that write their target.
    pub fn writes(self) -> bool {
        !matches!(self, RedirectKind::In)
    }
}

impl fmt::Display for RedirectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedirectKind::In => write!(f, "<"),
            RedirectKind::Out => write!(f, ">"),
            RedirectKind::Append => write!(f, ">>"),
            RedirectKind::Clobber => write!(f, ">|"),
        }
    }
}

/// Where a redirection points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RedirectTarget {
    /// A path, possibly containing variable references.
    File(Word),
    /// A file-descriptor duplication: `2>&1`. No file access implied.
    Fd(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_display_keeps_sigil() {
        let w = Word::Concat(vec![Word::lit("f"), Word::var("i")]);
        assert_eq!(w.to_string(), "f$i");
    }

    #[test]
    fn var_refs_collects_nested() {
        let w = Word::Concat(vec![
            Word::var("a"),
            Word::lit("-"),
            Word::Concat(vec![Word::var("b")]),
        ]);
        let mut refs = Vec::new();
        w.var_refs(&mut refs);
        assert_eq!(refs, vec!["a", "b"]);
    }

    #[test]
    fn command_name_of_simple() {
        let t = CommandTree::simple(vec![Word::lit("echo"), Word::lit("hi")]);
        assert_eq!(t.command_name(), Some("echo"));
    }

    #[test]
    fn command_name_absent_for_compounds() {
        let t = CommandTree::Break(None);
        assert_eq!(t.command_name(), None);
    }

    #[test]
    fn redirect_kind_writes() {
        assert!(!RedirectKind::In.writes());
        assert!(RedirectKind::Out.writes());
        assert!(RedirectKind::Append.writes());
        assert!(RedirectKind::Clobber.writes());
    }
}
