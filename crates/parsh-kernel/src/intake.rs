//! Intake: normalization of raw parsed trees before they enter the graph.
//!
//! Top-level `Semi` sequences are flattened into individual submissions,
//! plain commands are wrapped into their background shape, assignment-only
//! commands into their `VarAssign` shape, and the few builtins that must
//! mutate the shell process itself (`cd`, `exit`) are bounced back to the
//! caller for synchronous evaluation off the graph.

use parsh_types::CommandTree;

/// What became of a submitted tree.
#[derive(Debug)]
pub(crate) enum Classified {
    /// End of input.
    Eof,
    /// A bare `cd`/`exit`: the caller evaluates it synchronously.
    Sync(CommandTree),
    /// Normalized commands for the graph, in source order.
    Graph(Vec<CommandTree>),
}

/// Builtins that must run in the shell process, outside the graph.
const SYNC_BUILTINS: &[&str] = &["cd", "exit"];

pub(crate) fn classify(tree: CommandTree) -> Classified {
    if matches!(tree, CommandTree::Eof) {
        return Classified::Eof;
    }
    if is_sync_builtin(&tree) {
        return Classified::Sync(tree);
    }
    let mut parts = Vec::new();
    flatten_top(tree, &mut parts);
    Classified::Graph(parts.into_iter().map(normalize).collect())
}

fn is_sync_builtin(tree: &CommandTree) -> bool {
    tree.command_name()
        .is_some_and(|name| SYNC_BUILTINS.contains(&name))
}

/// Split a top-level `Semi` chain into its commands, dropping empties.
fn flatten_top(tree: CommandTree, out: &mut Vec<CommandTree>) {
    match tree {
        CommandTree::Semi(a, b) => {
            flatten_top(*a, out);
            flatten_top(*b, out);
        }
        CommandTree::Simple {
            ref args,
            ref assigns,
            ref redirects,
        } if args.is_empty() && assigns.is_empty() && redirects.is_empty() => {}
        other => out.push(other),
    }
}

/// Give one command its graph shape.
fn normalize(tree: CommandTree) -> CommandTree {
    match tree {
        CommandTree::Simple {
            args,
            assigns,
            redirects,
        } => {
            let simple = CommandTree::Simple {
                args,
                assigns,
                redirects,
            };
            if is_assignment_only(&simple) {
                CommandTree::VarAssign(Box::new(simple))
            } else {
                CommandTree::Background {
                    inner: Box::new(simple),
                    redirects: Vec::new(),
                }
            }
        }
        CommandTree::Not(inner) => match *inner {
            simple @ CommandTree::Simple { .. } => CommandTree::Background {
                inner: Box::new(CommandTree::Not(Box::new(simple))),
                redirects: Vec::new(),
            },
            other => CommandTree::Not(Box::new(other)),
        },
        other => other,
    }
}

fn is_assignment_only(tree: &CommandTree) -> bool {
    matches!(
        tree,
        CommandTree::Simple { args, assigns, .. } if args.is_empty() && !assigns.is_empty()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use parsh_types::Word;

    fn cmd(name: &str) -> CommandTree {
        CommandTree::simple(vec![Word::lit(name)])
    }

    #[test]
    fn eof_is_signalled() {
        assert!(matches!(classify(CommandTree::Eof), Classified::Eof));
    }

    #[test]
    fn cd_and_exit_bypass_the_graph() {
        assert!(matches!(classify(cmd("cd")), Classified::Sync(_)));
        assert!(matches!(classify(cmd("exit")), Classified::Sync(_)));
    }

    #[test]
    fn plain_command_becomes_background() {
        let Classified::Graph(parts) = classify(cmd("ls")) else {
            panic!("expected graph");
        };
        assert_eq!(parts.len(), 1);
        assert!(matches!(parts[0], CommandTree::Background { .. }));
    }

    #[test]
    fn assignment_only_becomes_var_assign() {
        let tree = CommandTree::Simple {
            args: Vec::new(),
            assigns: vec![parsh_types::Assign {
                name: "x".into(),
                value: Word::lit("5"),
            }],
            redirects: Vec::new(),
        };
        let Classified::Graph(parts) = classify(tree) else {
            panic!("expected graph");
        };
        assert!(matches!(parts[0], CommandTree::VarAssign(_)));
    }

    #[test]
    fn semi_chain_flattens_in_order() {
        let tree = CommandTree::Semi(
            Box::new(CommandTree::Semi(Box::new(cmd("a")), Box::new(cmd("b")))),
            Box::new(cmd("c")),
        );
        let Classified::Graph(parts) = classify(tree) else {
            panic!("expected graph");
        };
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn empty_simples_are_dropped() {
        let tree = CommandTree::Semi(
            Box::new(CommandTree::simple(Vec::new())),
            Box::new(cmd("a")),
        );
        let Classified::Graph(parts) = classify(tree) else {
            panic!("expected graph");
        };
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn negation_of_simple_is_backgrounded() {
        let tree = CommandTree::Not(Box::new(cmd("grep")));
        let Classified::Graph(parts) = classify(tree) else {
            panic!("expected graph");
        };
        assert!(matches!(parts[0], CommandTree::Background { .. }));
    }

    #[test]
    fn compounds_pass_through() {
        let tree = CommandTree::While {
            test: Box::new(cmd("t")),
            body: Box::new(cmd("b")),
        };
        let Classified::Graph(parts) = classify(tree) else {
            panic!("expected graph");
        };
        assert!(matches!(parts[0], CommandTree::While { .. }));
    }
}
