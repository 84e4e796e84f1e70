//! Shared helpers for scheduler integration tests: terse tree builders
//! and a deterministic single-threaded drain loop standing in for the
//! evaluator.
#![allow(dead_code)]

use parsh_kernel::{
    Assign, CommandTree, ExitStatus, Lease, Pull, Redirect, RedirectKind, Scheduler, Word,
};

/// Opt-in scheduler tracing for debugging a failing test: run with
/// `RUST_LOG=parsh_kernel=trace`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn lit(s: &str) -> Word {
    Word::lit(s)
}

pub fn var(s: &str) -> Word {
    Word::var(s)
}

/// `name arg arg ...` as a plain simple command.
pub fn cmd(words: &[Word]) -> CommandTree {
    CommandTree::simple(words.to_vec())
}

pub fn named(name: &str) -> CommandTree {
    cmd(&[lit(name)])
}

/// A simple command with input/output file redirections.
pub fn cmd_io(args: &[Word], reads: &[&str], writes: &[&str]) -> CommandTree {
    let mut redirects = Vec::new();
    for r in reads {
        redirects.push(Redirect::to_file(RedirectKind::In, lit(r)));
    }
    for w in writes {
        redirects.push(Redirect::to_file(RedirectKind::Out, lit(w)));
    }
    CommandTree::Simple {
        args: args.to_vec(),
        assigns: Vec::new(),
        redirects,
    }
}

/// `name=value` as an assignment-only simple command (intake wraps it).
pub fn assign(name: &str, value: Word) -> CommandTree {
    CommandTree::Simple {
        args: Vec::new(),
        assigns: vec![Assign {
            name: name.into(),
            value,
        }],
        redirects: Vec::new(),
    }
}

/// Right-fold a command list into a Semi chain.
pub fn seq(parts: Vec<CommandTree>) -> CommandTree {
    let mut iter = parts.into_iter().rev();
    let mut tree = iter.next().expect("seq of at least one command");
    for part in iter {
        tree = CommandTree::Semi(Box::new(part), Box::new(tree));
    }
    tree
}

pub fn if_then(test: CommandTree, then_branch: CommandTree) -> CommandTree {
    CommandTree::If {
        test: Box::new(test),
        then_branch: Box::new(then_branch),
        else_branch: None,
    }
}

pub fn if_then_else(test: CommandTree, t: CommandTree, e: CommandTree) -> CommandTree {
    CommandTree::If {
        test: Box::new(test),
        then_branch: Box::new(t),
        else_branch: Some(Box::new(e)),
    }
}

pub fn while_loop(test: CommandTree, body: CommandTree) -> CommandTree {
    CommandTree::While {
        test: Box::new(test),
        body: Box::new(body),
    }
}

pub fn until_loop(test: CommandTree, body: CommandTree) -> CommandTree {
    CommandTree::Until {
        test: Box::new(test),
        body: Box::new(body),
    }
}

pub fn for_loop(var_name: &str, items: &[Word], body: CommandTree) -> CommandTree {
    CommandTree::For {
        var: var_name.into(),
        items: items.to_vec(),
        body: Box::new(body),
    }
}

/// Render a word the way an evaluator would: variables resolve to their
/// newest published value at execution time.
pub fn render(sched: &Scheduler, word: &Word) -> String {
    match word {
        Word::Literal(s) => s.clone(),
        Word::Var(name) => sched.read_var(name).unwrap_or_default(),
        Word::Concat(parts) => parts.iter().map(|p| render(sched, p)).collect(),
    }
}

/// Evaluate one lease: publish assignment values, build a human-readable
/// label, and ask the script for an exit status.
pub fn run_lease(
    sched: &Scheduler,
    lease: &Lease,
    status_of: &mut dyn FnMut(&str) -> ExitStatus,
) -> (String, ExitStatus) {
    let mut core: &CommandTree = &lease.command;
    loop {
        match core {
            CommandTree::Background { inner, .. } => core = inner,
            CommandTree::Redir { inner, .. } => core = inner,
            CommandTree::Not(inner) => core = inner,
            CommandTree::VarAssign(inner) => core = inner,
            _ => break,
        }
    }
    match core {
        CommandTree::Simple { args, assigns, .. } => {
            if args.is_empty() && !assigns.is_empty() {
                let mut labels = Vec::new();
                for a in assigns {
                    let value = render(sched, &a.value);
                    labels.push(format!("{}={}", a.name, value));
                    assert!(
                        sched.publish(lease, &a.name, value),
                        "assignment had no pending version"
                    );
                }
                (labels.join(" "), ExitStatus::SUCCESS)
            } else {
                let label = args
                    .iter()
                    .map(|w| render(sched, w))
                    .collect::<Vec<_>>()
                    .join(" ");
                let status = status_of(&label);
                (label, status)
            }
        }
        CommandTree::Pipe(_) => {
            let status = status_of("pipe");
            ("pipe".into(), status)
        }
        other => panic!("unexpected dispatched command: {other:?}"),
    }
}

/// Drain the scheduler to EOF on the current thread, running every lease
/// through `status_of`. Returns the labels in execution order. Panics on
/// a stall, which in a serial drain means a scheduling deadlock.
pub fn drain_with(
    sched: &Scheduler,
    status_of: &mut dyn FnMut(&str) -> ExitStatus,
) -> Vec<String> {
    let mut order = Vec::new();
    loop {
        match sched.try_pull().expect("scheduler error") {
            Some(Pull::Lease(lease)) => {
                let (label, status) = run_lease(sched, &lease, status_of);
                order.push(label);
                sched.complete(lease, status).expect("completion rejected");
            }
            Some(Pull::Eof) => return order,
            None => panic!("scheduler stalled with work outstanding: {:?}", sched.stats()),
        }
    }
}

/// Drain with every command succeeding.
pub fn drain(sched: &Scheduler) -> Vec<String> {
    drain_with(sched, &mut |_| ExitStatus::SUCCESS)
}

/// Index of a label in the execution order, or a panic naming it.
pub fn position(order: &[String], needle: &str) -> usize {
    order
        .iter()
        .position(|l| l == needle)
        .unwrap_or_else(|| panic!("{needle:?} never executed; order was {order:?}"))
}
