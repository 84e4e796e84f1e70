//! Concurrency tests: real worker tasks racing over the frontier.
//!
//! A timing evaluator records the start and end instant of every command;
//! assertions are on the recorded intervals, not on scheduler internals.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::*;
use parsh_kernel::{
    run_worker, CommandTree, Evaluator, ExitStatus, Lease, Scheduler, Word,
};

/// Records (label, start, end) per command; commands named `sleep` pause
/// for the number of milliseconds in their first argument.
struct TimedEval {
    log: Mutex<Vec<(String, Instant, Instant)>>,
}

impl TimedEval {
    fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
        }
    }

    fn interval(&self, label: &str) -> (Instant, Instant) {
        let log = self.log.lock().unwrap();
        log.iter()
            .find(|(l, _, _)| l == label)
            .map(|(_, s, e)| (*s, *e))
            .unwrap_or_else(|| panic!("{label:?} never ran; log: {:?}", labels(&log)))
    }

    fn ran(&self, label: &str) -> bool {
        self.log.lock().unwrap().iter().any(|(l, _, _)| l == label)
    }
}

fn labels(log: &[(String, Instant, Instant)]) -> Vec<String> {
    log.iter().map(|(l, _, _)| l.clone()).collect()
}

#[async_trait]
impl Evaluator for TimedEval {
    async fn evaluate(&self, sched: &Scheduler, lease: &Lease) -> ExitStatus {
        let start = Instant::now();
        let (label, status) = run_lease(sched, lease, &mut |_| ExitStatus::SUCCESS);
        if let Some(ms) = label
            .strip_prefix("sleep ")
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|n| n.parse::<u64>().ok())
        {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.log.lock().unwrap().push((label, start, Instant::now()));
        status
    }
}

async fn run_workers(sched: &Arc<Scheduler>, eval: &Arc<TimedEval>, count: usize) {
    let mut handles = Vec::new();
    for _ in 0..count {
        let sched = sched.clone();
        let eval: Arc<dyn Evaluator> = eval.clone();
        handles.push(tokio::spawn(run_worker(sched, eval)));
    }
    for handle in handles {
        handle.await.expect("worker panicked").expect("worker errored");
    }
}

/// A sleep command tagged so its label stays unique, writing `path`.
fn sleeper(ms: u64, tag: &str, path: &str) -> CommandTree {
    cmd_io(&[lit("sleep"), lit(&ms.to_string()), lit(tag)], &[], &[path])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_writes_never_overlap() {
    // sleep > a & quick > a : the second write starts after the first ends
    let sched = Arc::new(Scheduler::new());
    let eval = Arc::new(TimedEval::new());

    sched.submit(sleeper(50, "slow", "a")).unwrap();
    sched
        .submit(cmd_io(&[lit("quick")], &[], &["a"]))
        .unwrap();
    sched.submit(CommandTree::Eof).unwrap();

    run_workers(&sched, &eval, 3).await;

    let (_, slow_end) = eval.interval("sleep 50 slow");
    let (quick_start, _) = eval.interval("quick");
    assert!(
        quick_start >= slow_end,
        "writer of `a` overlapped an earlier writer of `a`"
    );
    assert!(sched.is_quiescent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_commands_overlap() {
    let sched = Arc::new(Scheduler::new());
    let eval = Arc::new(TimedEval::new());

    sched.submit(sleeper(80, "one", "a")).unwrap();
    sched.submit(sleeper(80, "two", "b")).unwrap();
    sched.submit(CommandTree::Eof).unwrap();

    run_workers(&sched, &eval, 2).await;

    let (s1, e1) = eval.interval("sleep 80 one");
    let (s2, e2) = eval.interval("sleep 80 two");
    assert!(
        s1 < e2 && s2 < e1,
        "independent sleeps were serialized: {s1:?}..{e1:?} vs {s2:?}..{e2:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn variable_readers_wait_for_publication() {
    // x=5 ; y=10 ; echo $x$y > out — with racing workers the reader must
    // still observe both published values
    let sched = Arc::new(Scheduler::new());
    let eval = Arc::new(TimedEval::new());

    sched
        .submit(seq(vec![
            assign("x", lit("5")),
            assign("y", lit("10")),
            cmd_io(
                &[lit("echo"), Word::Concat(vec![var("x"), var("y")])],
                &[],
                &["out"],
            ),
        ]))
        .unwrap();
    sched.submit(CommandTree::Eof).unwrap();

    run_workers(&sched, &eval, 3).await;

    assert!(eval.ran("echo 510"), "reader saw unpublished variables");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_drain_and_exit_on_eof() {
    let sched = Arc::new(Scheduler::new());
    let eval = Arc::new(TimedEval::new());

    for i in 0..8 {
        sched
            .submit(cmd_io(&[lit("job"), lit(&i.to_string())], &[], &[]))
            .unwrap();
    }
    sched.submit(CommandTree::Eof).unwrap();

    // run_workers awaits every worker: reaching here proves they all
    // observed EOF after the graph drained
    run_workers(&sched, &eval, 4).await;

    assert_eq!(eval.log.lock().unwrap().len(), 8);
    let stats = sched.stats();
    assert_eq!((stats.nodes, stats.frontier, stats.waiters), (0, 0, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn eof_submitted_before_workers_start_still_drains() {
    let sched = Arc::new(Scheduler::new());
    let eval = Arc::new(TimedEval::new());

    sched.submit(sleeper(10, "late", "a")).unwrap();
    sched.submit(CommandTree::Eof).unwrap();

    run_workers(&sched, &eval, 2).await;
    assert!(eval.ran("sleep 10 late"));
    assert!(sched.is_quiescent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn loop_work_runs_under_racing_workers() {
    // the for/continue scenario, now with real contention
    init_tracing();
    let sched = Arc::new(Scheduler::new());
    let eval = Arc::new(TimedEval::new());

    let body = seq(vec![
        if_then(
            cmd(&[lit("["), var("i"), lit("="), lit("2"), lit("]")]),
            CommandTree::Continue(None),
        ),
        CommandTree::Simple {
            args: vec![lit("echo"), var("i")],
            assigns: Vec::new(),
            redirects: vec![parsh_kernel::Redirect::to_file(
                parsh_kernel::RedirectKind::Out,
                Word::Concat(vec![lit("f"), var("i")]),
            )],
        },
    ]);
    sched
        .submit(for_loop("i", &[lit("1"), lit("2"), lit("3")], body))
        .unwrap();
    sched.submit(CommandTree::Eof).unwrap();

    let brackets = Arc::new(BracketEval { inner: eval.clone() });
    let mut handles = Vec::new();
    for _ in 0..3 {
        let sched = sched.clone();
        let eval: Arc<dyn Evaluator> = brackets.clone();
        handles.push(tokio::spawn(run_worker(sched, eval)));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(eval.ran("echo 1"));
    assert!(eval.ran("echo 3"));
    assert!(!eval.ran("echo 2"), "iteration 2 was not pruned");
    assert!(sched.is_quiescent());
}

/// Wraps TimedEval with shell-style `[ a = b ]` semantics.
struct BracketEval {
    inner: Arc<TimedEval>,
}

#[async_trait]
impl Evaluator for BracketEval {
    async fn evaluate(&self, sched: &Scheduler, lease: &Lease) -> ExitStatus {
        let start = Instant::now();
        let (label, _) = run_lease(sched, lease, &mut |_| ExitStatus::SUCCESS);
        let tokens: Vec<&str> = label.split_whitespace().collect();
        let status = if tokens.first() == Some(&"[") && tokens.get(1) != tokens.get(3) {
            ExitStatus::FAILURE
        } else {
            ExitStatus::SUCCESS
        };
        self.inner
            .log
            .lock()
            .unwrap()
            .push((label, start, Instant::now()));
        status
    }
}
