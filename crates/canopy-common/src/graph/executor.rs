//! Bounded-parallelism scheduler for compiled task graphs

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{TaskGraph, TaskState};
use crate::{Error, Result};

/// Worker pool size when none is configured
pub const DEFAULT_PARALLELISM: usize = 4;

/// Snapshot passed to the progress callback on every state transition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    /// Task whose state just changed
    pub task: String,
    /// Its new state
    pub state: TaskState,
    /// Tasks that ended `Succeeded` or `Skipped`
    pub completed: usize,
    /// Tasks that ended `Failed`
    pub failed: usize,
    /// Tasks that ended `NotRun`
    pub not_run: usize,
    /// Number of tasks in the graph
    pub total: usize,
    /// Ids of tasks currently running
    pub running: Vec<String>,
}

/// Progress callback
pub type ProgressFn = dyn Fn(&Progress) + Send + Sync;

/// Outcome of one graph execution
#[derive(Clone, Debug)]
pub struct GraphReport {
    states: Vec<(String, TaskState)>,
    first_failure: Option<(String, String)>,
}

impl GraphReport {
    /// Final state of a task
    pub fn state(&self, id: &str) -> Option<TaskState> {
        self.states.iter().find(|(t, _)| t == id).map(|(_, s)| *s)
    }

    /// All final states, in insertion order
    pub fn states(&self) -> &[(String, TaskState)] {
        &self.states
    }

    /// True when every task `Succeeded` or was `Skipped`
    pub fn is_success(&self) -> bool {
        self.states.iter().all(|(_, s)| s.unblocks_dependents())
    }

    /// First task that failed, with its error message
    pub fn first_failure(&self) -> Option<(&str, &str)> {
        self.first_failure
            .as_ref()
            .map(|(t, m)| (t.as_str(), m.as_str()))
    }

    /// Tasks that never started
    pub fn not_run(&self) -> Vec<String> {
        self.with_state(TaskState::NotRun)
    }

    /// Ids of tasks that ended in `state`
    pub fn with_state(&self, state: TaskState) -> Vec<String> {
        self.states
            .iter()
            .filter(|(_, s)| *s == state)
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Collapse the report into a single result
    ///
    /// A failure yields [`Error::TaskFailed`] with the first failing task's
    /// message and the tasks that never ran. A cancellation that stopped
    /// tasks without any failing yields [`Error::Cancelled`].
    pub fn into_result(self) -> Result<()> {
        let not_run = self.not_run();
        if let Some((task, message)) = self.first_failure {
            return Err(Error::TaskFailed {
                task,
                message,
                not_run,
            });
        }
        if !not_run.is_empty() {
            return Err(Error::cancelled(format!(
                "not run: {}",
                not_run.join(", ")
            )));
        }
        Ok(())
    }
}

/// Runs compiled graphs over a bounded pool of tokio tasks
#[derive(Clone, Debug)]
pub struct Executor {
    parallelism: usize,
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

impl Executor {
    /// Executor with the default pool size
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor running at most `parallelism` task bodies at once (minimum 1)
    pub fn with_parallelism(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
        }
    }

    /// Configured pool size
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Execute the graph to completion
    ///
    /// Never returns early: independent branches keep running after a
    /// failure, and running tasks are awaited after cancellation.
    pub async fn run(
        &self,
        graph: TaskGraph,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> GraphReport {
        let mut run = Run::new(&graph, progress);
        let mut ready: VecDeque<usize> = (0..graph.len())
            .filter(|&i| graph.dependencies[i].is_empty())
            .collect();
        let mut workers: JoinSet<(usize, Result<()>)> = JoinSet::new();
        let mut cancel_seen = false;

        info!(tasks = graph.len(), parallelism = self.parallelism, "executing task graph");

        loop {
            if cancel.is_cancelled() && !cancel_seen {
                cancel_seen = true;
                warn!("cancellation requested, halting pending tasks");
                ready.clear();
                run.halt_pending();
            }

            while workers.len() < self.parallelism {
                let Some(i) = ready.pop_front() else { break };
                let task = &graph.tasks[i];

                if task.should_skip() {
                    debug!(task = %task.id, "skip condition met");
                    run.transition(i, TaskState::Skipped);
                    ready.extend(run.release_dependents(i));
                    continue;
                }
                if !task.should_do() {
                    debug!(task = %task.id, "do condition not met, reporting success");
                    run.transition(i, TaskState::Succeeded);
                    ready.extend(run.release_dependents(i));
                    continue;
                }

                run.transition(i, TaskState::Running);
                let body = (task.run)(cancel.child_token());
                workers.spawn(async move {
                    let result = AssertUnwindSafe(body)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(Error::internal("task panicked")));
                    (i, result)
                });
            }

            if workers.is_empty() {
                break;
            }

            let joined = tokio::select! {
                joined = workers.join_next() => joined,
                _ = cancel.cancelled(), if !cancel_seen => continue,
            };

            match joined {
                Some(Ok((i, Ok(())))) => {
                    info!(task = %graph.tasks[i].id, "task succeeded");
                    run.transition(i, TaskState::Succeeded);
                    ready.extend(run.release_dependents(i));
                }
                Some(Ok((i, Err(e)))) => {
                    error!(task = %graph.tasks[i].id, error = %e, "task failed");
                    run.fail(i, e.to_string());
                    for d in graph.transitive_dependents(i) {
                        run.transition_if_pending(d, TaskState::NotRun);
                    }
                }
                Some(Err(e)) => error!(error = %e, "task worker aborted"),
                None => break,
            }
        }

        run.finish()
    }
}

/// Mutable bookkeeping for one execution
struct Run<'g> {
    graph: &'g TaskGraph,
    states: Vec<TaskState>,
    remaining: Vec<usize>,
    first_failure: Option<(String, String)>,
    progress: Option<&'g ProgressFn>,
}

impl<'g> Run<'g> {
    fn new(graph: &'g TaskGraph, progress: Option<&'g ProgressFn>) -> Self {
        Self {
            graph,
            states: vec![TaskState::Pending; graph.len()],
            remaining: graph.dependencies.iter().map(Vec::len).collect(),
            first_failure: None,
            progress,
        }
    }

    fn transition(&mut self, i: usize, state: TaskState) {
        self.states[i] = state;
        self.report(i);
    }

    fn transition_if_pending(&mut self, i: usize, state: TaskState) {
        if self.states[i] == TaskState::Pending {
            self.transition(i, state);
        }
    }

    fn fail(&mut self, i: usize, message: String) {
        if self.first_failure.is_none() {
            self.first_failure = Some((self.graph.tasks[i].id.clone(), message));
        }
        self.transition(i, TaskState::Failed);
    }

    fn halt_pending(&mut self) {
        for i in 0..self.states.len() {
            self.transition_if_pending(i, TaskState::NotRun);
        }
    }

    /// Dependents that became eligible because `i` finished without failing
    fn release_dependents(&mut self, i: usize) -> Vec<usize> {
        let mut eligible = Vec::new();
        for &d in &self.graph.dependents[i] {
            self.remaining[d] -= 1;
            if self.remaining[d] == 0 && self.states[d] == TaskState::Pending {
                eligible.push(d);
            }
        }
        eligible
    }

    fn report(&self, i: usize) {
        let Some(progress) = self.progress else {
            return;
        };
        let count = |state: TaskState| self.states.iter().filter(|s| **s == state).count();
        progress(&Progress {
            task: self.graph.tasks[i].id.clone(),
            state: self.states[i],
            completed: count(TaskState::Succeeded) + count(TaskState::Skipped),
            failed: count(TaskState::Failed),
            not_run: count(TaskState::NotRun),
            total: self.states.len(),
            running: self
                .states
                .iter()
                .enumerate()
                .filter(|(_, s)| **s == TaskState::Running)
                .map(|(j, _)| self.graph.tasks[j].id.clone())
                .collect(),
        });
    }

    fn finish(mut self) -> GraphReport {
        // Anything still open was stranded by an aborted worker
        for i in 0..self.states.len() {
            if !self.states[i].is_terminal() {
                self.transition(i, TaskState::NotRun);
            }
        }
        GraphReport {
            states: self
                .graph
                .tasks
                .iter()
                .zip(self.states)
                .map(|(t, s)| (t.id.clone(), s))
                .collect(),
            first_failure: self.first_failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Task, TaskGraphBuilder};
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(id: &str, log: &Log) -> Task {
        let log = log.clone();
        let name = id.to_string();
        Task::new(id, move |_| {
            let log = log.clone();
            let name = name.clone();
            async move {
                log.lock().push(format!("start:{name}"));
                tokio::task::yield_now().await;
                log.lock().push(format!("end:{name}"));
                Ok(())
            }
        })
    }

    fn failing(id: &str, message: &'static str) -> Task {
        Task::new(id, move |_| async move { Err(Error::transport("test", message)) })
    }

    fn position(log: &[String], entry: &str) -> usize {
        log.iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{entry} missing from {log:?}"))
    }

    /// Story: B and C both depend on A; A must finish before either starts
    #[tokio::test]
    async fn story_dependencies_order_execution() {
        let log: Log = Arc::default();
        let graph = TaskGraphBuilder::new()
            .task(recording("a", &log))
            .task(recording("b", &log).depends_on(["a"]))
            .task(recording("c", &log).depends_on(["a"]))
            .build()
            .unwrap();

        let report = Executor::new()
            .run(graph, &CancellationToken::new(), None)
            .await;
        assert!(report.is_success());

        let log = log.lock();
        assert!(position(&log, "end:a") < position(&log, "start:b"));
        assert!(position(&log, "end:a") < position(&log, "start:c"));
    }

    /// Story: A fails, its dependents never run, an independent D still completes
    #[tokio::test]
    async fn story_failure_is_contained_to_its_branch() {
        let log: Log = Arc::default();
        let graph = TaskGraphBuilder::new()
            .task(failing("a", "boom"))
            .task(recording("b", &log).depends_on(["a"]))
            .task(recording("c", &log).depends_on(["b"]))
            .task(recording("d", &log))
            .build()
            .unwrap();

        let report = Executor::new()
            .run(graph, &CancellationToken::new(), None)
            .await;

        assert_eq!(report.state("a"), Some(TaskState::Failed));
        assert_eq!(report.state("b"), Some(TaskState::NotRun));
        assert_eq!(report.state("c"), Some(TaskState::NotRun));
        assert_eq!(report.state("d"), Some(TaskState::Succeeded));
        assert!(!log.lock().iter().any(|e| e.ends_with(":b") || e.ends_with(":c")));

        match report.into_result().unwrap_err() {
            Error::TaskFailed { task, message, not_run } => {
                assert_eq!(task, "a");
                assert!(message.contains("boom"));
                assert_eq!(not_run, vec!["b", "c"]);
            }
            other => panic!("expected TaskFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn skip_if_marks_skipped_and_unblocks_dependents() {
        let log: Log = Arc::default();
        let graph = TaskGraphBuilder::new()
            .task(recording("bucket", &log).skip_if(|| true))
            .task(recording("store", &log).depends_on(["bucket"]))
            .build()
            .unwrap();

        let report = Executor::new()
            .run(graph, &CancellationToken::new(), None)
            .await;
        assert_eq!(report.state("bucket"), Some(TaskState::Skipped));
        assert_eq!(report.state("store"), Some(TaskState::Succeeded));
        assert_eq!(*log.lock(), vec!["start:store", "end:store"]);
    }

    #[tokio::test]
    async fn do_if_false_reports_success_without_running() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let graph = TaskGraphBuilder::new()
            .task(
                Task::new("delete-bucket", move |_| {
                    let r = r.clone();
                    async move {
                        r.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .do_if(|| false),
            )
            .build()
            .unwrap();

        let report = Executor::new()
            .run(graph, &CancellationToken::new(), None)
            .await;
        assert_eq!(report.state("delete-bucket"), Some(TaskState::Succeeded));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn parallelism_bounds_concurrent_bodies() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut builder = TaskGraphBuilder::new();
        for n in 0..8 {
            let active = active.clone();
            let peak = peak.clone();
            builder.add(Task::new(format!("t{n}"), move |_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }

        let report = Executor::with_parallelism(2)
            .run(builder.build().unwrap(), &CancellationToken::new(), None)
            .await;
        assert!(report.is_success());
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn progress_is_reported_on_every_transition() {
        let seen: Arc<Mutex<Vec<Progress>>> = Arc::default();
        let s = seen.clone();
        let callback = move |p: &Progress| s.lock().push(p.clone());
        let callback: &ProgressFn = &callback;

        let graph = TaskGraphBuilder::new()
            .task(Task::new("a", |_| async { Ok(()) }))
            .task(Task::new("b", |_| async { Ok(()) }).depends_on(["a"]).skip_if(|| true))
            .build()
            .unwrap();

        Executor::new()
            .run(graph, &CancellationToken::new(), Some(callback))
            .await;

        let seen = seen.lock();
        let transitions: Vec<(String, TaskState)> =
            seen.iter().map(|p| (p.task.clone(), p.state)).collect();
        assert_eq!(
            transitions,
            vec![
                ("a".to_string(), TaskState::Running),
                ("a".to_string(), TaskState::Succeeded),
                ("b".to_string(), TaskState::Skipped),
            ]
        );
        assert_eq!(seen[0].running, vec!["a"]);
        let last = seen.last().unwrap();
        assert_eq!((last.completed, last.failed, last.total), (2, 0, 2));
        assert!(last.running.is_empty());
    }

    /// Story: cancellation halts tasks that haven't started, and running
    /// tasks observe their child token
    #[tokio::test]
    async fn story_cancellation_halts_pending_tasks() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let graph = TaskGraphBuilder::new()
            .task(Task::new("long", move |token: CancellationToken| {
                let trigger = trigger.clone();
                async move {
                    trigger.cancel();
                    token.cancelled().await;
                    Err(Error::cancelled("long"))
                }
            }))
            .task(Task::new("after", |_| async { Ok(()) }).depends_on(["long"]))
            .task(Task::new("other", |_| async { Ok(()) }).depends_on(["long"]))
            .build()
            .unwrap();

        let report = Executor::with_parallelism(1).run(graph, &cancel, None).await;
        assert_eq!(report.state("long"), Some(TaskState::Failed));
        assert_eq!(report.state("after"), Some(TaskState::NotRun));
        assert_eq!(report.state("other"), Some(TaskState::NotRun));
    }

    #[tokio::test]
    async fn cancellation_before_start_runs_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let graph = TaskGraphBuilder::new()
            .task(Task::new("a", |_| async { Ok(()) }))
            .build()
            .unwrap();

        let report = Executor::new().run(graph, &cancel, None).await;
        assert_eq!(report.state("a"), Some(TaskState::NotRun));
        assert!(matches!(
            report.into_result().unwrap_err(),
            Error::Cancelled { .. }
        ));
    }

    #[tokio::test]
    async fn panicking_task_is_a_failure() {
        let graph = TaskGraphBuilder::new()
            .task(Task::new("a", |_| async {
                if true {
                    panic!("bug");
                }
                Ok(())
            }))
            .task(Task::new("b", |_| async { Ok(()) }).depends_on(["a"]))
            .build()
            .unwrap();

        let report = Executor::new()
            .run(graph, &CancellationToken::new(), None)
            .await;
        assert_eq!(report.state("a"), Some(TaskState::Failed));
        assert_eq!(report.state("b"), Some(TaskState::NotRun));
        assert_eq!(report.first_failure().unwrap().1, "internal error [unknown]: task panicked");
    }
}
