//! Task graph for ordering deploy and teardown steps
//!
//! Three separate stages:
//! - construction: [`Task`] records collected in a [`TaskGraphBuilder`]
//! - compilation: [`TaskGraphBuilder::build`] rejects duplicate ids, unknown
//!   dependencies and cycles before anything runs
//! - execution: [`Executor::run`] schedules a compiled [`TaskGraph`] over a
//!   bounded worker pool
//!
//! A task is eligible once every dependency is `Succeeded` or `Skipped`.
//! `skip_if` is evaluated at that moment and marks the task `Skipped`.
//! `do_if` returning false reports `Succeeded` without running it.

mod executor;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::Result;

pub use executor::{Executor, GraphReport, Progress, ProgressFn, DEFAULT_PARALLELISM};

/// Boxed future returned by a task body
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

type TaskFn = Arc<dyn Fn(CancellationToken) -> TaskFuture + Send + Sync>;
type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Errors detected while compiling a graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Two tasks share an id
    #[error("duplicate task id: {id}")]
    DuplicateTask {
        /// The repeated id
        id: String,
    },

    /// A dependency names a task that was never added
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency {
        /// Task declaring the dependency
        task: String,
        /// The unresolved id
        dependency: String,
    },

    /// Dependencies form a cycle
    #[error("dependency cycle among tasks: {}", .tasks.join(", "))]
    Cycle {
        /// Tasks that are part of, or stuck behind, the cycle
        tasks: Vec<String>,
    },
}

/// Lifecycle of a task within one execution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Waiting on dependencies
    Pending,
    /// Body is executing
    Running,
    /// Body returned Ok, or `do_if` was false
    Succeeded,
    /// Body returned an error
    Failed,
    /// `skip_if` held at eligibility time
    Skipped,
    /// Never started: a dependency failed or execution was cancelled
    NotRun,
}

impl TaskState {
    /// True once the task will not change state again
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }

    /// True for states that let dependents proceed
    pub fn unblocks_dependents(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Skipped)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "Pending",
            TaskState::Running => "Running",
            TaskState::Succeeded => "Succeeded",
            TaskState::Failed => "Failed",
            TaskState::Skipped => "Skipped",
            TaskState::NotRun => "NotRun",
        };
        f.write_str(s)
    }
}

/// A named unit of work with dependencies and optional gates
pub struct Task {
    id: String,
    dependencies: Vec<String>,
    skip_if: Option<Predicate>,
    do_if: Option<Predicate>,
    run: TaskFn,
}

impl Task {
    /// Create a task whose body receives a cancellation token
    pub fn new<F, Fut>(id: impl Into<String>, run: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            skip_if: None,
            do_if: None,
            run: Arc::new(move |cancel| Box::pin(run(cancel))),
        }
    }

    /// Add dependencies
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Mark the task `Skipped` when the predicate holds
    pub fn skip_if(mut self, predicate: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.skip_if = Some(Arc::new(predicate));
        self
    }

    /// Only run the body when the predicate holds; report success otherwise
    pub fn do_if(mut self, predicate: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.do_if = Some(Arc::new(predicate));
        self
    }

    /// Task id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declared dependencies
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn should_skip(&self) -> bool {
        self.skip_if.as_ref().is_some_and(|p| p())
    }

    fn should_do(&self) -> bool {
        self.do_if.as_ref().map_or(true, |p| p())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("skip_if", &self.skip_if.is_some())
            .field("do_if", &self.do_if.is_some())
            .finish()
    }
}

/// Collects tasks before compilation
#[derive(Debug, Default)]
pub struct TaskGraphBuilder {
    tasks: Vec<Task>,
}

impl TaskGraphBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task
    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Add a task through a mutable reference
    pub fn add(&mut self, task: Task) -> &mut Self {
        self.tasks.push(task);
        self
    }

    /// Validate and compile the graph
    pub fn build(self) -> std::result::Result<TaskGraph, GraphError> {
        let mut index = HashMap::with_capacity(self.tasks.len());
        for (i, task) in self.tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateTask {
                    id: task.id.clone(),
                });
            }
        }

        let mut dependencies = Vec::with_capacity(self.tasks.len());
        let mut dependents = vec![Vec::new(); self.tasks.len()];
        for (i, task) in self.tasks.iter().enumerate() {
            let mut deps = Vec::with_capacity(task.dependencies.len());
            for dep in &task.dependencies {
                let &d = index.get(dep).ok_or_else(|| GraphError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })?;
                if !deps.contains(&d) {
                    deps.push(d);
                    dependents[d].push(i);
                }
            }
            dependencies.push(deps);
        }

        let order = topological_order(&dependencies, &dependents).map_err(|stuck| {
            GraphError::Cycle {
                tasks: stuck.into_iter().map(|i| self.tasks[i].id.clone()).collect(),
            }
        })?;

        Ok(TaskGraph {
            tasks: self.tasks,
            index,
            dependencies,
            dependents,
            order,
        })
    }
}

/// Kahn's algorithm; on a cycle returns the nodes that never became free
fn topological_order(
    dependencies: &[Vec<usize>],
    dependents: &[Vec<usize>],
) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let mut remaining: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut queue: VecDeque<usize> = (0..remaining.len()).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(remaining.len());

    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &d in &dependents[i] {
            remaining[d] -= 1;
            if remaining[d] == 0 {
                queue.push_back(d);
            }
        }
    }

    if order.len() == remaining.len() {
        Ok(order)
    } else {
        Err((0..remaining.len()).filter(|&i| remaining[i] > 0).collect())
    }
}

/// A validated, acyclic task graph ready for execution
#[derive(Debug)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl TaskGraph {
    /// Number of tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True for a graph without tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task ids in insertion order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.id.as_str())
    }

    /// Task ids in a valid topological order
    pub fn topological_ids(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.tasks[i].id.as_str()).collect()
    }

    /// Direct dependencies of a task
    pub fn dependencies_of(&self, id: &str) -> Option<Vec<&str>> {
        let &i = self.index.get(id)?;
        Some(
            self.dependencies[i]
                .iter()
                .map(|&d| self.tasks[d].id.as_str())
                .collect(),
        )
    }

    /// All tasks that depend on `root`, directly or transitively
    fn transitive_dependents(&self, root: usize) -> Vec<usize> {
        let mut seen = vec![false; self.tasks.len()];
        let mut stack = self.dependents[root].clone();
        let mut out = Vec::new();
        while let Some(i) = stack.pop() {
            if !seen[i] {
                seen[i] = true;
                out.push(i);
                stack.extend(self.dependents[i].iter().copied());
            }
        }
        out
    }
}
