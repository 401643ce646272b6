//! Task master - resolve, validate, then lazily execute
//!
//! The single public entry point is [`TaskMaster::execute`]: it resolves the
//! task's dependency closure, structurally validates the metadata, and
//! defers the actual run behind a lazy, memoized result. Graph and
//! validation failures are statuses on the returned [`TaskResult`], never
//! errors from `execute` itself; invocation failures surface when the
//! result is forced.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::error::TaskmeshError;
use crate::meta::{self, Meta, Verification};
use crate::runner::TaskRunner;
use crate::task::Task;
use crate::task_graph::{TaskNode, TaskTree};
use crate::workspace::Workspace;

/// Final outcome of one execution attempt, mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Resolution found unresolved dependencies; nothing was executed.
    DependenciesError,
    /// Metadata failed validation; nothing was executed.
    MetaError,
    /// Set retroactively the first time the deferred run fails.
    InvocationError,
    /// Validation passed; the value is computed lazily on first force.
    ContainsData,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::DependenciesError => "dependencies_error",
            TaskStatus::MetaError => "meta_error",
            TaskStatus::InvocationError => "invocation_error",
            TaskStatus::ContainsData => "contains_data",
        };
        f.write_str(s)
    }
}

/// Structured detail for a `MetaError` outcome: the structural verification
/// and/or the task's own semantic check failure.
#[derive(Debug, Clone)]
pub struct TaskMetaError {
    pub task: String,
    pub verification: Option<Verification>,
    pub check_error: Option<String>,
}

impl TaskMetaError {
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(v) = &self.verification {
            parts.push(v.describe());
        }
        if let Some(e) = &self.check_error {
            parts.push(e.clone());
        }
        parts.join("; ")
    }

    pub fn to_value(&self) -> Value {
        json!({
            "task": self.task,
            "issues": self.verification.as_ref().map(|v| v.to_value()).unwrap_or(json!([])),
            "check_error": self.check_error,
        })
    }
}

type LazyEval = Box<dyn FnOnce() -> Result<Value, TaskmeshError> + Send>;

/// Outcome of one `execute` call. The value is computed at most once, on
/// first force; both success and failure are memoized, and a failed run
/// flips the status to `InvocationError` permanently.
pub struct TaskResult {
    status: TaskStatus,
    node: Arc<TaskNode>,
    meta_error: Option<TaskMetaError>,
    pending: Option<LazyEval>,
    outcome: Option<Result<Value, TaskmeshError>>,
}

impl fmt::Debug for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskResult")
            .field("status", &self.status)
            .field("task", &self.node.task().name())
            .field("forced", &self.outcome.is_some())
            .finish()
    }
}

impl TaskResult {
    fn terminal(status: TaskStatus, node: Arc<TaskNode>, error: TaskmeshError) -> Self {
        Self {
            status,
            node,
            meta_error: None,
            pending: None,
            outcome: Some(Err(error)),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn node(&self) -> &Arc<TaskNode> {
        &self.node
    }

    pub fn meta_error(&self) -> Option<&TaskMetaError> {
        self.meta_error.as_ref()
    }

    /// The already-forced value, if any.
    pub fn data(&self) -> Option<&Value> {
        match &self.outcome {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }

    /// Force the deferred computation. The first call runs it; every call
    /// returns the same memoized outcome. A failing run records the error,
    /// switches the status to `InvocationError`, and keeps returning that
    /// same error. Terminal graph/validation results force to their
    /// structured error instead of running anything.
    pub fn force(&mut self) -> Result<&Value, &TaskmeshError> {
        if self.outcome.is_none() {
            let eval = self.pending.take().expect("lazy evaluation present");
            let outcome = eval();
            if outcome.is_err() {
                self.status = TaskStatus::InvocationError;
            }
            self.outcome = Some(outcome);
        }
        self.outcome
            .as_ref()
            .expect("outcome memoized")
            .as_ref()
    }
}

/// Orchestrates resolution, validation, and deferred execution through a
/// chosen runner, with an optional node cache.
pub struct TaskMaster {
    runner: Arc<dyn TaskRunner>,
    tree: Option<Arc<TaskTree>>,
}

impl TaskMaster {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self { runner, tree: None }
    }

    /// Reuse resolved nodes across executions.
    pub fn with_tree(mut self, tree: Arc<TaskTree>) -> Self {
        self.tree = Some(tree);
        self
    }

    /// Resolve → validate → defer. Never fails for graph or validation
    /// problems; those become the result's status.
    ///
    /// When no workspace is given the task's home workspace (recorded at
    /// registration) is used; a task with neither gets an empty anonymous
    /// workspace, so any declared dependency shows up as unresolved.
    #[instrument(skip(self, meta, task, workspace), fields(task = task.name()))]
    pub fn execute(
        &self,
        meta: Meta,
        task: &Arc<Task>,
        workspace: Option<&Arc<Workspace>>,
    ) -> TaskResult {
        let workspace = match workspace {
            Some(ws) => Arc::clone(ws),
            None => task.home().unwrap_or_else(Workspace::anonymous),
        };

        let node = match &self.tree {
            Some(tree) => tree.resolve_node(task, &workspace),
            None => TaskNode::resolve(Arc::clone(task), workspace),
        };

        if node.has_dependency_errors() {
            let first = node
                .unresolved_dependencies()
                .into_iter()
                .next()
                .expect("unresolved dependency present");
            debug!(path = %first.path, "dependency resolution failed");
            let error = TaskmeshError::UnresolvedDependency {
                path: first.path,
                required_by: first.required_by,
            };
            return TaskResult::terminal(TaskStatus::DependenciesError, node, error);
        }

        let verification = meta::verify(&meta, task.specification());
        if !verification.succeeded() {
            debug!(issues = verification.errors().len(), "metadata rejected");
            let meta_error = TaskMetaError {
                task: task.name().to_string(),
                verification: Some(verification),
                check_error: None,
            };
            return self.meta_error_result(node, meta_error);
        }

        // Semantic hook beyond structural validation.
        if let Err(check_error) = task.check_by_meta(&meta) {
            debug!(%check_error, "meta check hook rejected");
            let meta_error = TaskMetaError {
                task: task.name().to_string(),
                verification: None,
                check_error: Some(check_error),
            };
            return self.meta_error_result(node, meta_error);
        }

        let runner = Arc::clone(&self.runner);
        let run_node = Arc::clone(&node);
        TaskResult {
            status: TaskStatus::ContainsData,
            node,
            meta_error: None,
            pending: Some(Box::new(move || runner.run(&meta, &run_node))),
            outcome: None,
        }
    }

    fn meta_error_result(&self, node: Arc<TaskNode>, meta_error: TaskMetaError) -> TaskResult {
        let error = TaskmeshError::MetaRejected {
            task: meta_error.task.clone(),
            details: meta_error.describe(),
        };
        TaskResult {
            status: TaskStatus::MetaError,
            node,
            meta_error: Some(meta_error),
            pending: None,
            outcome: Some(Err(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Specification, ValueType};
    use crate::runner::SequentialRunner;
    use crate::workspace::{demo_workspace, WorkspaceBuilder};
    use serde_json::json;

    fn master() -> TaskMaster {
        TaskMaster::new(Arc::new(SequentialRunner))
    }

    #[test]
    fn free_task_always_contains_data() {
        // No dependencies, no specification: any meta reaches CONTAINS_DATA.
        let task = Arc::new(Task::data("free", |_| Ok(json!("ok"))));
        for meta in [
            Meta::new(),
            Meta::from_value(json!({"noise": [1, 2, 3]})).unwrap(),
        ] {
            let result = master().execute(meta, &task, None);
            assert_eq!(result.status(), TaskStatus::ContainsData);
        }
    }

    #[test]
    fn dependency_chain_executes_lazily() {
        let ws = demo_workspace();
        let b = ws.find_task("b").unwrap().unwrap();
        let mut result = master().execute(Meta::new(), &b, Some(&ws));
        assert_eq!(result.status(), TaskStatus::ContainsData);
        assert!(result.data().is_none(), "not computed before force");
        assert_eq!(result.force().unwrap(), &json!(2));
        assert_eq!(result.data(), Some(&json!(2)));
    }

    #[test]
    fn unresolved_dependency_is_terminal() {
        let orphan = Task::function("orphan", vec!["ghost".to_string()], |_m, _d| Ok(json!(0)));
        let ws = WorkspaceBuilder::new("w").task(orphan).build();
        let task = ws.find_task("orphan").unwrap().unwrap();
        let mut result = master().execute(Meta::new(), &task, Some(&ws));
        assert_eq!(result.status(), TaskStatus::DependenciesError);
        let err = result.force().unwrap_err();
        assert!(matches!(err, TaskmeshError::UnresolvedDependency { .. }));
        // Forcing a terminal result does not change its status.
        assert_eq!(result.status(), TaskStatus::DependenciesError);
    }

    #[test]
    fn mistyped_meta_is_meta_error() {
        let ws = demo_workspace();
        let counted = ws.find_task("counted").unwrap().unwrap();
        let meta = Meta::from_value(json!({"count": "x"})).unwrap();
        let result = master().execute(meta, &counted, Some(&ws));
        assert_eq!(result.status(), TaskStatus::MetaError);
        let detail = result.meta_error().unwrap();
        let issues = detail.verification.as_ref().unwrap().errors();
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn check_hook_failure_is_meta_error() {
        let task = Arc::new(
            Task::data("guarded", |_| Ok(json!(1))).with_check(|_| Err("nope".into())),
        );
        let result = master().execute(Meta::new(), &task, None);
        assert_eq!(result.status(), TaskStatus::MetaError);
        assert_eq!(
            result.meta_error().unwrap().check_error.as_deref(),
            Some("nope")
        );
    }

    #[test]
    fn invocation_failure_is_recorded_and_memoized() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let task = Arc::new(Task::data("flaky", |_| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Err(TaskmeshError::Invocation {
                task: "flaky".into(),
                details: "boom".into(),
            })
        }));
        let mut result = master().execute(Meta::new(), &task, None);
        assert_eq!(result.status(), TaskStatus::ContainsData);

        assert!(result.force().is_err());
        assert_eq!(result.status(), TaskStatus::InvocationError);

        // Second force returns the same memoized error without re-running.
        assert!(result.force().is_err());
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn specification_pass_with_exact_type() {
        let task = Arc::new(
            Task::function("typed", Vec::new(), |meta, _| {
                Ok(meta.get("count").cloned().unwrap_or(json!(null)))
            })
            .with_specification(Specification::new().field("count", ValueType::Int)),
        );
        let meta = Meta::from_value(json!({"count": 3})).unwrap();
        let mut result = master().execute(meta, &task, None);
        assert_eq!(result.status(), TaskStatus::ContainsData);
        assert_eq!(result.force().unwrap(), &json!(3));
    }
}
