//! Workspaces - hierarchical, named registries of tasks
//!
//! A workspace owns tasks (unique names) and child workspaces (unique
//! names), forming a tree addressed by dotted paths such as
//! `sub.child.taskname`. Workspaces are built only through
//! [`WorkspaceBuilder`]; registration records each task's home workspace as
//! an explicit back-reference (no introspection of declaring scopes).
//!
//! The module also hosts the locator registry used by the CLI and the
//! process runner to reconstruct a workspace by name in another process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::TaskmeshError;
use crate::task::Task;

/// Pattern for a single path segment.
static SEGMENT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*$").unwrap());

/// A parsed dotted task path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPath {
    segments: Vec<String>,
}

impl TaskPath {
    pub fn parse(path: &str) -> Result<Self, TaskmeshError> {
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| !SEGMENT_PATTERN.is_match(s)) {
            return Err(TaskmeshError::InvalidPath {
                path: path.to_string(),
            });
        }
        Ok(Self { segments })
    }

    pub fn is_leaf(&self) -> bool {
        self.segments.len() == 1
    }

    /// First segment: selects a child workspace when the path is not a leaf.
    pub fn head(&self) -> &str {
        &self.segments[0]
    }

    /// Everything after the head.
    pub fn sub_path(&self) -> TaskPath {
        TaskPath {
            segments: self.segments[1..].to_vec(),
        }
    }

    /// Last segment: the task name.
    pub fn name(&self) -> &str {
        self.segments.last().expect("path has at least one segment")
    }
}

impl std::fmt::Display for TaskPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

/// Named container of tasks and child workspaces. Immutable once built;
/// shared via `Arc`.
pub struct Workspace {
    name: String,
    tasks: BTreeMap<String, Arc<Task>>,
    children: Vec<Arc<Workspace>>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("name", &self.name)
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("children", &self.children.iter().map(|c| c.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Workspace {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tasks(&self) -> impl Iterator<Item = (&String, &Arc<Task>)> {
        self.tasks.iter()
    }

    pub fn children(&self) -> &[Arc<Workspace>] {
        &self.children
    }

    /// An empty anonymous workspace, used when a task has neither an
    /// explicit workspace nor a recorded home.
    pub fn anonymous() -> Arc<Workspace> {
        WorkspaceBuilder::new("anonymous").build()
    }

    pub fn get_workspace(&self, name: &str) -> Option<&Arc<Workspace>> {
        self.children.iter().find(|w| w.name() == name)
    }

    /// Resolve a dotted path. The head of a multi-segment path selects a
    /// child workspace; a leaf name is looked up locally first and then
    /// cascades into every child (first match wins, cross-child order
    /// unspecified).
    pub fn resolve(&self, path: &TaskPath) -> Option<Arc<Task>> {
        if path.is_leaf() {
            if let Some(task) = self.tasks.get(path.name()) {
                return Some(Arc::clone(task));
            }
            self.children.iter().find_map(|w| w.resolve(path))
        } else {
            self.get_workspace(path.head())
                .and_then(|w| w.resolve(&path.sub_path()))
        }
    }

    /// Resolve a path given as a string.
    pub fn find_task(&self, path: &str) -> Result<Option<Arc<Task>>, TaskmeshError> {
        Ok(self.resolve(&TaskPath::parse(path)?))
    }

    pub fn has_task(&self, path: &str) -> bool {
        matches!(self.find_task(path), Ok(Some(_)))
    }

    /// Tree describing the names of contained tasks and child workspaces.
    pub fn structure(&self) -> Value {
        json!({
            "name": self.name,
            "tasks": self.tasks.keys().collect::<Vec<_>>(),
            "workspaces": self.children.iter().map(|w| w.structure()).collect::<Vec<_>>(),
        })
    }
}

/// Explicit registration builder: one call per task or child workspace.
pub struct WorkspaceBuilder {
    name: String,
    tasks: BTreeMap<String, Arc<Task>>,
    children: Vec<Arc<Workspace>>,
}

impl WorkspaceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// Register a task under its own name. A duplicate name replaces the
    /// earlier registration with a warning.
    pub fn task(self, task: Task) -> Self {
        self.task_arc(Arc::new(task))
    }

    /// Register an already-shared task.
    pub fn task_arc(mut self, task: Arc<Task>) -> Self {
        if self
            .tasks
            .insert(task.name().to_string(), Arc::clone(&task))
            .is_some()
        {
            warn!(task = task.name(), workspace = %self.name, "duplicate task name replaced");
        }
        self
    }

    /// Register a child workspace.
    pub fn child(mut self, workspace: Arc<Workspace>) -> Self {
        if self.children.iter().any(|w| w.name() == workspace.name()) {
            warn!(child = workspace.name(), workspace = %self.name, "duplicate child workspace");
        }
        self.children.push(workspace);
        self
    }

    /// Finalize: freeze the registry and record each task's home workspace.
    pub fn build(self) -> Arc<Workspace> {
        let workspace = Arc::new(Workspace {
            name: self.name,
            tasks: self.tasks,
            children: self.children,
        });
        for task in workspace.tasks.values() {
            task.set_home(&workspace);
        }
        workspace
    }
}

// ─────────────────────────────────────────────────────────────
// Locator registry
// ─────────────────────────────────────────────────────────────

/// Factory producing a workspace for a locator name. Plain function
/// pointers so workers in other processes can rebuild the same workspace.
pub type WorkspaceFactory = fn() -> Arc<Workspace>;

static REGISTRY: Lazy<RwLock<HashMap<String, WorkspaceFactory>>> = Lazy::new(|| {
    let mut map: HashMap<String, WorkspaceFactory> = HashMap::new();
    map.insert("demo".to_string(), demo_workspace);
    RwLock::new(map)
});

/// Register a workspace factory under a locator name.
pub fn register(name: &str, factory: WorkspaceFactory) {
    REGISTRY
        .write()
        .expect("workspace registry poisoned")
        .insert(name.to_string(), factory);
}

/// Build the workspace registered under `locator`.
pub fn resolve(locator: &str) -> Result<Arc<Workspace>, TaskmeshError> {
    let factory = REGISTRY
        .read()
        .expect("workspace registry poisoned")
        .get(locator)
        .copied();
    match factory {
        Some(factory) => Ok(factory()),
        None => Err(TaskmeshError::UnknownWorkspace(locator.to_string())),
    }
}

/// Built-in demonstration workspace, registered under `"demo"`.
///
/// Serves the CLI examples, the process-runner workers and the integration
/// tests: a tiny arithmetic chain plus a specification-guarded task, a
/// pausable chain, a combinator pipeline and a child workspace.
pub fn demo_workspace() -> Arc<Workspace> {
    use crate::meta::{Specification, ValueType};

    let sub = WorkspaceBuilder::new("sub")
        .task(Task::data("c", |_meta| Ok(json!("hello from sub"))))
        .build();

    WorkspaceBuilder::new("demo")
        .task(Task::data("a", |_meta| Ok(json!(1))))
        .task(Task::function(
            "b",
            vec!["a".to_string()],
            |_meta, deps| {
                let a = deps["a"].as_i64().unwrap_or(0);
                Ok(json!(a + 1))
            },
        ))
        .task(
            Task::function("counted", Vec::new(), |meta, _deps| {
                let count = meta.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(json!(count * 2))
            })
            .with_specification(Specification::new().field("count", ValueType::Int)),
        )
        .task(Task::data("numbers", |meta| {
            let upto = meta.get("upto").and_then(|v| v.as_i64()).unwrap_or(5);
            Ok(Value::Array((1..=upto).map(|n| json!(n)).collect()))
        }))
        .task(Task::map("numbers", |v| {
            let n = v.as_i64().unwrap_or(0);
            json!(n * n)
        }))
        .task(Task::reduce("map_numbers", |acc, v| {
            json!(acc.as_i64().unwrap_or(0) + v.as_i64().unwrap_or(0))
        }))
        .task(Task::data("pause", |meta| {
            let millis = meta.get("millis").and_then(|v| v.as_u64()).unwrap_or(0);
            std::thread::sleep(std::time::Duration::from_millis(millis));
            Ok(json!(millis))
        }))
        .task(Task::function(
            "after_pause",
            vec!["pause".to_string()],
            |_meta, deps| Ok(deps["pause"].clone()),
        ))
        .child(sub)
        .build()
}
